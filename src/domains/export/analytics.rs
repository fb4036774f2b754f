use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use crate::domains::export::events::ExportEventRepository;
use crate::domains::export::types::{EntityType, ExportEvent};
use crate::errors::{ExportError, ExportResult};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TypeCount {
    pub entity_type: EntityType,
    pub count: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DayCount {
    pub day: NaiveDate,
    pub count: u64,
}

/// Export activity over one trailing period. Only days with activity appear
/// in `daily_counts`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsWindow {
    pub since: DateTime<Utc>,
    pub until: DateTime<Utc>,
    pub days: u32,
    pub total: u64,
    pub type_counts: Vec<TypeCount>,
    pub daily_counts: BTreeMap<NaiveDate, u64>,
    pub top_days: Vec<DayCount>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricComparison {
    pub current: u64,
    pub previous: u64,
    pub delta: i64,
    /// Percent change, unrounded
    pub percentage: f64,
}

impl MetricComparison {
    pub fn new(current: u64, previous: u64) -> Self {
        Self {
            current,
            previous,
            delta: current as i64 - previous as i64,
            percentage: percentage_change(current, previous),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsComparison {
    pub current: AnalyticsWindow,
    pub previous: AnalyticsWindow,
    /// `total`, `activeDays`, and `type:<entity>` for every entity seen in either window
    pub metrics: BTreeMap<String, MetricComparison>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum AnalyticsReport {
    Window(AnalyticsWindow),
    Comparison(AnalyticsComparison),
}

/// Period-over-period change in percent.
///
/// Growth from nothing counts as 100%; no activity in either period is 0%.
/// The value is not rounded.
pub fn percentage_change(current: u64, previous: u64) -> f64 {
    if previous == 0 {
        return if current > 0 { 100.0 } else { 0.0 };
    }
    let delta = current as f64 - previous as f64;
    delta / previous as f64 * 100.0
}

/// Bucket `events` into a window. Callers pass only events inside it.
pub fn aggregate<'a, I>(events: I, since: DateTime<Utc>, until: DateTime<Utc>, days: u32, top_n: usize) -> AnalyticsWindow
where
    I: IntoIterator<Item = &'a ExportEvent>,
{
    let mut total = 0u64;
    let mut by_type: HashMap<EntityType, u64> = HashMap::new();
    let mut daily_counts: BTreeMap<NaiveDate, u64> = BTreeMap::new();
    for event in events {
        total += 1;
        *by_type.entry(event.entity_type).or_default() += 1;
        *daily_counts.entry(event.occurred_at.date_naive()).or_default() += 1;
    }

    let mut type_counts: Vec<TypeCount> = by_type
        .into_iter()
        .map(|(entity_type, count)| TypeCount { entity_type, count })
        .collect();
    type_counts.sort_by(|a, b| b.count.cmp(&a.count).then(a.entity_type.as_str().cmp(b.entity_type.as_str())));

    let mut top_days: Vec<DayCount> = daily_counts
        .iter()
        .map(|(day, count)| DayCount { day: *day, count: *count })
        .collect();
    // Ties go to the earlier day
    top_days.sort_by(|a, b| b.count.cmp(&a.count).then(a.day.cmp(&b.day)));
    top_days.truncate(top_n);

    AnalyticsWindow {
        since,
        until,
        days,
        total,
        type_counts,
        daily_counts,
        top_days,
    }
}

fn type_count(window: &AnalyticsWindow, entity_type: EntityType) -> u64 {
    window
        .type_counts
        .iter()
        .find(|t| t.entity_type == entity_type)
        .map_or(0, |t| t.count)
}

pub fn compare(current: AnalyticsWindow, previous: AnalyticsWindow) -> AnalyticsComparison {
    let mut metrics = BTreeMap::new();
    metrics.insert("total".to_string(), MetricComparison::new(current.total, previous.total));
    metrics.insert(
        "activeDays".to_string(),
        MetricComparison::new(current.daily_counts.len() as u64, previous.daily_counts.len() as u64),
    );
    for entity_type in EntityType::ALL {
        let (now, before) = (type_count(&current, entity_type), type_count(&previous, entity_type));
        if now > 0 || before > 0 {
            metrics.insert(format!("type:{}", entity_type), MetricComparison::new(now, before));
        }
    }
    AnalyticsComparison {
        current,
        previous,
        metrics,
    }
}

/// Read path over the export event log.
#[derive(Clone)]
pub struct AnalyticsService {
    events: Arc<dyn ExportEventRepository>,
    top_days: usize,
    max_days: u32,
}

impl AnalyticsService {
    pub fn new(events: Arc<dyn ExportEventRepository>, top_days: usize, max_days: u32) -> Self {
        Self {
            events,
            top_days,
            max_days,
        }
    }

    /// The trailing `days` ending at `now`, optionally alongside the equal-length
    /// window immediately before it.
    pub async fn report(&self, days: i64, compare_previous: bool, now: DateTime<Utc>) -> ExportResult<AnalyticsReport> {
        if days < 1 || days > self.max_days as i64 {
            return Err(ExportError::InvalidWindow {
                days,
                max: self.max_days,
            });
        }
        let length = Duration::days(days);
        let since = now - length;
        let previous_since = since - length;

        let fetch_from = if compare_previous { previous_since } else { since };
        let events = self.events.list_since(fetch_from).await?;

        let current = aggregate(
            events.iter().filter(|e| e.occurred_at >= since && e.occurred_at <= now),
            since,
            now,
            days as u32,
            self.top_days,
        );
        if !compare_previous {
            return Ok(AnalyticsReport::Window(current));
        }

        let previous = aggregate(
            events.iter().filter(|e| e.occurred_at >= previous_since && e.occurred_at < since),
            previous_since,
            since,
            days as u32,
            self.top_days,
        );
        log::debug!(
            "Export analytics over {} days: {} now, {} before",
            days,
            current.total,
            previous.total
        );
        Ok(AnalyticsReport::Comparison(compare(current, previous)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::events::SqliteExportEventRepository;
    use crate::domains::export::test_support::memory_pool;
    use crate::domains::export::types::{DeliveryMode, ExportFormat};
    use chrono::TimeZone;
    use uuid::Uuid;

    fn event(entity_type: EntityType, at: DateTime<Utc>) -> ExportEvent {
        let mut event = ExportEvent::new(entity_type, ExportFormat::Csv, DeliveryMode::Sync, Uuid::new_v4(), 1);
        event.occurred_at = at;
        event
    }

    #[test]
    fn percentage_handles_zero_denominators() {
        assert_eq!(percentage_change(5, 0), 100.0);
        assert_eq!(percentage_change(0, 0), 0.0);
        assert_eq!(percentage_change(15, 10), 50.0);
        assert_eq!(percentage_change(5, 10), -50.0);
        assert!((percentage_change(1, 3) - (-200.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn buckets_by_type_and_active_day() {
        let day = |d: u32, h: u32| Utc.with_ymd_and_hms(2025, 6, d, h, 0, 0).unwrap();
        let events = vec![
            event(EntityType::Invoice, day(1, 9)),
            event(EntityType::Invoice, day(1, 17)),
            event(EntityType::Customer, day(3, 8)),
            event(EntityType::Invoice, day(4, 8)),
            event(EntityType::Customer, day(4, 9)),
        ];
        let window = aggregate(&events, day(1, 0), day(7, 0), 6, 1);

        assert_eq!(window.total, 5);
        assert_eq!(window.type_counts[0], TypeCount { entity_type: EntityType::Invoice, count: 3 });
        assert_eq!(window.daily_counts.len(), 3);
        assert!(!window.daily_counts.contains_key(&day(2, 0).date_naive()));
        // Days 1 and 4 tie; the earlier day wins the single slot
        assert_eq!(window.top_days, vec![DayCount { day: day(1, 0).date_naive(), count: 2 }]);
    }

    #[test]
    fn empty_window_has_no_days() {
        let now = Utc::now();
        let window = aggregate(std::iter::empty::<&ExportEvent>(), now - Duration::days(7), now, 7, 5);
        assert_eq!(window.total, 0);
        assert!(window.daily_counts.is_empty());
        assert!(window.top_days.is_empty());
    }

    #[tokio::test]
    async fn compares_against_the_preceding_window() {
        let repo = Arc::new(SqliteExportEventRepository::new(memory_pool().await));
        let now = Utc.with_ymd_and_hms(2025, 6, 30, 12, 0, 0).unwrap();
        for offset in 1..=10 {
            repo.record(&event(EntityType::Invoice, now - Duration::days(7) - Duration::hours(offset)))
                .await
                .unwrap();
        }
        for offset in 1..=15 {
            repo.record(&event(EntityType::Invoice, now - Duration::hours(offset))).await.unwrap();
        }
        repo.record(&event(EntityType::Staff, now - Duration::hours(2))).await.unwrap();

        let service = AnalyticsService::new(repo, 5, 366);
        let report = service.report(7, true, now).await.unwrap();
        let comparison = match report {
            AnalyticsReport::Comparison(c) => c,
            other => panic!("expected a comparison, got {:?}", other),
        };
        assert_eq!(comparison.previous.total, 10);
        assert_eq!(comparison.current.total, 16);
        assert_eq!(comparison.metrics["type:invoice"].percentage, 50.0);
        assert_eq!(comparison.metrics["type:invoice"].delta, 5);
        assert_eq!(comparison.metrics["type:staff"].percentage, 100.0);
        assert!(!comparison.metrics.contains_key("type:vehicle"));
        assert_eq!(comparison.metrics["total"].delta, 6);
    }

    #[tokio::test]
    async fn rejects_out_of_range_windows() {
        let service = AnalyticsService::new(
            Arc::new(SqliteExportEventRepository::new(memory_pool().await)),
            5,
            30,
        );
        for days in [0, -1, 31] {
            assert!(matches!(
                service.report(days, false, Utc::now()).await,
                Err(ExportError::InvalidWindow { .. })
            ));
        }
        match service.report(30, false, Utc::now()).await.unwrap() {
            AnalyticsReport::Window(w) => assert_eq!(w.total, 0),
            other => panic!("expected a window, got {:?}", other),
        }
    }
}
