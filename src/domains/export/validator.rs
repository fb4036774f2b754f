use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use std::collections::HashSet;
use uuid::Uuid;

use crate::domains::export::entities::{projection, EntityProjection};
use crate::domains::export::preferences::ColumnPreferenceService;
use crate::domains::export::types::{
    DateRange, DeliveryMode, EntityType, ExportFormat, ExportRequest, RawExportRequest,
};
use crate::errors::{ExportError, ExportResult};
use crate::types::format_timestamp;

/// Which end of a date range a raw value belongs to. Bare dates expand to
/// the first or last instant of that day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Bound {
    Start,
    End,
}

impl Bound {
    fn field(&self) -> &'static str {
        match self {
            Bound::Start => "startDate",
            Bound::End => "endDate",
        }
    }
}

/// Turns raw caller input into a normalized [`ExportRequest`].
#[derive(Clone)]
pub struct RequestValidator {
    preferences: ColumnPreferenceService,
}

impl RequestValidator {
    pub fn new(preferences: ColumnPreferenceService) -> Self {
        Self { preferences }
    }

    /// Validate `raw` on behalf of `user_id`.
    ///
    /// Missing columns are filled from the user's saved preference, then the
    /// full schema. Nothing is partially accepted: the first failing check
    /// rejects the whole request.
    pub async fn normalize(&self, raw: &RawExportRequest, user_id: Uuid) -> ExportResult<ExportRequest> {
        let entity_type = EntityType::from_str(&raw.entity_type)
            .ok_or_else(|| ExportError::UnsupportedEntityType(raw.entity_type.clone()))?;
        let format = ExportFormat::from_str(&raw.format)
            .ok_or_else(|| ExportError::UnsupportedFormat(raw.format.clone()))?;
        let delivery_mode = parse_delivery_mode(raw.delivery_mode.as_deref(), raw.stream)?;
        let date_range = parse_date_range(raw.start_date.as_deref(), raw.end_date.as_deref())?;

        let projection = projection(entity_type)?;
        let columns = match raw.columns.as_deref() {
            Some(requested) if !requested.is_empty() => validate_columns(projection.as_ref(), requested)?,
            _ => {
                let preferred = self.preferences.get(user_id, entity_type).await?;
                // A saved preference can go stale if the schema changes
                validate_columns(projection.as_ref(), &preferred)?
            }
        };

        Ok(ExportRequest {
            entity_type,
            format,
            date_range,
            columns,
            delivery_mode,
        })
    }
}

/// Check every key against the entity's schema. All offenders are reported
/// together; duplicates keep their first position.
pub fn validate_columns(projection: &dyn EntityProjection, requested: &[String]) -> ExportResult<Vec<String>> {
    let mut unknown = Vec::new();
    let mut seen = HashSet::new();
    let mut accepted = Vec::with_capacity(requested.len());

    for key in requested {
        let key = key.trim();
        if projection.column(key).is_none() {
            unknown.push(key.to_string());
        } else if seen.insert(key.to_string()) {
            accepted.push(key.to_string());
        }
    }

    if !unknown.is_empty() {
        return Err(ExportError::unknown_columns(projection.entity_type().as_str(), unknown));
    }
    Ok(accepted)
}

fn parse_delivery_mode(raw: Option<&str>, stream: Option<bool>) -> ExportResult<DeliveryMode> {
    let mode = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        None => DeliveryMode::Sync,
        Some(value) => DeliveryMode::from_str(value)
            .ok_or_else(|| ExportError::UnsupportedDeliveryMode(value.to_string()))?,
    };
    Ok(match (mode, stream) {
        (DeliveryMode::Sync, Some(true)) => DeliveryMode::Stream,
        (mode, _) => mode,
    })
}

fn parse_date_range(start: Option<&str>, end: Option<&str>) -> ExportResult<DateRange> {
    let start = parse_date(start, Bound::Start)?;
    let end = parse_date(end, Bound::End)?;
    if let (Some(s), Some(e)) = (start, end) {
        if s > e {
            return Err(ExportError::InvalidRange {
                start: format_timestamp(&s),
                end: format_timestamp(&e),
            });
        }
    }
    Ok(DateRange { start, end })
}

fn parse_date(raw: Option<&str>, bound: Bound) -> ExportResult<Option<DateTime<Utc>>> {
    let raw = match raw.map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => raw,
        None => return Ok(None),
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(Some(dt.with_timezone(&Utc)));
    }

    let invalid = || ExportError::InvalidDate {
        field: bound.field().to_string(),
        value: raw.to_string(),
    };
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d").map_err(|_| invalid())?;
    let time = match bound {
        Bound::Start => NaiveTime::MIN,
        Bound::End => NaiveTime::from_hms_milli_opt(23, 59, 59, 999).ok_or_else(invalid)?,
    };
    Ok(Some(date.and_time(time).and_utc()))
}
