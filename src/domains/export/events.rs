use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, SqlitePool};
use uuid::Uuid;

use crate::errors::{DbError, DbResult};
use crate::types::{format_timestamp, parse_timestamp};

use super::types::{DeliveryMode, EntityType, ExportEvent, ExportFormat};

const TABLE: &str = "export_events";

/// Append-only log of successful exports.
#[async_trait]
pub trait ExportEventRepository: Send + Sync {
    async fn record(&self, event: &ExportEvent) -> DbResult<()>;

    /// Events at or after `since`, oldest first.
    async fn list_since(&self, since: DateTime<Utc>) -> DbResult<Vec<ExportEvent>>;
}

pub struct SqliteExportEventRepository {
    pool: SqlitePool,
}

impl SqliteExportEventRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct EventRow {
    id: String,
    entity_type: String,
    format: String,
    delivery_mode: String,
    user_id: String,
    row_count: i64,
    occurred_at: String,
}

impl EventRow {
    fn into_event(self) -> DbResult<ExportEvent> {
        let uuid = |value: &str| {
            Uuid::parse_str(value).map_err(|e| DbError::corrupt(TABLE, format!("bad uuid '{}': {}", value, e)))
        };
        Ok(ExportEvent {
            id: uuid(&self.id)?,
            entity_type: EntityType::from_str(&self.entity_type)
                .ok_or_else(|| DbError::corrupt(TABLE, format!("unknown entity type {}", self.entity_type)))?,
            format: ExportFormat::from_str(&self.format)
                .ok_or_else(|| DbError::corrupt(TABLE, format!("unknown format {}", self.format)))?,
            delivery_mode: DeliveryMode::from_str(&self.delivery_mode)
                .ok_or_else(|| DbError::corrupt(TABLE, format!("unknown delivery mode {}", self.delivery_mode)))?,
            user_id: uuid(&self.user_id)?,
            row_count: self.row_count.max(0) as u64,
            occurred_at: parse_timestamp(TABLE, &self.occurred_at)?,
        })
    }
}

#[async_trait]
impl ExportEventRepository for SqliteExportEventRepository {
    async fn record(&self, event: &ExportEvent) -> DbResult<()> {
        query(
            "INSERT INTO export_events (id, entity_type, format, delivery_mode, user_id, row_count, occurred_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(event.id.to_string())
        .bind(event.entity_type.as_str())
        .bind(event.format.as_str())
        .bind(event.delivery_mode.as_str())
        .bind(event.user_id.to_string())
        .bind(event.row_count as i64)
        .bind(format_timestamp(&event.occurred_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn list_since(&self, since: DateTime<Utc>) -> DbResult<Vec<ExportEvent>> {
        let rows: Vec<EventRow> =
            query_as("SELECT * FROM export_events WHERE occurred_at >= ? ORDER BY occurred_at")
                .bind(format_timestamp(&since))
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(EventRow::into_event).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::test_support::memory_pool;
    use chrono::Duration;

    #[tokio::test]
    async fn lists_events_from_a_cutoff() {
        let repo = SqliteExportEventRepository::new(memory_pool().await);
        let user = Uuid::new_v4();
        let mut old = ExportEvent::new(EntityType::Invoice, ExportFormat::Csv, DeliveryMode::Sync, user, 10);
        old.occurred_at = Utc::now() - Duration::days(40);
        let recent = ExportEvent::new(EntityType::Vehicle, ExportFormat::Document, DeliveryMode::Async, user, 2);
        repo.record(&old).await.unwrap();
        repo.record(&recent).await.unwrap();

        let events = repo.list_since(Utc::now() - Duration::days(30)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].id, recent.id);
        assert_eq!(events[0].format, ExportFormat::Document);
        assert_eq!(repo.list_since(old.occurred_at).await.unwrap().len(), 2);
    }
}
