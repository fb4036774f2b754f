use async_trait::async_trait;
use serde_json::Value;
use sqlx::{query, QueryBuilder, Sqlite, SqlitePool};
use uuid::Uuid;

use crate::domains::export::entities::projection;
use crate::domains::export::schema::Record;
use crate::domains::export::types::{DateRange, EntityType};
use crate::errors::{ExportError, ExportResult};
use crate::types::format_timestamp;

/// The slice of the record store one export reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordQuery {
    pub entity_type: EntityType,
    pub tenant_id: Uuid,
    pub range: DateRange,
}

/// One page of records plus the cursor to resume after, if more remain.
#[derive(Debug, Clone, Default)]
pub struct RecordPage {
    pub records: Vec<Record>,
    pub next_cursor: Option<i64>,
}

/// The durable record store as the exporter sees it.
///
/// Paging is cursor based so a producer never needs the whole set in memory.
#[async_trait]
pub trait RecordSource: Send + Sync {
    async fn fetch_page(&self, query: &RecordQuery, after: Option<i64>, limit: usize) -> ExportResult<RecordPage>;

    /// Records matching tenant and date range. Owner scoping is not applied, so
    /// this is an upper bound on what a restricted requester receives.
    async fn count(&self, query: &RecordQuery) -> ExportResult<u64>;

    /// Store (or replace) a record. The id comes from the payload's `id` field or is generated.
    /// Ids are unique per tenant; the same id under another tenant is a separate record.
    async fn insert_record(&self, entity_type: EntityType, tenant_id: Uuid, payload: Record) -> ExportResult<String>;
}

pub struct SqliteRecordSource {
    pool: SqlitePool,
}

impl SqliteRecordSource {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

/// Shared WHERE clause for page and count queries.
fn push_filters<'a>(builder: &mut QueryBuilder<'a, Sqlite>, q: &RecordQuery) {
    builder
        .push(" WHERE entity_type = ")
        .push_bind(q.entity_type.as_str())
        .push(" AND tenant_id = ")
        .push_bind(q.tenant_id.to_string());
    if let Some(start) = q.range.start {
        builder.push(" AND recorded_at >= ").push_bind(format_timestamp(&start));
    }
    if let Some(end) = q.range.end {
        builder.push(" AND recorded_at <= ").push_bind(format_timestamp(&end));
    }
}

fn source_fault(e: sqlx::Error) -> ExportError {
    ExportError::RowSourceFault(e.to_string())
}

#[async_trait]
impl RecordSource for SqliteRecordSource {
    async fn fetch_page(&self, q: &RecordQuery, after: Option<i64>, limit: usize) -> ExportResult<RecordPage> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT seq, payload FROM portal_records");
        push_filters(&mut builder, q);
        builder
            .push(" AND seq > ")
            .push_bind(after.unwrap_or(0))
            .push(" ORDER BY seq LIMIT ")
            .push_bind(limit as i64);

        let rows = builder
            .build_query_as::<(i64, String)>()
            .fetch_all(&self.pool)
            .await
            .map_err(source_fault)?;

        let full_page = rows.len() == limit;
        let mut records = Vec::with_capacity(rows.len());
        let mut last_seq = None;
        for (seq, payload) in rows {
            let record = serde_json::from_str::<Record>(&payload).map_err(|e| {
                ExportError::RowSourceFault(format!("Record {} has an unreadable payload: {}", seq, e))
            })?;
            records.push(record);
            last_seq = Some(seq);
        }

        Ok(RecordPage {
            records,
            next_cursor: if full_page { last_seq } else { None },
        })
    }

    async fn count(&self, q: &RecordQuery) -> ExportResult<u64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) FROM portal_records");
        push_filters(&mut builder, q);
        let (count,) = builder
            .build_query_as::<(i64,)>()
            .fetch_one(&self.pool)
            .await
            .map_err(source_fault)?;
        Ok(count.max(0) as u64)
    }

    /// The entity's canonical timestamp is indexed for range filtering.
    async fn insert_record(&self, entity_type: EntityType, tenant_id: Uuid, mut payload: Record) -> ExportResult<String> {
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(id) if !id.trim().is_empty() => id.trim().to_string(),
            _ => {
                let generated = Uuid::new_v4().to_string();
                payload.insert("id".to_string(), Value::String(generated.clone()));
                generated
            }
        };
        let recorded_at = projection(entity_type)?
            .record_timestamp(&payload)
            .map(|at| format_timestamp(&at));
        let encoded = serde_json::to_string(&payload)
            .map_err(|e| ExportError::Internal(format!("Failed to encode record: {}", e)))?;

        query(
            "INSERT INTO portal_records (id, entity_type, tenant_id, recorded_at, payload) VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(entity_type, tenant_id, id) DO UPDATE SET
                recorded_at = excluded.recorded_at,
                payload = excluded.payload",
        )
        .bind(&id)
        .bind(entity_type.as_str())
        .bind(tenant_id.to_string())
        .bind(recorded_at)
        .bind(encoded)
        .execute(&self.pool)
        .await
        .map_err(|e| ExportError::Database(e.into()))?;

        Ok(id)
    }
}
