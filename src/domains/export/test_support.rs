//! Fixtures shared by the export tests.

use async_trait::async_trait;
use serde_json::Value;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::SqlitePool;
use std::sync::Mutex;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::db_migration::run_migrations;
use crate::domains::export::entities::projection;
use crate::domains::export::record_source::{RecordPage, RecordQuery, RecordSource};
use crate::domains::export::schema::Record;
use crate::domains::export::types::EntityType;
use crate::errors::{ExportError, ExportResult};
use crate::types::UserRole;

/// Fresh in-memory database with every migration applied.
///
/// A single connection that never idles out, otherwise each new connection
/// would see an empty database.
pub async fn memory_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .idle_timeout(None)
        .max_lifetime(None)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    run_migrations(&pool).await.expect("migrations");
    pool
}

pub fn record(value: Value) -> Record {
    value.as_object().cloned().expect("record fixtures are objects")
}

pub fn auth(role: UserRole, tenant_id: Uuid) -> AuthContext {
    AuthContext::new(Uuid::new_v4(), tenant_id, role)
}

/// Record store held in memory, honouring tenant and date range like the SQLite one.
#[derive(Default)]
pub struct InMemoryRecordSource {
    records: Mutex<Vec<(EntityType, Uuid, Record)>>,
}

impl InMemoryRecordSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, entity_type: EntityType, tenant_id: Uuid, record: Record) {
        self.records.lock().unwrap().push((entity_type, tenant_id, record));
    }

    fn matching(&self, q: &RecordQuery) -> Vec<(usize, Record)> {
        let projection = projection(q.entity_type).unwrap();
        self.records
            .lock()
            .unwrap()
            .iter()
            .enumerate()
            .filter(|(_, (entity, tenant, record))| {
                *entity == q.entity_type
                    && *tenant == q.tenant_id
                    && (q.range.is_open()
                        || projection
                            .record_timestamp(record)
                            .map_or(false, |at| q.range.contains(&at)))
            })
            .map(|(seq, (_, _, record))| (seq + 1, record.clone()))
            .collect()
    }
}

#[async_trait]
impl RecordSource for InMemoryRecordSource {
    async fn fetch_page(&self, q: &RecordQuery, after: Option<i64>, limit: usize) -> ExportResult<RecordPage> {
        let after = after.unwrap_or(0) as usize;
        let page: Vec<_> = self
            .matching(q)
            .into_iter()
            .filter(|(seq, _)| *seq > after)
            .take(limit)
            .collect();
        let next_cursor = if page.len() == limit {
            page.last().map(|(seq, _)| *seq as i64)
        } else {
            None
        };
        Ok(RecordPage {
            records: page.into_iter().map(|(_, r)| r).collect(),
            next_cursor,
        })
    }

    async fn count(&self, q: &RecordQuery) -> ExportResult<u64> {
        Ok(self.matching(q).len() as u64)
    }

    async fn insert_record(&self, entity_type: EntityType, tenant_id: Uuid, mut payload: Record) -> ExportResult<String> {
        let id = match payload.get("id").and_then(Value::as_str) {
            Some(id) => id.to_string(),
            None => {
                let id = Uuid::new_v4().to_string();
                payload.insert("id".to_string(), Value::String(id.clone()));
                id
            }
        };
        self.push(entity_type, tenant_id, payload);
        Ok(id)
    }
}

#[derive(Clone, Copy)]
enum Fault {
    Error,
    Panic,
}

/// Serves `good` records, then fails every later page.
pub struct FailingRecordSource {
    good: usize,
    fault: Fault,
    count_fails: bool,
}

impl FailingRecordSource {
    pub fn after_records(good: usize) -> Self {
        Self { good, fault: Fault::Error, count_fails: false }
    }

    pub fn panicking_after(good: usize) -> Self {
        Self { good, fault: Fault::Panic, count_fails: false }
    }

    /// Cannot count and has no readable pages.
    pub fn unreachable() -> Self {
        Self { good: 0, fault: Fault::Error, count_fails: true }
    }
}

#[async_trait]
impl RecordSource for FailingRecordSource {
    async fn fetch_page(&self, _q: &RecordQuery, after: Option<i64>, limit: usize) -> ExportResult<RecordPage> {
        let start = after.unwrap_or(0) as usize;
        if start >= self.good {
            return match self.fault {
                Fault::Error => Err(ExportError::RowSourceFault("record store connection reset".to_string())),
                Fault::Panic => panic!("record decoder bug"),
            };
        }
        let end = (start + limit).min(self.good);
        let records = (start..end)
            .map(|n| record(serde_json::json!({"id": format!("r{}", n), "status": "open"})))
            .collect();
        Ok(RecordPage {
            records,
            next_cursor: Some(end as i64),
        })
    }

    async fn count(&self, _q: &RecordQuery) -> ExportResult<u64> {
        if self.count_fails {
            return Err(ExportError::RowSourceFault("count timeout".to_string()));
        }
        Ok(self.good as u64)
    }

    async fn insert_record(&self, _entity_type: EntityType, _tenant_id: Uuid, _payload: Record) -> ExportResult<String> {
        Err(ExportError::RowSourceFault("record store is read-only".to_string()))
    }
}

/// Holds every page request until [`GatedRecordSource::open`] is called.
pub struct GatedRecordSource {
    inner: InMemoryRecordSource,
    gate: tokio::sync::Semaphore,
}

impl GatedRecordSource {
    pub fn new(inner: InMemoryRecordSource) -> Self {
        Self { inner, gate: tokio::sync::Semaphore::new(0) }
    }

    pub fn open(&self) {
        self.gate.add_permits(1_000_000);
    }
}

#[async_trait]
impl RecordSource for GatedRecordSource {
    async fn fetch_page(&self, q: &RecordQuery, after: Option<i64>, limit: usize) -> ExportResult<RecordPage> {
        let _permit = self
            .gate
            .acquire()
            .await
            .map_err(|_| ExportError::RowSourceFault("gate closed".to_string()))?;
        self.inner.fetch_page(q, after, limit).await
    }

    async fn count(&self, q: &RecordQuery) -> ExportResult<u64> {
        self.inner.count(q).await
    }

    async fn insert_record(&self, entity_type: EntityType, tenant_id: Uuid, payload: Record) -> ExportResult<String> {
        self.inner.insert_record(entity_type, tenant_id, payload).await
    }
}
