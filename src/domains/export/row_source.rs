use futures::{FutureExt, Stream};
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::domains::export::entities::{projection, resolve_columns};
use crate::domains::export::record_source::{RecordQuery, RecordSource};
use crate::domains::export::schema::ExportRow;
use crate::domains::export::types::{ExportRequest, ExportScope};
use crate::errors::{panic_message, ExportError, ExportResult};

/// Lazy, single-pass row sequence. A fault is delivered as the final item;
/// the stream only ends cleanly once every record has been read.
pub type RowStream = Pin<Box<dyn Stream<Item = ExportResult<ExportRow>> + Send>>;

/// Rows in flight between the producer task and the encoder.
const ROW_CHANNEL_CAPACITY: usize = 64;

/// Projects scoped records into export rows for one request.
#[derive(Clone)]
pub struct RowSource {
    records: Arc<dyn RecordSource>,
    batch_size: usize,
}

impl RowSource {
    pub fn new(records: Arc<dyn RecordSource>, batch_size: usize) -> Self {
        Self {
            records,
            batch_size: batch_size.max(1),
        }
    }

    fn record_query(request: &ExportRequest, scope: &ExportScope) -> RecordQuery {
        RecordQuery {
            entity_type: request.entity_type,
            tenant_id: scope.tenant_id,
            range: request.date_range,
        }
    }

    /// Upper bound on the rows `open` would yield.
    pub async fn estimate(&self, request: &ExportRequest, scope: &ExportScope) -> ExportResult<u64> {
        self.records.count(&Self::record_query(request, scope)).await
    }

    /// Start producing rows. Records are fetched a page at a time; the producer
    /// stops as soon as the consumer drops the stream.
    pub fn open(&self, request: &ExportRequest, scope: &ExportScope) -> ExportResult<RowStream> {
        let projection = projection(request.entity_type)?;
        let columns = resolve_columns(projection.as_ref(), &request.columns);
        let query = Self::record_query(request, scope);
        let scope = *scope;
        let records = self.records.clone();
        let batch_size = self.batch_size;

        let (tx, rx) = mpsc::channel(ROW_CHANNEL_CAPACITY);
        let fault_tx = tx.clone();
        let entity_type = query.entity_type;
        let producer = async move {
            let mut cursor = None;
            loop {
                let page = match records.fetch_page(&query, cursor, batch_size).await {
                    Ok(page) => page,
                    Err(e) => {
                        log::warn!("Record source failed for {} export: {}", query.entity_type, e);
                        let _ = tx.send(Err(e)).await;
                        return;
                    }
                };

                for record in &page.records {
                    // The date filter is pushed down to the store; re-check only what it cannot see
                    if !projection.scope_matches(record, &scope) {
                        continue;
                    }
                    if tx.send(Ok(projection.project_row(record, &columns))).await.is_err() {
                        log::debug!("Row consumer for {} export went away", query.entity_type);
                        return;
                    }
                }

                match page.next_cursor {
                    Some(next) => cursor = Some(next),
                    None => return,
                }
            }
        };
        tokio::spawn(async move {
            if let Err(panic) = AssertUnwindSafe(producer).catch_unwind().await {
                let message = panic_message(panic.as_ref());
                log::error!("Record source panicked during {} export: {}", entity_type, message);
                let fault = ExportError::RowSourceFault(format!("record source panicked: {}", message));
                let _ = fault_tx.send(Err(fault)).await;
            }
        });

        Ok(Box::pin(ReceiverStream::new(rx)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::test_support::{record, FailingRecordSource, InMemoryRecordSource};
    use crate::domains::export::types::{DateRange, DeliveryMode, EntityType, ExportFormat};
    use futures::StreamExt;
    use serde_json::json;
    use uuid::Uuid;

    fn request(columns: &[&str]) -> ExportRequest {
        ExportRequest {
            entity_type: EntityType::Service,
            format: ExportFormat::Csv,
            date_range: DateRange::default(),
            columns: columns.iter().map(|c| c.to_string()).collect(),
            delivery_mode: DeliveryMode::Sync,
        }
    }

    #[tokio::test]
    async fn yields_projected_rows_across_pages() {
        let tenant = Uuid::new_v4();
        let source = InMemoryRecordSource::new();
        for n in 0..7 {
            source.push(EntityType::Service, tenant, record(json!({"id": format!("s{}", n), "status": "open"})));
        }
        let rows = RowSource::new(Arc::new(source), 3);
        let scope = ExportScope { tenant_id: tenant, owner_id: Uuid::new_v4(), restrict_to_owner: false };

        let collected: Vec<_> = rows.open(&request(&["status", "id"]), &scope).unwrap().collect().await;
        assert_eq!(collected.len(), 7);
        let last = collected.last().unwrap().as_ref().unwrap();
        assert_eq!(last.values().collect::<Vec<_>>(), vec!["open", "s6"]);
        assert_eq!(rows.estimate(&request(&["id"]), &scope).await.unwrap(), 7);
    }

    #[tokio::test]
    async fn owner_scope_applies_before_projection() {
        let tenant = Uuid::new_v4();
        let owner = Uuid::new_v4();
        let source = InMemoryRecordSource::new();
        source.push(EntityType::Service, tenant, record(json!({"id": "mine", "customer_id": owner.to_string()})));
        source.push(EntityType::Service, tenant, record(json!({"id": "theirs", "customer_id": Uuid::new_v4().to_string()})));
        let rows = RowSource::new(Arc::new(source), 10);
        let scope = ExportScope { tenant_id: tenant, owner_id: owner, restrict_to_owner: true };

        let collected: Vec<_> = rows.open(&request(&["id"]), &scope).unwrap().collect().await;
        assert_eq!(collected.len(), 1);
        assert_eq!(collected[0].as_ref().unwrap().get("id"), "mine");
    }

    #[tokio::test]
    async fn source_fault_ends_the_stream_with_an_error() {
        let rows = RowSource::new(Arc::new(FailingRecordSource::after_records(2)), 1);
        let scope = ExportScope { tenant_id: Uuid::new_v4(), owner_id: Uuid::new_v4(), restrict_to_owner: false };
        let collected: Vec<_> = rows.open(&request(&["id"]), &scope).unwrap().collect().await;
        assert_eq!(collected.len(), 3);
        assert!(collected[..2].iter().all(|r| r.is_ok()));
        assert!(matches!(collected[2], Err(ExportError::RowSourceFault(_))));
    }

    #[tokio::test]
    async fn panicking_source_never_looks_complete() {
        let rows = RowSource::new(Arc::new(FailingRecordSource::panicking_after(2)), 1);
        let scope = ExportScope { tenant_id: Uuid::new_v4(), owner_id: Uuid::new_v4(), restrict_to_owner: false };
        let collected: Vec<_> = rows.open(&request(&["id"]), &scope).unwrap().collect().await;
        assert_eq!(collected.len(), 3);
        match &collected[2] {
            Err(ExportError::RowSourceFault(msg)) => assert!(msg.contains("record decoder bug")),
            other => panic!("expected a fault, got {:?}", other.as_ref().map(|_| ())),
        }
    }
}
