use chrono::Utc;
use serde::Serialize;
use sqlx::SqlitePool;
use std::sync::Arc;
use uuid::Uuid;

use crate::auth::AuthContext;
use crate::config::ExportConfig;
use crate::domains::core::artifact_store::ArtifactStore;
use crate::domains::export::analytics::{AnalyticsReport, AnalyticsService};
use crate::domains::export::entities::projection;
use crate::domains::export::events::{ExportEventRepository, SqliteExportEventRepository};
use crate::domains::export::notifier::JobEventNotifier;
use crate::domains::export::pipeline::ExportPipeline;
use crate::domains::export::preferences::{ColumnPreferenceService, SqliteColumnPreferenceRepository};
use crate::domains::export::queue_manager::{ExportQueueManager, JobOutcome, JobRunner};
use crate::domains::export::record_source::RecordSource;
use crate::domains::export::repository::{ExportJobRepository, SqliteExportJobRepository};
use crate::domains::export::row_source::RowSource;
use crate::domains::export::schema::Record;
use crate::domains::export::types::{
    DeliveryMode, EnqueueOutcome, EntityType, ExportEvent, ExportJob, ExportOutcome, ExportRequest, ExportStatus,
    JobStatusView, RawExportRequest,
};
use crate::domains::export::validator::RequestValidator;
use crate::domains::export::writers::ExportSink;
use crate::errors::{DbError, ExportError, ExportResult};
use crate::types::Permission;

/// One entry of an entity's column schema as shown to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnInfo {
    pub key: &'static str,
    pub label: &'static str,
}

fn parse_entity(raw: &str) -> ExportResult<EntityType> {
    EntityType::from_str(raw).ok_or_else(|| ExportError::UnsupportedEntityType(raw.to_string()))
}

/// Entry point for every export operation. Authorization happens here;
/// the components below trust their inputs.
pub struct ExportService {
    config: ExportConfig,
    validator: RequestValidator,
    preferences: ColumnPreferenceService,
    pipeline: ExportPipeline,
    records: Arc<dyn RecordSource>,
    jobs: Arc<dyn ExportJobRepository>,
    events: Arc<dyn ExportEventRepository>,
    store: Arc<dyn ArtifactStore>,
    analytics: AnalyticsService,
    queue: ExportQueueManager,
}

impl ExportService {
    /// Wire the SQLite-backed stores and start the worker pool.
    /// Must be called inside a Tokio runtime.
    pub fn new(
        config: ExportConfig,
        pool: SqlitePool,
        records: Arc<dyn RecordSource>,
        store: Arc<dyn ArtifactStore>,
        notifier: Arc<dyn JobEventNotifier>,
    ) -> Self {
        let preferences = ColumnPreferenceService::new(Arc::new(SqliteColumnPreferenceRepository::new(pool.clone())));
        let jobs: Arc<dyn ExportJobRepository> = Arc::new(SqliteExportJobRepository::new(pool.clone()));
        let events: Arc<dyn ExportEventRepository> = Arc::new(SqliteExportEventRepository::new(pool));
        let pipeline = ExportPipeline::new(
            RowSource::new(records.clone(), config.source_batch_size),
            config.document_row_ceiling,
            config.buffer_threshold_rows,
        );
        let runner = Arc::new(JobRunner::new(
            jobs.clone(),
            pipeline.clone(),
            store.clone(),
            events.clone(),
            notifier,
        ));
        let queue = ExportQueueManager::start(runner, config.worker_count, config.queue_capacity);

        Self {
            validator: RequestValidator::new(preferences.clone()),
            analytics: AnalyticsService::new(events.clone(), config.analytics_top_days, config.max_analytics_days),
            preferences,
            pipeline,
            records,
            jobs,
            events,
            store,
            queue,
            config,
        }
    }

    /// Fail jobs interrupted by a crash and re-queue the pending ones.
    pub async fn recover(&self) -> ExportResult<usize> {
        self.queue.recover(self.jobs.as_ref()).await
    }

    /// Run an export inside the call, writing the artifact to `sink`.
    ///
    /// Nothing is written when validation fails. A fault once streaming has
    /// begun leaves a truncated artifact in `sink` and is returned as `Err`.
    pub async fn export_sync(
        &self,
        raw: &RawExportRequest,
        auth: &AuthContext,
        sink: ExportSink<'_>,
    ) -> ExportResult<ExportOutcome> {
        let request = self.prepare_sync(raw, auth).await?;
        self.run_sync(&request, auth, sink).await
    }

    /// Authorize and validate a synchronous export without producing anything.
    pub async fn prepare_sync(&self, raw: &RawExportRequest, auth: &AuthContext) -> ExportResult<ExportRequest> {
        auth.authorize(Permission::ExportRecords)?;
        let request = self.validator.normalize(raw, auth.user_id).await?;
        if request.delivery_mode == DeliveryMode::Async {
            return Err(ExportError::UnsupportedDeliveryMode(
                "async exports must be enqueued".to_string(),
            ));
        }
        Ok(request)
    }

    /// Produce a request returned by [`Self::prepare_sync`].
    pub async fn run_sync(
        &self,
        request: &ExportRequest,
        auth: &AuthContext,
        sink: ExportSink<'_>,
    ) -> ExportResult<ExportOutcome> {
        auth.authorize(Permission::ExportRecords)?;
        let scope = auth.export_scope();
        let estimate = self.pipeline.estimate(request, &scope).await?;
        let choice = self.pipeline.choose_encoder(request, estimate);
        let delivery_mode = choice.delivery_for(request.delivery_mode);
        if delivery_mode != request.delivery_mode {
            log::info!(
                "Streaming {} export: ~{} rows is above the buffering threshold",
                request.entity_type,
                estimate
            );
        }

        let stats = self.pipeline.run(request, &scope, choice, sink).await?;

        let event = ExportEvent::new(request.entity_type, request.format, delivery_mode, auth.user_id, stats.rows);
        if let Err(e) = self.events.record(&event).await {
            log::warn!("Could not record export event: {}", e);
        }

        Ok(ExportOutcome {
            entity_type: request.entity_type,
            format: request.format,
            content_type: request.format.content_type().to_string(),
            file_name: format!(
                "{}-export-{}.{}",
                request.entity_type,
                Utc::now().format("%Y%m%d"),
                request.format.file_extension()
            ),
            delivery_mode,
            row_count: stats.rows,
            byte_count: stats.bytes,
        })
    }

    /// Create a background job. Invalid requests are rejected here, before any
    /// job exists. Small datasets are finished within the call.
    pub async fn enqueue(&self, raw: &RawExportRequest, auth: &AuthContext) -> ExportResult<EnqueueOutcome> {
        auth.authorize(Permission::ExportRecords)?;
        let request = self.validator.normalize(raw, auth.user_id).await?;
        let scope = auth.export_scope();
        let job = ExportJob::new_pending(&request, scope, auth.user_id);
        self.jobs.create(&job).await?;
        log::info!(
            "Enqueued export job {} ({} as {}) for {}",
            job.id,
            job.entity_type,
            job.format.as_str(),
            auth.user_id
        );

        // The job exists from here on; every path below leaves it to a worker or finishes it.
        if self.config.inline_job_rows > 0 {
            match self.pipeline.estimate(&job.request(), &scope).await {
                Ok(estimate) if estimate <= self.config.inline_job_rows => {
                    log::debug!("Completing job {} in-call (~{} rows)", job.id, estimate);
                    if let JobOutcome::Ready(url) = self.queue.runner().process(job.id).await? {
                        return Ok(EnqueueOutcome::Completed { job_id: job.id, url });
                    }
                    let status = self.jobs.find_by_id(job.id).await?.status;
                    return Ok(EnqueueOutcome::Accepted { job_id: job.id, status });
                }
                Ok(_) => {}
                Err(e) => log::warn!("Could not size job {}; handing it to the workers: {}", job.id, e),
            }
        }

        self.queue.dispatch(job.id).await?;
        Ok(EnqueueOutcome::Accepted {
            job_id: job.id,
            status: ExportStatus::Pending,
        })
    }

    /// Load a job the caller may see. Jobs from another tenant look missing.
    async fn visible_job(&self, job_id: Uuid, auth: &AuthContext) -> ExportResult<ExportJob> {
        let job = self.jobs.find_by_id(job_id).await.map_err(|e| match e {
            DbError::NotFound(_, _) => ExportError::JobNotFound(job_id),
            other => ExportError::Database(other),
        })?;
        if job.filters.scope.tenant_id != auth.tenant_id {
            return Err(ExportError::JobNotFound(job_id));
        }
        auth.authorize_self_or(&job.requested_by, Permission::ViewAllExportJobs)?;
        Ok(job)
    }

    pub async fn job_status(&self, job_id: Uuid, auth: &AuthContext) -> ExportResult<JobStatusView> {
        let job = self.visible_job(job_id, auth).await?;
        Ok(JobStatusView::from(&job))
    }

    /// Artifact bytes of a `READY` job.
    pub async fn retrieve(&self, job_id: Uuid, auth: &AuthContext) -> ExportResult<Vec<u8>> {
        let job = self.visible_job(job_id, auth).await?;
        let result_ref = match (job.status, job.result_ref) {
            (ExportStatus::Ready, Some(result_ref)) => result_ref,
            (status, _) => {
                return Err(ExportError::JobNotReady {
                    id: job_id,
                    status: status.to_string(),
                })
            }
        };
        Ok(self.store.read(&result_ref).await?)
    }

    /// The caller's column preference for `entity`, or the full schema.
    pub async fn columns(&self, auth: &AuthContext, entity: &str) -> ExportResult<Vec<String>> {
        auth.authorize(Permission::ExportRecords)?;
        self.preferences.get(auth.user_id, parse_entity(entity)?).await
    }

    pub async fn set_columns(&self, auth: &AuthContext, entity: &str, columns: &[String]) -> ExportResult<Vec<String>> {
        auth.authorize(Permission::ManageColumnPreferences)?;
        self.preferences.set(auth.user_id, parse_entity(entity)?, columns).await
    }

    pub fn schema(&self, entity: &str) -> ExportResult<Vec<ColumnInfo>> {
        let projection = projection(parse_entity(entity)?)?;
        Ok(projection
            .columns()
            .iter()
            .map(|c| ColumnInfo { key: c.key, label: c.label })
            .collect())
    }

    pub async fn analytics(&self, auth: &AuthContext, days: i64, compare: bool) -> ExportResult<AnalyticsReport> {
        auth.authorize(Permission::ViewExportAnalytics)?;
        self.analytics.report(days, compare, Utc::now()).await
    }

    /// Load records into the caller's tenant; returns their ids in order.
    pub async fn ingest_records(&self, auth: &AuthContext, entity: &str, records: Vec<Record>) -> ExportResult<Vec<String>> {
        auth.authorize(Permission::IngestRecords)?;
        let entity_type = parse_entity(entity)?;
        let mut ids = Vec::with_capacity(records.len());
        for record in records {
            ids.push(self.records.insert_record(entity_type, auth.tenant_id, record).await?);
        }
        log::info!("Ingested {} {} records for tenant {}", ids.len(), entity_type, auth.tenant_id);
        Ok(ids)
    }

    /// Stop the workers after they finish what is queued.
    pub async fn shutdown(&self) {
        self.queue.shutdown().await;
    }
}
