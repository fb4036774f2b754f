use chrono::Utc;
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::domains::core::artifact_store::ArtifactStore;
use crate::domains::export::events::ExportEventRepository;
use crate::domains::export::notifier::{JobEvent, JobEventNotifier};
use crate::domains::export::pipeline::ExportPipeline;
use crate::domains::export::repository::ExportJobRepository;
use crate::domains::export::types::{CompletedArtifact, DeliveryMode, ExportEvent, ExportJob};
use crate::domains::export::writers::DigestWriter;
use crate::errors::{panic_message, DbError, ExportError, ExportResult};

/// What a single `process` call did with a job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// Artifact published at the given reference
    Ready(String),
    Failed(String),
    /// Another worker owns the job, or it already finished
    Skipped,
}

/// Runs one background job from claim to terminal status.
pub struct JobRunner {
    jobs: Arc<dyn ExportJobRepository>,
    pipeline: ExportPipeline,
    store: Arc<dyn ArtifactStore>,
    events: Arc<dyn ExportEventRepository>,
    notifier: Arc<dyn JobEventNotifier>,
}

impl JobRunner {
    pub fn new(
        jobs: Arc<dyn ExportJobRepository>,
        pipeline: ExportPipeline,
        store: Arc<dyn ArtifactStore>,
        events: Arc<dyn ExportEventRepository>,
        notifier: Arc<dyn JobEventNotifier>,
    ) -> Self {
        Self {
            jobs,
            pipeline,
            store,
            events,
            notifier,
        }
    }

    /// Claim, produce and publish job `id`.
    ///
    /// Once claimed, a job always ends `READY` or `FAILED` unless the job store
    /// itself cannot be written; only that case is an `Err`. Jobs are attempted once.
    pub async fn process(&self, id: Uuid) -> ExportResult<JobOutcome> {
        let job = self.jobs.find_by_id(id).await.map_err(|e| match e {
            DbError::NotFound(_, _) => ExportError::JobNotFound(id),
            other => ExportError::Database(other),
        })?;
        if !self.jobs.claim(id, Utc::now()).await? {
            log::debug!("Export job {} already claimed ({})", id, job.status);
            return Ok(JobOutcome::Skipped);
        }
        log::info!("Processing export job {} ({} as {})", id, job.entity_type, job.format.as_str());

        let artifact = match self.produce(&job).await {
            Ok(artifact) => artifact,
            Err(e) => return self.fail(&job, e).await,
        };

        match self.jobs.mark_ready(id, &artifact, Utc::now()).await {
            Ok(true) => {}
            Ok(false) => {
                log::warn!("Export job {} left PROCESSING before it could be published", id);
                self.discard(&artifact.result_ref).await;
                return Ok(JobOutcome::Skipped);
            }
            Err(e) => {
                log::error!("Could not publish export job {}: {}", id, e);
                self.discard(&artifact.result_ref).await;
                return self.fail(&job, ExportError::Database(e)).await;
            }
        }

        let event = ExportEvent::new(
            job.entity_type,
            job.format,
            DeliveryMode::Async,
            job.requested_by,
            artifact.row_count,
        );
        if let Err(e) = self.events.record(&event).await {
            log::warn!("Could not record export event for job {}: {}", id, e);
        }
        log::info!(
            "Export job {} ready: {} rows, {} bytes at {}",
            id,
            artifact.row_count,
            artifact.byte_size,
            artifact.result_ref
        );
        self.notifier.notify(JobEvent::Ready {
            job_id: id,
            result_ref: artifact.result_ref.clone(),
            requested_by: job.requested_by,
        });
        Ok(JobOutcome::Ready(artifact.result_ref))
    }

    /// Pending jobs, oldest first.
    pub async fn pending_jobs(&self) -> ExportResult<Vec<Uuid>> {
        Ok(self.jobs.list_pending().await?.into_iter().map(|job| job.id).collect())
    }

    /// `PROCESSING -> FAILED` plus the failure event.
    async fn fail(&self, job: &ExportJob, error: ExportError) -> ExportResult<JobOutcome> {
        let message = error.to_string();
        if error.is_validation() {
            log::warn!("Export job {} rejected: {}", job.id, message);
        } else {
            log::error!("Export job {} failed: {}", job.id, message);
        }
        self.jobs.mark_failed(job.id, &message, Utc::now()).await?;
        self.notifier.notify(JobEvent::Failed {
            job_id: job.id,
            error: message.clone(),
            requested_by: job.requested_by,
        });
        Ok(JobOutcome::Failed(message))
    }

    async fn discard(&self, result_ref: &str) {
        if let Err(e) = self.store.discard(result_ref).await {
            log::warn!("Could not discard artifact {}: {}", result_ref, e);
        }
    }

    /// Write the artifact. On any error, panics included, the partial file is discarded.
    async fn produce(&self, job: &ExportJob) -> ExportResult<CompletedArtifact> {
        let request = job.request();
        let choice = self.pipeline.choose_encoder(&request, 0);
        let (result_ref, writer) = self.store.create(job.id, &job.artifact_name()).await?;
        let mut sink = DigestWriter::new(writer);

        let written = AssertUnwindSafe(async {
            let stats = self.pipeline.run(&request, &job.filters.scope, choice, &mut sink).await?;
            sink.shutdown().await?;
            Ok::<_, ExportError>(stats)
        })
        .catch_unwind()
        .await
        .unwrap_or_else(|panic| {
            Err(ExportError::Internal(format!("export panicked: {}", panic_message(panic.as_ref()))))
        });

        match written {
            Ok(stats) => {
                let (_, checksum, byte_size) = sink.finish();
                Ok(CompletedArtifact {
                    result_ref,
                    row_count: stats.rows,
                    byte_size,
                    checksum,
                })
            }
            Err(e) => {
                drop(sink);
                self.discard(&result_ref).await;
                Err(e)
            }
        }
    }
}

/// Fixed pool of workers fed by a bounded channel of job ids.
///
/// The channel is only a wake-up path; the job store is the queue. When the
/// channel is full a job stays `PENDING` and the next worker to finish a job
/// sweeps the store for it.
pub struct ExportQueueManager {
    runner: Arc<JobRunner>,
    sender: Mutex<Option<mpsc::Sender<Uuid>>>,
    overflow: Arc<AtomicBool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

async fn run_job(runner: &JobRunner, worker: usize, job_id: Uuid) {
    match AssertUnwindSafe(runner.process(job_id)).catch_unwind().await {
        Ok(Ok(outcome)) => log::debug!("Worker {} finished job {}: {:?}", worker, job_id, outcome),
        Ok(Err(e)) => log::error!("Worker {} could not process job {}: {}", worker, job_id, e),
        Err(panic) => log::error!(
            "Worker {} panicked on job {}: {}",
            worker,
            job_id,
            panic_message(panic.as_ref())
        ),
    }
}

/// Run every job still waiting in the store. Ids also sitting in the channel
/// are skipped later by the claim.
async fn sweep_pending(runner: &JobRunner, worker: usize) {
    match runner.pending_jobs().await {
        Ok(ids) => {
            log::debug!("Worker {} sweeping {} pending jobs", worker, ids.len());
            for job_id in ids {
                run_job(runner, worker, job_id).await;
            }
        }
        Err(e) => log::error!("Worker {} could not list pending jobs: {}", worker, e),
    }
}

impl ExportQueueManager {
    /// Spawn `worker_count` workers. Must be called inside a Tokio runtime.
    pub fn start(runner: Arc<JobRunner>, worker_count: usize, capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel::<Uuid>(capacity.max(1));
        let receiver = Arc::new(Mutex::new(receiver));
        let overflow = Arc::new(AtomicBool::new(false));

        let workers = (0..worker_count.max(1))
            .map(|worker| {
                let receiver = receiver.clone();
                let runner = runner.clone();
                let overflow = overflow.clone();
                tokio::spawn(async move {
                    loop {
                        let next = receiver.lock().await.recv().await;
                        let Some(job_id) = next else { break };
                        run_job(&runner, worker, job_id).await;
                        // A full channel always holds ids, so some worker gets here after it
                        if overflow.swap(false, Ordering::SeqCst) {
                            sweep_pending(&runner, worker).await;
                        }
                    }
                    log::debug!("Export worker {} stopped", worker);
                })
            })
            .collect();

        log::info!("Started {} export workers", worker_count.max(1));
        Self {
            runner,
            sender: Mutex::new(Some(sender)),
            overflow,
            workers: Mutex::new(workers),
        }
    }

    pub fn runner(&self) -> &Arc<JobRunner> {
        &self.runner
    }

    /// Hand a pending job to the workers. Never waits for room in the channel.
    pub async fn dispatch(&self, job_id: Uuid) -> ExportResult<()> {
        let sender = self.sender.lock().await.clone().ok_or(ExportError::QueueClosed)?;
        match sender.try_send(job_id) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                log::debug!("Export queue full; job {} waits in the store", job_id);
                self.overflow.store(true, Ordering::SeqCst);
                Ok(())
            }
            Err(TrySendError::Closed(_)) => Err(ExportError::QueueClosed),
        }
    }

    /// Startup recovery: jobs caught mid-run are failed, pending ones re-queued.
    pub async fn recover(&self, jobs: &dyn ExportJobRepository) -> ExportResult<usize> {
        let interrupted = jobs.fail_interrupted("interrupted", Utc::now()).await?;
        if interrupted > 0 {
            log::warn!("Marked {} interrupted export jobs as failed", interrupted);
        }
        let pending = jobs.list_pending().await?;
        for job in &pending {
            self.dispatch(job.id).await?;
        }
        log::info!("Re-queued {} pending export jobs", pending.len());
        Ok(pending.len())
    }

    /// Stop accepting work, let workers drain what is queued, and wait for them.
    pub async fn shutdown(&self) {
        self.sender.lock().await.take();
        let workers: Vec<_> = self.workers.lock().await.drain(..).collect();
        for handle in workers {
            if let Err(e) = handle.await {
                log::error!("Export worker panicked: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::core::artifact_store::LocalArtifactStore;
    use crate::domains::export::events::SqliteExportEventRepository;
    use crate::domains::export::notifier::BroadcastNotifier;
    use crate::domains::export::record_source::RecordSource;
    use crate::domains::export::repository::SqliteExportJobRepository;
    use crate::domains::export::row_source::RowSource;
    use crate::domains::export::test_support::{
        memory_pool, record, FailingRecordSource, GatedRecordSource, InMemoryRecordSource,
    };
    use crate::domains::export::types::{DateRange, EntityType, ExportFormat, ExportRequest, ExportScope, ExportStatus};
    use crate::errors::DbResult;
    use async_trait::async_trait;
    use chrono::{DateTime, Duration};
    use serde_json::json;
    use tempfile::TempDir;

    struct Harness {
        runner: Arc<JobRunner>,
        pipeline: ExportPipeline,
        jobs: Arc<SqliteExportJobRepository>,
        events: Arc<SqliteExportEventRepository>,
        store: Arc<LocalArtifactStore>,
        notifier: Arc<BroadcastNotifier>,
        tenant: Uuid,
        _dir: TempDir,
    }

    impl Harness {
        async fn new(source: impl FnOnce(Uuid) -> Arc<dyn RecordSource>, ceiling: u64) -> Self {
            let dir = TempDir::new().unwrap();
            let pool = memory_pool().await;
            let tenant = Uuid::new_v4();
            let jobs = Arc::new(SqliteExportJobRepository::new(pool.clone()));
            let events = Arc::new(SqliteExportEventRepository::new(pool));
            let store = Arc::new(LocalArtifactStore::new(dir.path()).unwrap());
            let notifier = Arc::new(BroadcastNotifier::new(16));
            let pipeline = ExportPipeline::new(RowSource::new(source(tenant), 3), ceiling, 100);
            let runner = Arc::new(JobRunner::new(
                jobs.clone(),
                pipeline.clone(),
                store.clone(),
                events.clone(),
                notifier.clone(),
            ));
            Self { runner, pipeline, jobs, events, store, notifier, tenant, _dir: dir }
        }

        async fn payments(rows: usize) -> Self {
            Self::new(
                |tenant| {
                    let source = InMemoryRecordSource::new();
                    for n in 0..rows {
                        source.push(
                            EntityType::Payment,
                            tenant,
                            record(json!({"id": format!("p{}", n), "amount": n * 10})),
                        );
                    }
                    Arc::new(source) as Arc<dyn RecordSource>
                },
                1_000,
            )
            .await
        }

        async fn pending(&self, format: ExportFormat) -> ExportJob {
            let request = ExportRequest {
                entity_type: EntityType::Payment,
                format,
                date_range: DateRange::default(),
                columns: vec!["id".into(), "amount".into()],
                delivery_mode: DeliveryMode::Async,
            };
            let scope = ExportScope { tenant_id: self.tenant, owner_id: Uuid::new_v4(), restrict_to_owner: false };
            let job = ExportJob::new_pending(&request, scope, scope.owner_id);
            self.jobs.create(&job).await.unwrap();
            job
        }
    }

    #[tokio::test]
    async fn processes_a_job_to_a_published_artifact() {
        let h = Harness::payments(5).await;
        let mut rx = h.notifier.subscribe();
        let job = h.pending(ExportFormat::Csv).await;

        let outcome = h.runner.process(job.id).await.unwrap();
        let reference = format!("{}/payment-export.csv", job.id);
        assert_eq!(outcome, JobOutcome::Ready(reference.clone()));

        let stored = h.jobs.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, ExportStatus::Ready);
        assert_eq!(stored.row_count, Some(5));
        let bytes = h.store.read(&reference).await.unwrap();
        assert_eq!(stored.byte_size, Some(bytes.len() as i64));
        assert!(String::from_utf8(bytes).unwrap().starts_with("ID,Amount\r\n"));

        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Ready { job_id, .. } if job_id == job.id));
        let events = h.events.list_since(Utc::now() - Duration::minutes(1)).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].delivery_mode, DeliveryMode::Async);

        // A finished job is never run again
        assert_eq!(h.runner.process(job.id).await.unwrap(), JobOutcome::Skipped);
    }

    #[tokio::test]
    async fn source_fault_fails_the_job_and_discards_the_artifact() {
        let h = Harness::new(|_| Arc::new(FailingRecordSource::after_records(4)) as Arc<dyn RecordSource>, 1_000).await;
        let mut rx = h.notifier.subscribe();
        let job = h.pending(ExportFormat::Csv).await;

        let outcome = h.runner.process(job.id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref msg) if msg.contains("connection reset")));

        let stored = h.jobs.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, ExportStatus::Failed);
        assert!(stored.result_ref.is_none());
        assert!(h.store.read(&format!("{}/payment-export.csv", job.id)).await.is_err());
        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Failed { .. }));
        assert!(h.events.list_since(Utc::now() - Duration::minutes(1)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn oversized_document_job_fails() {
        let h = Harness::new(
            |tenant| {
                let source = InMemoryRecordSource::new();
                for n in 0..6 {
                    source.push(EntityType::Payment, tenant, record(json!({"id": n})));
                }
                Arc::new(source) as Arc<dyn RecordSource>
            },
            5,
        )
        .await;
        let job = h.pending(ExportFormat::Document).await;
        match h.runner.process(job.id).await.unwrap() {
            JobOutcome::Failed(msg) => assert!(msg.contains("exceeds the limit of 5")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn unknown_job_is_reported() {
        let h = Harness::payments(0).await;
        let missing = Uuid::new_v4();
        assert!(matches!(
            h.runner.process(missing).await,
            Err(ExportError::JobNotFound(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn workers_drain_the_queue_before_shutdown() {
        let h = Harness::payments(7).await;
        let queue = ExportQueueManager::start(h.runner.clone(), 3, 2);
        let mut ids = Vec::new();
        for _ in 0..6 {
            let job = h.pending(ExportFormat::Csv).await;
            queue.dispatch(job.id).await.unwrap();
            ids.push(job.id);
        }
        queue.shutdown().await;

        for id in ids {
            assert_eq!(h.jobs.find_by_id(id).await.unwrap().status, ExportStatus::Ready);
        }
        assert!(matches!(queue.dispatch(Uuid::new_v4()).await, Err(ExportError::QueueClosed)));
    }

    #[tokio::test]
    async fn recovery_fails_interrupted_and_requeues_pending() {
        let h = Harness::payments(2).await;
        let stuck = h.pending(ExportFormat::Csv).await;
        h.jobs.claim(stuck.id, Utc::now()).await.unwrap();
        let waiting = h.pending(ExportFormat::Csv).await;

        let queue = ExportQueueManager::start(h.runner.clone(), 1, 4);
        assert_eq!(queue.recover(h.jobs.as_ref()).await.unwrap(), 1);
        queue.shutdown().await;

        let stuck = h.jobs.find_by_id(stuck.id).await.unwrap();
        assert_eq!(stuck.status, ExportStatus::Failed);
        assert_eq!(stuck.error_message.as_deref(), Some("interrupted"));
        assert_eq!(h.jobs.find_by_id(waiting.id).await.unwrap().status, ExportStatus::Ready);
    }

    /// Job store whose `READY` transition always fails.
    struct UnpublishableJobs(Arc<SqliteExportJobRepository>);

    #[async_trait]
    impl ExportJobRepository for UnpublishableJobs {
        async fn create(&self, job: &ExportJob) -> DbResult<()> {
            self.0.create(job).await
        }

        async fn claim(&self, id: Uuid, started_at: DateTime<Utc>) -> DbResult<bool> {
            self.0.claim(id, started_at).await
        }

        async fn mark_ready(&self, _id: Uuid, _artifact: &CompletedArtifact, _at: DateTime<Utc>) -> DbResult<bool> {
            Err(DbError::Other("database is locked".to_string()))
        }

        async fn mark_failed(&self, id: Uuid, error_message: &str, completed_at: DateTime<Utc>) -> DbResult<bool> {
            self.0.mark_failed(id, error_message, completed_at).await
        }

        async fn find_by_id(&self, id: Uuid) -> DbResult<ExportJob> {
            self.0.find_by_id(id).await
        }

        async fn list_pending(&self) -> DbResult<Vec<ExportJob>> {
            self.0.list_pending().await
        }

        async fn fail_interrupted(&self, error_message: &str, completed_at: DateTime<Utc>) -> DbResult<u64> {
            self.0.fail_interrupted(error_message, completed_at).await
        }
    }

    #[tokio::test]
    async fn publish_failure_fails_the_job_and_discards_the_artifact() {
        let h = Harness::payments(3).await;
        let mut rx = h.notifier.subscribe();
        let runner = JobRunner::new(
            Arc::new(UnpublishableJobs(h.jobs.clone())),
            h.pipeline.clone(),
            h.store.clone(),
            h.events.clone(),
            h.notifier.clone(),
        );
        let job = h.pending(ExportFormat::Csv).await;

        let outcome = runner.process(job.id).await.unwrap();
        assert!(matches!(outcome, JobOutcome::Failed(ref msg) if msg.contains("database is locked")));

        let stored = h.jobs.find_by_id(job.id).await.unwrap();
        assert_eq!(stored.status, ExportStatus::Failed);
        assert!(stored.result_ref.is_none());
        assert!(h.store.read(&format!("{}/payment-export.csv", job.id)).await.is_err());
        assert!(matches!(rx.recv().await.unwrap(), JobEvent::Failed { job_id, .. } if job_id == job.id));
    }

    #[tokio::test]
    async fn panicking_source_fails_jobs_without_losing_the_worker() {
        let h = Harness::new(|_| Arc::new(FailingRecordSource::panicking_after(2)) as Arc<dyn RecordSource>, 1_000).await;
        let queue = ExportQueueManager::start(h.runner.clone(), 1, 4);
        let first = h.pending(ExportFormat::Csv).await;
        let second = h.pending(ExportFormat::Document).await;
        queue.dispatch(first.id).await.unwrap();
        queue.dispatch(second.id).await.unwrap();
        queue.shutdown().await;

        for id in [first.id, second.id] {
            let stored = h.jobs.find_by_id(id).await.unwrap();
            assert_eq!(stored.status, ExportStatus::Failed);
            assert!(stored.error_message.unwrap().contains("record decoder bug"));
        }
        assert!(h.store.read(&format!("{}/payment-export.csv", first.id)).await.is_err());
    }

    #[tokio::test]
    async fn dispatch_does_not_wait_for_a_full_queue() {
        let gated = Arc::new(GatedRecordSource::new(InMemoryRecordSource::new()));
        let h = Harness::new(
            {
                let gated = gated.clone();
                move |_| gated as Arc<dyn RecordSource>
            },
            1_000,
        )
        .await;
        let queue = ExportQueueManager::start(h.runner.clone(), 1, 1);

        let mut ids = Vec::new();
        for _ in 0..4 {
            let job = h.pending(ExportFormat::Csv).await;
            let dispatched = tokio::time::timeout(std::time::Duration::from_secs(1), queue.dispatch(job.id)).await;
            assert!(matches!(dispatched, Ok(Ok(()))), "dispatch blocked on a full queue");
            ids.push(job.id);
        }

        gated.open();
        queue.shutdown().await;
        for id in ids {
            assert_eq!(h.jobs.find_by_id(id).await.unwrap().status, ExportStatus::Ready);
        }
    }
}
