use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{query, query_as, SqlitePool};
use uuid::Uuid;

use crate::errors::{DbError, DbResult};
use crate::types::{format_timestamp, parse_optional_timestamp, parse_timestamp};

use super::types::{CompletedArtifact, EntityType, ExportFormat, ExportJob, ExportStatus, JobFilters};

const TABLE: &str = "export_jobs";

/// Durable job store.
///
/// Every status change is a conditional update keyed on the current status,
/// so a transition either happens exactly once or reports `false`.
#[async_trait]
pub trait ExportJobRepository: Send + Sync {
    async fn create(&self, job: &ExportJob) -> DbResult<()>;

    /// `PENDING -> PROCESSING`. Only one caller can win for a given job.
    async fn claim(&self, id: Uuid, started_at: DateTime<Utc>) -> DbResult<bool>;

    /// `PROCESSING -> READY`, recording where the artifact lives.
    async fn mark_ready(&self, id: Uuid, artifact: &CompletedArtifact, completed_at: DateTime<Utc>) -> DbResult<bool>;

    /// `PROCESSING -> FAILED`
    async fn mark_failed(&self, id: Uuid, error_message: &str, completed_at: DateTime<Utc>) -> DbResult<bool>;

    async fn find_by_id(&self, id: Uuid) -> DbResult<ExportJob>;

    /// Pending jobs, oldest first.
    async fn list_pending(&self) -> DbResult<Vec<ExportJob>>;

    /// Fail every job still marked `PROCESSING`; used on startup after a crash.
    async fn fail_interrupted(&self, error_message: &str, completed_at: DateTime<Utc>) -> DbResult<u64>;
}

pub struct SqliteExportJobRepository {
    pool: SqlitePool,
}

impl SqliteExportJobRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[derive(sqlx::FromRow)]
struct JobRow {
    id: String,
    entity_type: String,
    format: String,
    filters: String,
    status: String,
    result_ref: Option<String>,
    requested_by: String,
    created_at: String,
    started_at: Option<String>,
    completed_at: Option<String>,
    error_message: Option<String>,
    row_count: Option<i64>,
    byte_size: Option<i64>,
    checksum: Option<String>,
}

fn parse_uuid(value: &str) -> DbResult<Uuid> {
    Uuid::parse_str(value).map_err(|e| DbError::corrupt(TABLE, format!("bad uuid '{}': {}", value, e)))
}

impl JobRow {
    fn into_job(self) -> DbResult<ExportJob> {
        let entity_type = EntityType::from_str(&self.entity_type)
            .ok_or_else(|| DbError::corrupt(TABLE, format!("unknown entity type {}", self.entity_type)))?;
        let format = ExportFormat::from_str(&self.format)
            .ok_or_else(|| DbError::corrupt(TABLE, format!("unknown format {}", self.format)))?;
        let status = ExportStatus::from_str(&self.status)
            .ok_or_else(|| DbError::corrupt(TABLE, format!("invalid status {}", self.status)))?;
        let filters: JobFilters = serde_json::from_str(&self.filters)
            .map_err(|e| DbError::corrupt(TABLE, format!("bad filters: {}", e)))?;

        Ok(ExportJob {
            id: parse_uuid(&self.id)?,
            entity_type,
            format,
            filters,
            status,
            result_ref: self.result_ref,
            requested_by: parse_uuid(&self.requested_by)?,
            created_at: parse_timestamp(TABLE, &self.created_at)?,
            started_at: parse_optional_timestamp(TABLE, self.started_at.as_deref())?,
            completed_at: parse_optional_timestamp(TABLE, self.completed_at.as_deref())?,
            error_message: self.error_message,
            row_count: self.row_count,
            byte_size: self.byte_size,
            checksum: self.checksum,
        })
    }
}

#[async_trait]
impl ExportJobRepository for SqliteExportJobRepository {
    async fn create(&self, job: &ExportJob) -> DbResult<()> {
        let filters = serde_json::to_string(&job.filters)
            .map_err(|e| DbError::Other(format!("Failed to encode job filters: {}", e)))?;
        query(
            "INSERT INTO export_jobs (id, entity_type, format, filters, status, requested_by, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(job.id.to_string())
        .bind(job.entity_type.as_str())
        .bind(job.format.as_str())
        .bind(filters)
        .bind(job.status.as_str())
        .bind(job.requested_by.to_string())
        .bind(format_timestamp(&job.created_at))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn claim(&self, id: Uuid, started_at: DateTime<Utc>) -> DbResult<bool> {
        let result = query("UPDATE export_jobs SET status = 'processing', started_at = ? WHERE id = ? AND status = 'pending'")
            .bind(format_timestamp(&started_at))
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_ready(&self, id: Uuid, artifact: &CompletedArtifact, completed_at: DateTime<Utc>) -> DbResult<bool> {
        let result = query(
            "UPDATE export_jobs
             SET status = 'ready', result_ref = ?, completed_at = ?, row_count = ?, byte_size = ?, checksum = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(&artifact.result_ref)
        .bind(format_timestamp(&completed_at))
        .bind(artifact.row_count as i64)
        .bind(artifact.byte_size as i64)
        .bind(&artifact.checksum)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, id: Uuid, error_message: &str, completed_at: DateTime<Utc>) -> DbResult<bool> {
        let result = query(
            "UPDATE export_jobs SET status = 'failed', error_message = ?, completed_at = ?
             WHERE id = ? AND status = 'processing'",
        )
        .bind(error_message)
        .bind(format_timestamp(&completed_at))
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    async fn find_by_id(&self, id: Uuid) -> DbResult<ExportJob> {
        let row: Option<JobRow> = query_as("SELECT * FROM export_jobs WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(&self.pool)
            .await?;
        row.ok_or_else(|| DbError::NotFound("ExportJob".to_string(), id.to_string()))?
            .into_job()
    }

    async fn list_pending(&self) -> DbResult<Vec<ExportJob>> {
        let rows: Vec<JobRow> =
            query_as("SELECT * FROM export_jobs WHERE status = 'pending' ORDER BY created_at, rowid")
                .fetch_all(&self.pool)
                .await?;
        rows.into_iter().map(JobRow::into_job).collect()
    }

    async fn fail_interrupted(&self, error_message: &str, completed_at: DateTime<Utc>) -> DbResult<u64> {
        let result = query(
            "UPDATE export_jobs SET status = 'failed', error_message = ?, completed_at = ? WHERE status = 'processing'",
        )
        .bind(error_message)
        .bind(format_timestamp(&completed_at))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }
}
