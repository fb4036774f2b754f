use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Record kinds the portal can export.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityType {
    Service,
    Invoice,
    Customer,
    Vehicle,
    Property,
    Inquiry,
    Emergency,
    Payment,
    Staff,
    Message,
}

impl EntityType {
    pub const ALL: [EntityType; 10] = [
        EntityType::Service,
        EntityType::Invoice,
        EntityType::Customer,
        EntityType::Vehicle,
        EntityType::Property,
        EntityType::Inquiry,
        EntityType::Emergency,
        EntityType::Payment,
        EntityType::Staff,
        EntityType::Message,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::Service => "service",
            EntityType::Invoice => "invoice",
            EntityType::Customer => "customer",
            EntityType::Vehicle => "vehicle",
            EntityType::Property => "property",
            EntityType::Inquiry => "inquiry",
            EntityType::Emergency => "emergency",
            EntityType::Payment => "payment",
            EntityType::Staff => "staff",
            EntityType::Message => "message",
        }
    }

    /// Case-insensitive lookup by wire name.
    pub fn from_str(s: &str) -> Option<Self> {
        let wanted = s.trim().to_ascii_lowercase();
        Self::ALL.into_iter().find(|e| e.as_str() == wanted)
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Artifact formats
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExportFormat {
    Csv,
    /// Paginated table rendered as PDF
    Document,
}

impl ExportFormat {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Document => "document",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(ExportFormat::Csv),
            "document" | "pdf" | "doc" => Some(ExportFormat::Document),
            _ => None,
        }
    }

    /// Get file extension for this format
    pub fn file_extension(&self) -> &'static str {
        match self {
            ExportFormat::Csv => "csv",
            ExportFormat::Document => "pdf",
        }
    }

    pub fn content_type(&self) -> mime::Mime {
        match self {
            ExportFormat::Csv => mime::TEXT_CSV_UTF_8,
            ExportFormat::Document => mime::APPLICATION_PDF,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryMode {
    Sync,
    Async,
    Stream,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Sync => "sync",
            DeliveryMode::Async => "async",
            DeliveryMode::Stream => "stream",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sync" => Some(DeliveryMode::Sync),
            "async" => Some(DeliveryMode::Async),
            "stream" => Some(DeliveryMode::Stream),
            _ => None,
        }
    }
}

/// Inclusive time bounds; either side may be open.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DateRange {
    pub start: Option<DateTime<Utc>>,
    pub end: Option<DateTime<Utc>>,
}

impl DateRange {
    pub fn is_open(&self) -> bool {
        self.start.is_none() && self.end.is_none()
    }

    pub fn contains(&self, at: &DateTime<Utc>) -> bool {
        self.start.map_or(true, |s| *at >= s) && self.end.map_or(true, |e| *at <= e)
    }
}

/// Export request exactly as a caller submits it, before validation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RawExportRequest {
    pub entity_type: String,
    #[serde(default)]
    pub format: String,
    #[serde(default)]
    pub start_date: Option<String>,
    #[serde(default)]
    pub end_date: Option<String>,
    #[serde(default)]
    pub columns: Option<Vec<String>>,
    #[serde(default)]
    pub delivery_mode: Option<String>,
    /// Shorthand for `deliveryMode = "stream"`
    #[serde(default)]
    pub stream: Option<bool>,
}

/// A validated request with its column projection resolved and ordered.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportRequest {
    pub entity_type: EntityType,
    pub format: ExportFormat,
    pub date_range: DateRange,
    pub columns: Vec<String>,
    pub delivery_mode: DeliveryMode,
}

/// Row-level visibility for one requester.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportScope {
    pub tenant_id: Uuid,
    pub owner_id: Uuid,
    /// When set, only records owned by `owner_id` are exported
    pub restrict_to_owner: bool,
}

/// Export job statuses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExportStatus {
    Pending,
    Processing,
    Ready,
    Failed,
}

impl ExportStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportStatus::Pending => "pending",
            ExportStatus::Processing => "processing",
            ExportStatus::Ready => "ready",
            ExportStatus::Failed => "failed",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(ExportStatus::Pending),
            "processing" => Some(ExportStatus::Processing),
            "ready" => Some(ExportStatus::Ready),
            "failed" => Some(ExportStatus::Failed),
            _ => None,
        }
    }
}

impl fmt::Display for ExportStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a worker needs to replay the request, stored with the job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobFilters {
    pub date_range: DateRange,
    pub columns: Vec<String>,
    pub scope: ExportScope,
}

/// Row mapped to the `export_jobs` table.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportJob {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub format: ExportFormat,
    pub filters: JobFilters,
    pub status: ExportStatus,
    pub result_ref: Option<String>,
    pub requested_by: Uuid,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub row_count: Option<i64>,
    pub byte_size: Option<i64>,
    pub checksum: Option<String>,
}

impl ExportJob {
    pub fn new_pending(request: &ExportRequest, scope: ExportScope, requested_by: Uuid) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type: request.entity_type,
            format: request.format,
            filters: JobFilters {
                date_range: request.date_range,
                columns: request.columns.clone(),
                scope,
            },
            status: ExportStatus::Pending,
            result_ref: None,
            requested_by,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            error_message: None,
            row_count: None,
            byte_size: None,
            checksum: None,
        }
    }

    /// The request a worker replays for this job.
    pub fn request(&self) -> ExportRequest {
        ExportRequest {
            entity_type: self.entity_type,
            format: self.format,
            date_range: self.filters.date_range,
            columns: self.filters.columns.clone(),
            delivery_mode: DeliveryMode::Async,
        }
    }

    /// Artifact file name inside the job's storage directory.
    pub fn artifact_name(&self) -> String {
        format!("{}-export.{}", self.entity_type.as_str(), self.format.file_extension())
    }
}

/// Facts stored when a job finishes successfully.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompletedArtifact {
    pub result_ref: String,
    pub row_count: u64,
    pub byte_size: u64,
    pub checksum: String,
}

/// One successful export, as recorded for analytics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportEvent {
    pub id: Uuid,
    pub entity_type: EntityType,
    pub format: ExportFormat,
    pub delivery_mode: DeliveryMode,
    pub user_id: Uuid,
    pub row_count: u64,
    pub occurred_at: DateTime<Utc>,
}

impl ExportEvent {
    pub fn new(
        entity_type: EntityType,
        format: ExportFormat,
        delivery_mode: DeliveryMode,
        user_id: Uuid,
        row_count: u64,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            format,
            delivery_mode,
            user_id,
            row_count,
            occurred_at: Utc::now(),
        }
    }
}

/// Summary of a finished synchronous export.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportOutcome {
    pub entity_type: EntityType,
    pub format: ExportFormat,
    pub content_type: String,
    pub file_name: String,
    /// Delivery actually used; a `sync` request may be upgraded to `stream`
    pub delivery_mode: DeliveryMode,
    pub row_count: u64,
    pub byte_count: u64,
}

/// Result of `enqueue`: either a job handle or, for small datasets finished in-call, its location.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum EnqueueOutcome {
    #[serde(rename_all = "camelCase")]
    Accepted { job_id: Uuid, status: ExportStatus },
    #[serde(rename_all = "camelCase")]
    Completed { job_id: Uuid, url: String },
}

/// What a status query returns.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct JobStatusView {
    pub job_id: Uuid,
    pub entity_type: EntityType,
    pub format: ExportFormat,
    pub status: ExportStatus,
    pub result_ref: Option<String>,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub row_count: Option<i64>,
}

impl From<&ExportJob> for JobStatusView {
    fn from(job: &ExportJob) -> Self {
        Self {
            job_id: job.id,
            entity_type: job.entity_type,
            format: job.format,
            status: job.status,
            result_ref: job.result_ref.clone(),
            error_message: job.error_message.clone(),
            created_at: job.created_at,
            completed_at: job.completed_at,
            row_count: job.row_count,
        }
    }
}
