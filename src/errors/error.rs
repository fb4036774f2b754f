use serde::Serialize;
use thiserror::Error;
use uuid::Uuid;
use crate::domains::core::artifact_store::ArtifactStoreError;

/// Database errors
#[derive(Debug, Error)]
pub enum DbError {
    #[error("SQLx error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Record not found: {0} with ID {1}")]
    NotFound(String, String),

    #[error("Conflict error: {0}")]
    Conflict(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Corrupt row in {table}: {message}")]
    CorruptRow { table: String, message: String },

    #[error("Database error: {0}")]
    Other(String),
}

impl DbError {
    pub fn corrupt(table: &str, message: impl Into<String>) -> Self {
        DbError::CorruptRow {
            table: table.to_string(),
            message: message.into(),
        }
    }
}

impl serde::Serialize for DbError {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use serde::ser::SerializeStruct;
        let mut state = serializer.serialize_struct("DbError", 2)?;
        match self {
            DbError::Sqlx(err) => {
                state.serialize_field("type", "Sqlx")?;
                state.serialize_field("message", &err.to_string())?;
            }
            DbError::Query(s) => {
                state.serialize_field("type", "Query")?;
                state.serialize_field("message", s)?;
            }
            DbError::NotFound(s1, s2) => {
                state.serialize_field("type", "NotFound")?;
                state.serialize_field("message", &format!("Record not found: {} with ID {}", s1, s2))?;
            }
            DbError::Conflict(s) => {
                state.serialize_field("type", "Conflict")?;
                state.serialize_field("message", s)?;
            }
            DbError::Migration(s) => {
                state.serialize_field("type", "Migration")?;
                state.serialize_field("message", s)?;
            }
            DbError::CorruptRow { table, message } => {
                state.serialize_field("type", "CorruptRow")?;
                state.serialize_field("message", &format!("{}: {}", table, message))?;
            }
            DbError::Other(s) => {
                state.serialize_field("type", "Other")?;
                state.serialize_field("message", s)?;
            }
        }
        state.end()
    }
}

/// Manual Clone implementation for DbError
impl Clone for DbError {
    fn clone(&self) -> Self {
        match self {
            DbError::Sqlx(err) => DbError::Other(format!("SQLx error: {}", err)),
            DbError::Query(s) => DbError::Query(s.clone()),
            DbError::NotFound(s1, s2) => DbError::NotFound(s1.clone(), s2.clone()),
            DbError::Conflict(s) => DbError::Conflict(s.clone()),
            DbError::Migration(s) => DbError::Migration(s.clone()),
            DbError::CorruptRow { table, message } => DbError::CorruptRow {
                table: table.clone(),
                message: message.clone(),
            },
            DbError::Other(s) => DbError::Other(s.clone()),
        }
    }
}

/// Errors raised anywhere along the export pipeline.
///
/// Validation variants carry the offending field or value so callers can
/// surface them without re-parsing the message.
#[derive(Debug, Error, Clone, Serialize)]
pub enum ExportError {
    #[error("Invalid date range: start {start} is after end {end}")]
    InvalidRange { start: String, end: String },

    #[error("Invalid date for {field}: {value}")]
    InvalidDate { field: String, value: String },

    #[error("Unknown column(s) for {entity_type}: {}", .columns.join(", "))]
    UnknownColumn {
        entity_type: String,
        columns: Vec<String>,
    },

    #[error("Unsupported entity type: {0}")]
    UnsupportedEntityType(String),

    #[error("Unsupported export format: {0}")]
    UnsupportedFormat(String),

    #[error("Unsupported delivery mode: {0}")]
    UnsupportedDeliveryMode(String),

    #[error("Analytics window must be between 1 and {max} days, got {days}")]
    InvalidWindow { days: i64, max: u32 },

    #[error("Export too large for this format: {rows} rows exceeds the limit of {limit}")]
    ExportTooLarge { rows: u64, limit: u64 },

    #[error("Row source failed: {0}")]
    RowSourceFault(String),

    #[error("Encoding failed: {0}")]
    EncodingFault(String),

    #[error("Export job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Export job {id} is not ready (status {status})")]
    JobNotReady { id: Uuid, status: String },

    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    #[error("Artifact storage error: {0}")]
    Storage(String),

    #[error("Export queue is closed")]
    QueueClosed,

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ExportError {
    /// True for errors caused by the request itself; these are never retried.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            ExportError::InvalidRange { .. }
                | ExportError::InvalidDate { .. }
                | ExportError::UnknownColumn { .. }
                | ExportError::UnsupportedEntityType(_)
                | ExportError::UnsupportedFormat(_)
                | ExportError::UnsupportedDeliveryMode(_)
                | ExportError::InvalidWindow { .. }
        )
    }

    pub fn unknown_columns(entity_type: &str, columns: Vec<String>) -> Self {
        ExportError::UnknownColumn {
            entity_type: entity_type.to_string(),
            columns,
        }
    }
}

impl From<ArtifactStoreError> for ExportError {
    fn from(error: ArtifactStoreError) -> Self {
        ExportError::Storage(error.to_string())
    }
}

impl From<csv::Error> for ExportError {
    fn from(error: csv::Error) -> Self {
        ExportError::EncodingFault(error.to_string())
    }
}

impl From<std::io::Error> for ExportError {
    fn from(error: std::io::Error) -> Self {
        ExportError::EncodingFault(format!("I/O error: {}", error))
    }
}
