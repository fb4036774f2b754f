use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;

use crate::errors::{DbError, ExportError};

/// Error codes for FFI boundary
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    // Success (no error)
    Success = 0,

    // General errors (1-99)
    Unknown = 1,
    InvalidArgument = 2,
    NullPointer = 3,
    InvalidUtf8 = 4,
    InvalidUuid = 5,
    InternalError = 6,
    NotInitialized = 7,

    // Database errors (100-199)
    DatabaseGeneral = 100,
    DatabaseNotFound = 101,
    DatabaseConflict = 102,
    DatabaseMigration = 106,
    DatabaseCorruptRow = 107,

    // Request validation (200-299)
    InvalidRange = 200,
    InvalidDate = 201,
    UnknownColumn = 202,
    UnsupportedEntityType = 203,
    UnsupportedFormat = 204,
    UnsupportedDeliveryMode = 205,
    InvalidWindow = 206,

    // Export execution (300-399)
    ExportTooLarge = 300,
    RowSourceFault = 301,
    EncodingFault = 302,
    JobNotFound = 303,
    JobNotReady = 304,
    PermissionDenied = 305,
    StorageError = 306,
    QueueClosed = 307,
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?} ({})", self, *self as i32)
    }
}

/// Error type for FFI boundary
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FFIError {
    /// Error code for programmatic handling
    pub code: ErrorCode,

    /// Human-readable error message
    pub message: String,

    /// Optional additional details (JSON string)
    pub details: Option<String>,
}

impl fmt::Display for FFIError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(details) = &self.details {
            write!(f, "{}: {} ({})", self.code, self.message, details)
        } else {
            write!(f, "{}: {}", self.code, self.message)
        }
    }
}

impl std::error::Error for FFIError {}

impl FFIError {
    pub fn new(code: ErrorCode, message: &str) -> Self {
        Self {
            code,
            message: message.to_string(),
            details: None,
        }
    }

    pub fn with_details(code: ErrorCode, message: &str, details: serde_json::Value) -> Self {
        Self {
            code,
            message: message.to_string(),
            details: Some(details.to_string()),
        }
    }

    pub fn invalid_argument(message: &str) -> Self {
        Self::new(ErrorCode::InvalidArgument, message)
    }

    pub fn null_pointer(message: &str) -> Self {
        Self::new(ErrorCode::NullPointer, message)
    }

    pub fn internal(message: String) -> Self {
        Self::new(ErrorCode::InternalError, &message)
    }

    pub fn not_initialized(component: &str) -> Self {
        Self::new(
            ErrorCode::NotInitialized,
            &format!("{} not initialized; call export_initialize first", component),
        )
    }
}

impl From<DbError> for FFIError {
    fn from(err: DbError) -> Self {
        let message = err.to_string();
        match err {
            DbError::NotFound(entity, id) => Self::with_details(
                ErrorCode::DatabaseNotFound,
                &message,
                json!({ "entity": entity, "id": id }),
            ),
            DbError::Conflict(_) => Self::new(ErrorCode::DatabaseConflict, &message),
            DbError::Migration(_) => Self::new(ErrorCode::DatabaseMigration, &message),
            DbError::CorruptRow { table, .. } => {
                Self::with_details(ErrorCode::DatabaseCorruptRow, &message, json!({ "table": table }))
            }
            DbError::Sqlx(_) | DbError::Query(_) | DbError::Other(_) => Self::new(ErrorCode::DatabaseGeneral, &message),
        }
    }
}

impl From<ExportError> for FFIError {
    fn from(err: ExportError) -> Self {
        let message = err.to_string();
        match err {
            ExportError::InvalidRange { start, end } => Self::with_details(
                ErrorCode::InvalidRange,
                &message,
                json!({ "startDate": start, "endDate": end }),
            ),
            ExportError::InvalidDate { field, value } => Self::with_details(
                ErrorCode::InvalidDate,
                &message,
                json!({ "field": field, "value": value }),
            ),
            ExportError::UnknownColumn { entity_type, columns } => Self::with_details(
                ErrorCode::UnknownColumn,
                &message,
                json!({ "entityType": entity_type, "columns": columns }),
            ),
            ExportError::UnsupportedEntityType(value) => {
                Self::with_details(ErrorCode::UnsupportedEntityType, &message, json!({ "entityType": value }))
            }
            ExportError::UnsupportedFormat(value) => {
                Self::with_details(ErrorCode::UnsupportedFormat, &message, json!({ "format": value }))
            }
            ExportError::UnsupportedDeliveryMode(value) => {
                Self::with_details(ErrorCode::UnsupportedDeliveryMode, &message, json!({ "deliveryMode": value }))
            }
            ExportError::InvalidWindow { days, max } => {
                Self::with_details(ErrorCode::InvalidWindow, &message, json!({ "days": days, "max": max }))
            }
            ExportError::ExportTooLarge { rows, limit } => {
                Self::with_details(ErrorCode::ExportTooLarge, &message, json!({ "rows": rows, "limit": limit }))
            }
            ExportError::RowSourceFault(_) => Self::new(ErrorCode::RowSourceFault, &message),
            ExportError::EncodingFault(_) => Self::new(ErrorCode::EncodingFault, &message),
            ExportError::JobNotFound(id) => {
                Self::with_details(ErrorCode::JobNotFound, &message, json!({ "jobId": id }))
            }
            ExportError::JobNotReady { id, status } => Self::with_details(
                ErrorCode::JobNotReady,
                &message,
                json!({ "jobId": id, "status": status }),
            ),
            ExportError::PermissionDenied(_) => Self::new(ErrorCode::PermissionDenied, &message),
            ExportError::Storage(_) => Self::new(ErrorCode::StorageError, &message),
            ExportError::QueueClosed => Self::new(ErrorCode::QueueClosed, &message),
            ExportError::Database(db) => db.into(),
            ExportError::Internal(_) => Self::new(ErrorCode::InternalError, &message),
        }
    }
}

/// Result type for FFI operations
pub type FFIResult<T> = Result<T, FFIError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_errors_carry_offending_values() {
        let err: FFIError = ExportError::unknown_columns("invoice", vec!["foo".into()]).into();
        assert_eq!(err.code, ErrorCode::UnknownColumn);
        let details: serde_json::Value = serde_json::from_str(err.details.as_deref().unwrap()).unwrap();
        assert_eq!(details["columns"][0], "foo");
        assert_eq!(details["entityType"], "invoice");
    }

    #[test]
    fn database_errors_keep_their_code_through_export_errors() {
        let err: FFIError = ExportError::Database(DbError::NotFound("ExportJob".into(), "x".into())).into();
        assert_eq!(err.code, ErrorCode::DatabaseNotFound);
        assert_eq!(ErrorCode::JobNotReady as i32, 304);
    }
}
