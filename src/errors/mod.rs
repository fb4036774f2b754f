mod error;

pub use error::{DbError, ExportError};

/// Result type for database operations
pub type DbResult<T> = Result<T, DbError>;

/// Result type for export operations
pub type ExportResult<T> = Result<T, ExportError>;

/// Readable text from a caught panic payload.
pub fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
