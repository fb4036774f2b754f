pub mod analytics;
pub mod entities;
pub mod events;
pub mod notifier;
pub mod pipeline;
pub mod preferences;
pub mod queue_manager;
pub mod record_source;
pub mod repository;
pub mod row_source;
pub mod schema;
pub mod service;
pub mod types;
pub mod validator;
pub mod writers;

#[cfg(test)]
mod test_support;

pub use analytics::{AnalyticsComparison, AnalyticsReport, AnalyticsService, AnalyticsWindow};
pub use notifier::{BroadcastNotifier, JobEvent, JobEventNotifier, LogNotifier};
pub use record_source::{RecordSource, SqliteRecordSource};
pub use service::{ColumnInfo, ExportService};
pub use types::{
    DeliveryMode, EnqueueOutcome, EntityType, ExportFormat, ExportOutcome, ExportStatus, JobStatusView,
    RawExportRequest,
};
