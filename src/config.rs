use std::path::PathBuf;
use std::str::FromStr;

/// Tunables for the export pipeline.
///
/// Every value has a sensible default; `from_env` lets a host override them
/// through the process environment or a `.env` file.
#[derive(Debug, Clone)]
pub struct ExportConfig {
    /// Background workers draining the job queue
    pub worker_count: usize,
    /// Job ids buffered in the queue channel before `enqueue` waits
    pub queue_capacity: usize,
    /// Synchronous CSV exports estimated above this switch to streaming
    pub buffer_threshold_rows: u64,
    /// Hard ceiling for the fully buffered document format
    pub document_row_ceiling: u64,
    /// `enqueue` completes the job in-call at or below this estimate; 0 disables
    pub inline_job_rows: u64,
    /// Records fetched from the record store per page
    pub source_batch_size: usize,
    pub analytics_top_days: usize,
    pub max_analytics_days: u32,
    /// Root directory for persisted artifacts
    pub storage_path: PathBuf,
}

impl Default for ExportConfig {
    fn default() -> Self {
        Self {
            worker_count: 2,
            queue_capacity: 256,
            buffer_threshold_rows: 5_000,
            document_row_ceiling: 2_000,
            inline_job_rows: 200,
            source_batch_size: 500,
            analytics_top_days: 5,
            max_analytics_days: 366,
            storage_path: PathBuf::from("./exports"),
        }
    }
}

impl ExportConfig {
    /// Load from the environment, reading a `.env` file first if one exists.
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build a config from an arbitrary key lookup. Unparseable values keep the default.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let config = Self {
            worker_count: parse_or("EXPORT_WORKER_COUNT", &lookup, defaults.worker_count).max(1),
            queue_capacity: parse_or("EXPORT_QUEUE_CAPACITY", &lookup, defaults.queue_capacity).max(1),
            buffer_threshold_rows: parse_or("EXPORT_BUFFER_THRESHOLD_ROWS", &lookup, defaults.buffer_threshold_rows),
            document_row_ceiling: parse_or("EXPORT_DOCUMENT_ROW_CEILING", &lookup, defaults.document_row_ceiling),
            inline_job_rows: parse_or("EXPORT_INLINE_JOB_ROWS", &lookup, defaults.inline_job_rows),
            source_batch_size: parse_or("EXPORT_SOURCE_BATCH_SIZE", &lookup, defaults.source_batch_size).max(1),
            analytics_top_days: parse_or("EXPORT_ANALYTICS_TOP_DAYS", &lookup, defaults.analytics_top_days),
            max_analytics_days: parse_or("EXPORT_MAX_ANALYTICS_DAYS", &lookup, defaults.max_analytics_days).max(1),
            storage_path: lookup("EXPORT_STORAGE_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.storage_path),
        };
        log::debug!("Export configuration: {:?}", config);
        config
    }
}

fn parse_or<T, F>(key: &str, lookup: &F, default: T) -> T
where
    T: FromStr + std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                log::warn!("Ignoring invalid value '{}' for {}; using {}", raw, key, default);
                default
            }
        },
    }
}
