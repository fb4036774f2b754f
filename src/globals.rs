use lazy_static::lazy_static;
use once_cell::sync::OnceCell;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::runtime::Runtime;

use crate::config::ExportConfig;
use crate::db_migration::run_migrations;
use crate::domains::core::artifact_store::LocalArtifactStore;
use crate::domains::export::notifier::LogNotifier;
use crate::domains::export::record_source::SqliteRecordSource;
use crate::domains::export::service::ExportService;
use crate::ffi::error::{FFIError, FFIResult};

/// Long-lived runtime hosting the worker pool; FFI calls block on it.
static RUNTIME: OnceCell<Runtime> = OnceCell::new();

// Global state definitions
lazy_static! {
    static ref INIT_MUTEX: tokio::sync::Mutex<()> = tokio::sync::Mutex::new(());
    static ref DB_POOL: Mutex<Option<SqlitePool>> = Mutex::new(None);
    static ref EXPORT_SERVICE: Mutex<Option<Arc<ExportService>>> = Mutex::new(None);
}

pub fn runtime() -> FFIResult<&'static Runtime> {
    RUNTIME
        .get_or_try_init(|| {
            tokio::runtime::Builder::new_multi_thread()
                .enable_all()
                .thread_name("portal-export")
                .build()
        })
        .map_err(|e| FFIError::internal(format!("Failed to start Tokio runtime: {}", e)))
}

fn lock_poisoned(name: &str) -> FFIError {
    FFIError::internal(format!("{} lock poisoned", name))
}

pub fn is_initialized() -> bool {
    EXPORT_SERVICE.lock().map(|s| s.is_some()).unwrap_or(false)
}

/// Connect, migrate, wire the export service and recover unfinished jobs.
/// Calling it again after a successful run is a no-op.
pub async fn initialize(db_url: &str, config: ExportConfig) -> FFIResult<()> {
    let _guard = INIT_MUTEX.lock().await;
    if is_initialized() {
        log::debug!("Export core already initialized");
        return Ok(());
    }
    crate::init_logging();
    log::info!("Initializing export core");
    log::debug!("Database URL: {}", db_url);

    let options = SqliteConnectOptions::from_str(db_url)
        .map_err(|e| FFIError::invalid_argument(&format!("Invalid database URL: {}", e)))?
        .create_if_missing(true);
    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect_with(options)
        .await
        .map_err(|e| FFIError::internal(format!("Database connection failed: {}", e)))?;
    run_migrations(&pool).await?;

    let store = LocalArtifactStore::new(&config.storage_path).map_err(|e| {
        FFIError::internal(format!(
            "Cannot create artifact directory {}: {}",
            config.storage_path.display(),
            e
        ))
    })?;
    let records = Arc::new(SqliteRecordSource::new(pool.clone()));
    let service = ExportService::new(config, pool.clone(), records, Arc::new(store), Arc::new(LogNotifier));
    let requeued = service.recover().await?;
    log::info!("Export core ready; {} pending jobs re-queued", requeued);

    *DB_POOL.lock().map_err(|_| lock_poisoned("DB_POOL"))? = Some(pool);
    *EXPORT_SERVICE.lock().map_err(|_| lock_poisoned("EXPORT_SERVICE"))? = Some(Arc::new(service));
    Ok(())
}

pub fn get_export_service() -> FFIResult<Arc<ExportService>> {
    EXPORT_SERVICE
        .lock()
        .map_err(|_| lock_poisoned("EXPORT_SERVICE"))?
        .clone()
        .ok_or_else(|| FFIError::not_initialized("Export service"))
}

/// Drain the workers and close the pool. The core can be initialized again afterwards.
pub async fn shutdown() -> FFIResult<()> {
    let service = EXPORT_SERVICE.lock().map_err(|_| lock_poisoned("EXPORT_SERVICE"))?.take();
    let pool = DB_POOL.lock().map_err(|_| lock_poisoned("DB_POOL"))?.take();
    if let Some(service) = service {
        service.shutdown().await;
    }
    if let Some(pool) = pool {
        pool.close().await;
    }
    log::info!("Export core shut down");
    Ok(())
}
