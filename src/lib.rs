// Public modules
pub mod auth;
pub mod config;
pub mod domains;
pub mod errors;
pub mod ffi;
pub mod globals;
pub mod types;

// Private modules
mod db_migration;

pub use config::ExportConfig;
pub use errors::{DbError, ExportError, ExportResult};

/// Install the env_logger backend once. `RUST_LOG` overrides the default `info` filter.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).try_init();
}

/// Initialize the library against the database at `db_url`.
/// This function must be called before any other function in the library.
pub fn initialize(db_url: &str, config: ExportConfig) -> ffi::FFIResult<()> {
    ffi::block_on_async(globals::initialize(db_url, config))
}
