use sqlx::SqlitePool;

use crate::errors::{DbError, DbResult};
use crate::types::format_timestamp;

// Embed all migration SQL files at compile time
const MIGRATION_EXPORT_JOBS: &str = include_str!("../migrations/20250601000000_create_export_jobs.sql");
const MIGRATION_EXPORT_EVENTS: &str = include_str!("../migrations/20250602000000_create_export_events.sql");
const MIGRATION_PORTAL_RECORDS: &str = include_str!("../migrations/20250603000000_create_portal_records.sql");

// List of migrations with their names and SQL content
const MIGRATIONS: &[(&str, &str)] = &[
    ("20250601000000_create_export_jobs.sql", MIGRATION_EXPORT_JOBS),
    ("20250602000000_create_export_events.sql", MIGRATION_EXPORT_EVENTS),
    ("20250603000000_create_portal_records.sql", MIGRATION_PORTAL_RECORDS),
];

/// Bring the schema up to date. Safe to call on every start.
pub async fn run_migrations(pool: &SqlitePool) -> DbResult<()> {
    log::debug!("Starting database migration process");

    create_migrations_table(pool).await?;

    let last_migration = get_last_migration(pool).await?;
    match &last_migration {
        Some(name) => log::debug!("Last applied migration: {}", name),
        None => log::debug!("No migrations applied yet"),
    }

    apply_pending_migrations(pool, last_migration).await
}

/// Create migrations table if it doesn't exist
async fn create_migrations_table(pool: &SqlitePool) -> DbResult<()> {
    sqlx::query(
        "CREATE TABLE IF NOT EXISTS migrations (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL
        )",
    )
    .execute(pool)
    .await
    .map_err(|e| DbError::Migration(format!("Failed to create migrations table: {}", e)))?;

    Ok(())
}

/// Get the last applied migration
async fn get_last_migration(pool: &SqlitePool) -> DbResult<Option<String>> {
    sqlx::query_scalar::<_, String>("SELECT name FROM migrations ORDER BY id DESC LIMIT 1")
        .fetch_optional(pool)
        .await
        .map_err(|e| DbError::Migration(format!("Failed to get last migration: {}", e)))
}

/// Apply pending migrations in one transaction
async fn apply_pending_migrations(pool: &SqlitePool, last_migration: Option<String>) -> DbResult<()> {
    let pending_migrations = get_pending_migrations(last_migration.as_deref())?;

    if pending_migrations.is_empty() {
        log::debug!("No pending migrations to apply");
        return Ok(());
    }

    let mut tx = pool
        .begin()
        .await
        .map_err(|e| DbError::Migration(format!("Failed to begin transaction: {}", e)))?;

    for (migration_name, migration_sql) in pending_migrations {
        log::info!("Applying migration {}", migration_name);

        sqlx::raw_sql(migration_sql)
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to apply migration {}: {}", migration_name, e)))?;

        sqlx::query("INSERT INTO migrations (name, applied_at) VALUES (?, ?)")
            .bind(migration_name)
            .bind(format_timestamp(&chrono::Utc::now()))
            .execute(&mut *tx)
            .await
            .map_err(|e| DbError::Migration(format!("Failed to record migration {}: {}", migration_name, e)))?;
    }

    tx.commit()
        .await
        .map_err(|e| DbError::Migration(format!("Failed to commit migrations: {}", e)))?;

    log::info!("All migrations applied");
    Ok(())
}

/// Determine which migrations need to be applied
fn get_pending_migrations(last_migration: Option<&str>) -> DbResult<Vec<(&'static str, &'static str)>> {
    let last = match last_migration {
        None => return Ok(MIGRATIONS.to_vec()),
        Some(last) => last,
    };

    match MIGRATIONS.iter().position(|(name, _)| *name == last) {
        Some(index) => Ok(MIGRATIONS[index + 1..].to_vec()),
        None => Err(DbError::Migration(format!(
            "Database was migrated by an unknown migration: {}",
            last
        ))),
    }
}
