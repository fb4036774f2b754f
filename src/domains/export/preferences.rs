use async_trait::async_trait;
use chrono::Utc;
use sqlx::{query, query_as, SqlitePool};
use std::sync::Arc;
use uuid::Uuid;

use crate::domains::export::entities::projection;
use crate::domains::export::types::EntityType;
use crate::domains::export::validator::validate_columns;
use crate::errors::{DbError, DbResult, ExportResult};
use crate::types::format_timestamp;

/// Saved column projections, one row per `(user, entity)`; last write wins.
#[async_trait]
pub trait ColumnPreferenceRepository: Send + Sync {
    async fn find(&self, user_id: Uuid, entity_type: EntityType) -> DbResult<Option<Vec<String>>>;

    /// Replace any existing preference outright.
    async fn upsert(&self, user_id: Uuid, entity_type: EntityType, columns: &[String]) -> DbResult<()>;

    async fn delete(&self, user_id: Uuid, entity_type: EntityType) -> DbResult<()>;
}

pub struct SqliteColumnPreferenceRepository {
    pool: SqlitePool,
}

impl SqliteColumnPreferenceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ColumnPreferenceRepository for SqliteColumnPreferenceRepository {
    async fn find(&self, user_id: Uuid, entity_type: EntityType) -> DbResult<Option<Vec<String>>> {
        let row: Option<(String,)> = query_as(
            "SELECT columns FROM column_preferences WHERE user_id = ? AND entity_type = ?",
        )
        .bind(user_id.to_string())
        .bind(entity_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        match row {
            None => Ok(None),
            Some((raw,)) => serde_json::from_str::<Vec<String>>(&raw)
                .map(Some)
                .map_err(|e| DbError::corrupt("column_preferences", e.to_string())),
        }
    }

    async fn upsert(&self, user_id: Uuid, entity_type: EntityType, columns: &[String]) -> DbResult<()> {
        let encoded = serde_json::to_string(columns)
            .map_err(|e| DbError::Other(format!("Failed to encode columns: {}", e)))?;
        query(
            "INSERT INTO column_preferences (user_id, entity_type, columns, updated_at) VALUES (?, ?, ?, ?)
             ON CONFLICT(user_id, entity_type) DO UPDATE SET columns = excluded.columns, updated_at = excluded.updated_at",
        )
        .bind(user_id.to_string())
        .bind(entity_type.as_str())
        .bind(encoded)
        .bind(format_timestamp(&Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, user_id: Uuid, entity_type: EntityType) -> DbResult<()> {
        query("DELETE FROM column_preferences WHERE user_id = ? AND entity_type = ?")
            .bind(user_id.to_string())
            .bind(entity_type.as_str())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

/// Column projection per user, falling back to the entity's full schema.
#[derive(Clone)]
pub struct ColumnPreferenceService {
    repo: Arc<dyn ColumnPreferenceRepository>,
}

impl ColumnPreferenceService {
    pub fn new(repo: Arc<dyn ColumnPreferenceRepository>) -> Self {
        Self { repo }
    }

    /// The stored preference, if any, without falling back.
    pub async fn saved(&self, user_id: Uuid, entity_type: EntityType) -> ExportResult<Option<Vec<String>>> {
        Ok(self.repo.find(user_id, entity_type).await?)
    }

    pub async fn get(&self, user_id: Uuid, entity_type: EntityType) -> ExportResult<Vec<String>> {
        match self.saved(user_id, entity_type).await? {
            Some(columns) if !columns.is_empty() => Ok(columns),
            _ => Ok(projection(entity_type)?.default_columns()),
        }
    }

    /// Validate and overwrite. An empty list clears the preference so defaults apply again.
    pub async fn set(&self, user_id: Uuid, entity_type: EntityType, columns: &[String]) -> ExportResult<Vec<String>> {
        let projection = projection(entity_type)?;
        if columns.is_empty() {
            self.repo.delete(user_id, entity_type).await?;
            log::debug!("Cleared {} column preference for {}", entity_type, user_id);
            return Ok(projection.default_columns());
        }

        let columns = validate_columns(projection.as_ref(), columns)?;
        self.repo.upsert(user_id, entity_type, &columns).await?;
        log::debug!(
            "Saved {} column preference for {}: {}",
            entity_type,
            user_id,
            columns.join(",")
        );
        Ok(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domains::export::test_support::memory_pool;
    use crate::errors::ExportError;

    async fn service() -> ColumnPreferenceService {
        let pool = memory_pool().await;
        ColumnPreferenceService::new(Arc::new(SqliteColumnPreferenceRepository::new(pool)))
    }

    fn cols(keys: &[&str]) -> Vec<String> {
        keys.iter().map(|k| k.to_string()).collect()
    }

    #[tokio::test]
    async fn falls_back_to_full_schema() {
        let prefs = service().await;
        let user = Uuid::new_v4();
        let columns = prefs.get(user, EntityType::Invoice).await.unwrap();
        assert_eq!(columns, projection(EntityType::Invoice).unwrap().default_columns());
    }

    #[tokio::test]
    async fn latest_save_wins() {
        let prefs = service().await;
        let user = Uuid::new_v4();
        prefs.set(user, EntityType::Invoice, &cols(&["number", "total"])).await.unwrap();
        prefs.set(user, EntityType::Invoice, &cols(&["status", "id"])).await.unwrap();
        assert_eq!(prefs.get(user, EntityType::Invoice).await.unwrap(), cols(&["status", "id"]));

        // Other entities and other users are untouched
        let other = Uuid::new_v4();
        assert_eq!(
            prefs.get(other, EntityType::Invoice).await.unwrap().len(),
            projection(EntityType::Invoice).unwrap().columns().len()
        );
    }

    #[tokio::test]
    async fn rejects_unknown_columns_without_saving() {
        let prefs = service().await;
        let user = Uuid::new_v4();
        prefs.set(user, EntityType::Vehicle, &cols(&["make"])).await.unwrap();
        let err = prefs
            .set(user, EntityType::Vehicle, &cols(&["make", "colour", "wheels"]))
            .await
            .unwrap_err();
        match err {
            ExportError::UnknownColumn { columns, .. } => assert_eq!(columns, cols(&["colour", "wheels"])),
            other => panic!("unexpected error: {:?}", other),
        }
        assert_eq!(prefs.get(user, EntityType::Vehicle).await.unwrap(), cols(&["make"]));
    }

    #[tokio::test]
    async fn empty_save_clears_preference() {
        let prefs = service().await;
        let user = Uuid::new_v4();
        prefs.set(user, EntityType::Staff, &cols(&["email"])).await.unwrap();
        prefs.set(user, EntityType::Staff, &[]).await.unwrap();
        assert!(prefs.saved(user, EntityType::Staff).await.unwrap().is_none());
    }
}
