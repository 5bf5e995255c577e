//! # Settings Repository
//!
//! Typed key/value settings. Values are stored as JSON so any `Serialize`
//! type round-trips without a dedicated column.

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::DbResult;

/// Well-known setting keys.
pub mod keys {
    /// Last successful catalog sync (`DateTime<Utc>`).
    pub const ITEMS_LAST_SYNC: &str = "items_last_sync";
    /// Last successful customer sync (`DateTime<Utc>`).
    pub const CUSTOMERS_LAST_SYNC: &str = "customers_last_sync";
    /// Fingerprint of the embedded migration set.
    pub const SCHEMA_HASH: &str = "schema_hash";
    /// Bumped each time the fingerprint changes.
    pub const SCHEMA_VERSION: &str = "schema_version";
    /// Sentinel written at startup and read by the health check.
    pub const HEALTH_CHECK: &str = "health_check";
    pub const CACHE_VERSION: &str = "cache_version";
    /// Cashier forced offline mode (`bool`).
    pub const MANUAL_OFFLINE: &str = "manual_offline";
}

/// Repository for the `settings` table.
#[derive(Debug, Clone)]
pub struct SettingsRepository {
    pool: SqlitePool,
}

impl SettingsRepository {
    pub fn new(pool: SqlitePool) -> Self {
        SettingsRepository { pool }
    }

    /// Reads a setting. Missing keys yield `Ok(None)`.
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> DbResult<Option<T>> {
        let raw: Option<String> = sqlx::query_scalar("SELECT value FROM settings WHERE key = ?1")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;

        Ok(raw.map(|v| serde_json::from_str(&v)).transpose()?)
    }

    /// Writes a setting, replacing any previous value.
    pub async fn set<T: Serialize + ?Sized>(&self, key: &str, value: &T) -> DbResult<()> {
        let encoded = serde_json::to_string(value)?;
        debug!(key = %key, "Writing setting");

        sqlx::query(
            r#"
            INSERT INTO settings (key, value, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(encoded)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Removes a setting. Returns true if it existed.
    pub async fn delete(&self, key: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM settings WHERE key = ?1")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use chrono::DateTime;

    #[tokio::test]
    async fn test_typed_round_trip() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let settings = db.settings();

        settings.set(keys::MANUAL_OFFLINE, &true).await.unwrap();
        assert_eq!(settings.get::<bool>(keys::MANUAL_OFFLINE).await.unwrap(), Some(true));

        let now = Utc::now();
        settings.set(keys::ITEMS_LAST_SYNC, &now).await.unwrap();
        let stored: Option<DateTime<Utc>> = settings.get(keys::ITEMS_LAST_SYNC).await.unwrap();
        assert_eq!(stored, Some(now));

        assert!(settings.delete(keys::MANUAL_OFFLINE).await.unwrap());
        assert!(!settings.delete(keys::MANUAL_OFFLINE).await.unwrap());
        assert_eq!(settings.get::<bool>(keys::MANUAL_OFFLINE).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_wrong_type_is_serialization_error() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.settings().set("answer", "forty-two").await.unwrap();

        let err = db.settings().get::<u32>("answer").await.unwrap_err();
        assert!(matches!(err, crate::DbError::Serialization(_)));
    }
}
