//! # Draft Repository
//!
//! Carts parked on this device. A draft is taken (read and removed) when
//! the cashier resumes it.

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::LocalDraft;

#[derive(Debug, sqlx::FromRow)]
struct DraftRow {
    draft_id: String,
    timestamp: DateTime<Utc>,
    payload: String,
}

impl TryFrom<DraftRow> for LocalDraft {
    type Error = DbError;

    fn try_from(row: DraftRow) -> DbResult<Self> {
        Ok(LocalDraft {
            draft_id: row.draft_id,
            timestamp: row.timestamp,
            payload: serde_json::from_str(&row.payload)?,
        })
    }
}

#[derive(Debug, Clone)]
pub struct DraftRepository {
    pool: SqlitePool,
}

impl DraftRepository {
    pub fn new(pool: SqlitePool) -> Self {
        DraftRepository { pool }
    }

    /// Saves or overwrites a draft.
    pub async fn save(&self, draft_id: &str, payload: &serde_json::Value) -> DbResult<LocalDraft> {
        let now = Utc::now();
        sqlx::query(
            r#"
            INSERT INTO drafts (draft_id, timestamp, payload)
            VALUES (?1, ?2, ?3)
            ON CONFLICT (draft_id) DO UPDATE SET
                timestamp = excluded.timestamp,
                payload = excluded.payload
            "#,
        )
        .bind(draft_id)
        .bind(now)
        .bind(serde_json::to_string(payload)?)
        .execute(&self.pool)
        .await?;

        debug!(draft_id = %draft_id, "Saved draft");
        Ok(LocalDraft {
            draft_id: draft_id.to_string(),
            timestamp: now,
            payload: payload.clone(),
        })
    }

    /// Newest first.
    pub async fn list(&self) -> DbResult<Vec<LocalDraft>> {
        let rows: Vec<DraftRow> = sqlx::query_as(
            "SELECT draft_id, timestamp, payload FROM drafts ORDER BY timestamp DESC, id DESC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(LocalDraft::try_from).collect()
    }

    /// Reads and deletes a draft in one transaction.
    pub async fn take(&self, draft_id: &str) -> DbResult<Option<LocalDraft>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let row: Option<DraftRow> =
            sqlx::query_as("SELECT draft_id, timestamp, payload FROM drafts WHERE draft_id = ?1")
                .bind(draft_id)
                .fetch_optional(&mut *tx)
                .await?;

        if row.is_some() {
            sqlx::query("DELETE FROM drafts WHERE draft_id = ?1")
                .bind(draft_id)
                .execute(&mut *tx)
                .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        row.map(LocalDraft::try_from).transpose()
    }

    pub async fn delete(&self, draft_id: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM drafts WHERE draft_id = ?1")
            .bind(draft_id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM drafts")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM drafts").execute(&self.pool).await?;
        Ok(())
    }
}
