//! # Offline Queue Repository
//!
//! Durable queues for invoices and payments created while the backend was
//! unreachable. Both tables share one shape and one repository.
//!
//! ## Entry Lifecycle
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    Offline Queue Entry                                  │
//! │                                                                         │
//! │  enqueue(payload)                                                      │
//! │       │   synced = 0, retry_count = 0, sync_failed = 0                 │
//! │       ▼                                                                 │
//! │  ┌─────────┐  submit ok   ┌─────────┐  older than retention  ┌──────┐  │
//! │  │ PENDING │ ───────────► │ SYNCED  │ ─────────────────────► │PURGED│  │
//! │  └────┬────┘              └─────────┘                        └──────┘  │
//! │       │ submit failed                                                   │
//! │       ▼                                                                 │
//! │  retry_count += 1, error = last error                                  │
//! │       │                                                                 │
//! │       ├── retry_count < max ──► PENDING (next drain)                   │
//! │       │                                                                 │
//! │       └── retry_count ≥ max ──► QUARANTINED (sync_failed = 1)          │
//! │                                   │                                     │
//! │                                   ├── retry_failed(id) ──► PENDING     │
//! │                                   └── delete(id)                       │
//! │                                                                         │
//! │  Unsynced entries (pending or quarantined) are never purged.           │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tracing::{debug, info, warn};

use crate::error::{DbError, DbResult};
use crate::repository::stock::{self, StockMovement};
use tally_core::OfflineQueueEntry;

const INVOICE_QUEUE: &str = "invoice_queue";
const PAYMENT_QUEUE: &str = "payment_queue";

#[derive(Debug, sqlx::FromRow)]
struct QueueRow {
    id: i64,
    payload: String,
    timestamp: DateTime<Utc>,
    synced: bool,
    retry_count: i64,
    sync_failed: bool,
    error: Option<String>,
    draft_name: Option<String>,
}

impl TryFrom<QueueRow> for OfflineQueueEntry {
    type Error = DbError;

    fn try_from(row: QueueRow) -> DbResult<Self> {
        Ok(OfflineQueueEntry {
            id: row.id,
            payload: serde_json::from_str(&row.payload)?,
            timestamp: row.timestamp,
            synced: row.synced,
            retry_count: u32::try_from(row.retry_count).unwrap_or(u32::MAX),
            sync_failed: row.sync_failed,
            error: row.error,
            draft_name: row.draft_name,
        })
    }
}

/// Repository for one offline queue table.
#[derive(Debug, Clone)]
pub struct QueueRepository {
    pool: SqlitePool,
    table: &'static str,
}

impl QueueRepository {
    /// The offline invoice queue.
    pub fn invoices(pool: SqlitePool) -> Self {
        QueueRepository {
            pool,
            table: INVOICE_QUEUE,
        }
    }

    /// The offline payment queue.
    pub fn payments(pool: SqlitePool) -> Self {
        QueueRepository {
            pool,
            table: PAYMENT_QUEUE,
        }
    }

    fn select(&self, filter: &str) -> String {
        format!(
            "SELECT id, payload, timestamp, synced, retry_count, sync_failed, error, draft_name \
             FROM {} {filter}",
            self.table
        )
    }

    /// Appends an entry with `synced = false, retry_count = 0`.
    pub async fn enqueue(&self, payload: &serde_json::Value) -> DbResult<OfflineQueueEntry> {
        self.enqueue_with_movements(payload, &[]).await
    }

    /// Appends an entry and takes `movements` out of the stock ledger in the
    /// same transaction. Either both land or neither does.
    pub async fn enqueue_with_movements(
        &self,
        payload: &serde_json::Value,
        movements: &[StockMovement],
    ) -> DbResult<OfflineQueueEntry> {
        let now = Utc::now();
        let encoded = serde_json::to_string(payload)?;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let result = sqlx::query(&format!(
            "INSERT INTO {} (payload, timestamp, synced, retry_count, sync_failed) \
             VALUES (?1, ?2, 0, 0, 0)",
            self.table
        ))
        .bind(encoded)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        let id = result.last_insert_rowid();

        stock::decrement_in(&mut *tx, movements, now).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(
            table = self.table,
            id,
            movements = movements.len(),
            "Queued offline entry"
        );

        Ok(OfflineQueueEntry {
            id,
            payload: payload.clone(),
            timestamp: now,
            synced: false,
            retry_count: 0,
            sync_failed: false,
            error: None,
            draft_name: None,
        })
    }

    pub async fn get(&self, id: i64) -> DbResult<Option<OfflineQueueEntry>> {
        let row: Option<QueueRow> = sqlx::query_as(&self.select("WHERE id = ?1"))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(OfflineQueueEntry::try_from).transpose()
    }

    /// Entries eligible for automatic replay, oldest first.
    pub async fn pending(&self) -> DbResult<Vec<OfflineQueueEntry>> {
        let rows: Vec<QueueRow> = sqlx::query_as(
            &self.select("WHERE synced = 0 AND sync_failed = 0 ORDER BY id ASC"),
        )
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(OfflineQueueEntry::try_from).collect()
    }

    /// Every unsynced entry, quarantined ones included, oldest first.
    pub async fn unsynced(&self) -> DbResult<Vec<OfflineQueueEntry>> {
        let rows: Vec<QueueRow> = sqlx::query_as(&self.select("WHERE synced = 0 ORDER BY id ASC"))
            .fetch_all(&self.pool)
            .await?;
        rows.into_iter().map(OfflineQueueEntry::try_from).collect()
    }

    pub async fn count_unsynced(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE synced = 0",
            self.table
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    pub async fn mark_synced(&self, id: i64) -> DbResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET synced = 1, sync_failed = 0, error = NULL, synced_at = ?2 WHERE id = ?1",
            self.table
        ))
        .bind(id)
        .bind(Utc::now())
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(self.table, id.to_string()));
        }
        Ok(())
    }

    /// Remembers the backend draft accepted in phase 1.
    pub async fn set_draft_name(&self, id: i64, draft_name: &str) -> DbResult<()> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET draft_name = ?2 WHERE id = ?1",
            self.table
        ))
        .bind(id)
        .bind(draft_name)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(self.table, id.to_string()));
        }
        Ok(())
    }

    /// Records a failed attempt. At `max_retries` cumulative failures the
    /// entry is quarantined.
    pub async fn record_failure(
        &self,
        id: i64,
        error: &str,
        max_retries: u32,
    ) -> DbResult<OfflineQueueEntry> {
        let result = sqlx::query(&format!(
            r#"
            UPDATE {} SET
                retry_count = retry_count + 1,
                error = ?2,
                sync_failed = CASE WHEN retry_count + 1 >= ?3 THEN 1 ELSE 0 END
            WHERE id = ?1
            "#,
            self.table
        ))
        .bind(id)
        .bind(error)
        .bind(i64::from(max_retries))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(DbError::not_found(self.table, id.to_string()));
        }

        let entry = self
            .get(id)
            .await?
            .ok_or_else(|| DbError::not_found(self.table, id.to_string()))?;
        if entry.sync_failed {
            warn!(table = self.table, id, retries = entry.retry_count, error = %error, "Entry quarantined");
        }
        Ok(entry)
    }

    /// Clears a quarantine so the next drain retries the entry.
    pub async fn retry_failed(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query(&format!(
            "UPDATE {} SET sync_failed = 0, retry_count = 0, error = NULL \
             WHERE id = ?1 AND synced = 0",
            self.table
        ))
        .bind(id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn delete(&self, id: i64) -> DbResult<bool> {
        let result = sqlx::query(&format!("DELETE FROM {} WHERE id = ?1", self.table))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Deletes synced entries whose sync time is older than `cutoff`.
    pub async fn purge_synced_before(&self, cutoff: DateTime<Utc>) -> DbResult<u64> {
        let result = sqlx::query(&format!(
            "DELETE FROM {} WHERE synced = 1 AND synced_at IS NOT NULL AND synced_at < ?1",
            self.table
        ))
        .bind(cutoff)
        .execute(&self.pool)
        .await?;

        let purged = result.rows_affected();
        if purged > 0 {
            info!(table = self.table, purged, "Purged synced entries");
        }
        Ok(purged)
    }

    /// Deletes synced entries older than `retention_days`.
    pub async fn cleanup_old_entries(&self, retention_days: u32) -> DbResult<u64> {
        let cutoff = Utc::now() - Duration::days(i64::from(retention_days));
        self.purge_synced_before(cutoff).await
    }

    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query(&format!("DELETE FROM {}", self.table))
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use serde_json::json;

    #[tokio::test]
    async fn test_enqueue_and_mark_synced() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.invoice_queue();

        let entry = queue.enqueue(&json!({"items": [{"item_code": "A"}]})).await.unwrap();
        assert!(!entry.synced);
        assert_eq!(entry.retry_count, 0);
        assert_eq!(queue.count_unsynced().await.unwrap(), 1);

        queue.mark_synced(entry.id).await.unwrap();
        assert_eq!(queue.count_unsynced().await.unwrap(), 0);
        assert!(queue.pending().await.unwrap().is_empty());
        assert!(queue.get(entry.id).await.unwrap().unwrap().synced);
    }

    #[tokio::test]
    async fn test_enqueue_with_movements_decrements_stock() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.invoice_queue();

        let entry = queue
            .enqueue_with_movements(&json!({"n": 1}), &[StockMovement::new("A", "Stores", 2.0)])
            .await
            .unwrap();

        assert_eq!(queue.get(entry.id).await.unwrap().unwrap().id, entry.id);
        assert_eq!(db.stock().get("A", "Stores").await.unwrap(), Some(-2.0));
    }

    #[tokio::test]
    async fn test_enqueue_rolls_back_when_decrement_fails() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.invoice_queue();
        sqlx::query("DROP TABLE stock").execute(db.pool()).await.unwrap();

        let movements = [StockMovement::new("A", "Stores", 1.0)];
        assert!(queue.enqueue_with_movements(&json!({"n": 1}), &movements).await.is_err());
        assert!(queue.enqueue_with_movements(&json!({"n": 1}), &movements).await.is_err());
        assert_eq!(queue.count_unsynced().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_quarantine_after_max_retries() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.invoice_queue();
        let entry = queue.enqueue(&json!({"n": 1})).await.unwrap();

        for attempt in 1..=3 {
            let updated = queue.record_failure(entry.id, "HTTP 500", 3).await.unwrap();
            assert_eq!(updated.retry_count, attempt);
            assert_eq!(updated.sync_failed, attempt == 3);
        }

        assert!(queue.pending().await.unwrap().is_empty());
        let visible = queue.unsynced().await.unwrap();
        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].error.as_deref(), Some("HTTP 500"));

        assert!(queue.retry_failed(entry.id).await.unwrap());
        assert_eq!(queue.pending().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_purge_only_touches_synced() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.invoice_queue();
        let synced = queue.enqueue(&json!({"n": 1})).await.unwrap();
        let failed = queue.enqueue(&json!({"n": 2})).await.unwrap();
        queue.enqueue(&json!({"n": 3})).await.unwrap();

        queue.mark_synced(synced.id).await.unwrap();
        queue.record_failure(failed.id, "boom", 1).await.unwrap();

        let purged = queue
            .purge_synced_before(Utc::now() + Duration::days(1))
            .await
            .unwrap();
        assert_eq!(purged, 1);
        assert_eq!(queue.unsynced().await.unwrap().len(), 2);

        assert_eq!(queue.cleanup_old_entries(7).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_draft_name_and_missing_ids() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let queue = db.invoice_queue();
        let entry = queue.enqueue(&json!({})).await.unwrap();

        queue.set_draft_name(entry.id, "ACC-PSINV-0007").await.unwrap();
        let stored = queue.get(entry.id).await.unwrap().unwrap();
        assert_eq!(stored.draft_name.as_deref(), Some("ACC-PSINV-0007"));

        assert!(matches!(
            queue.mark_synced(999).await,
            Err(DbError::NotFound { .. })
        ));
        assert!(queue.delete(entry.id).await.unwrap());
        assert!(!queue.delete(entry.id).await.unwrap());
    }

    #[tokio::test]
    async fn test_payment_queue_is_separate() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.payment_queue().enqueue(&json!({"amount": 5})).await.unwrap();

        assert_eq!(db.payment_queue().count_unsynced().await.unwrap(), 1);
        assert_eq!(db.invoice_queue().count_unsynced().await.unwrap(), 0);
    }
}
