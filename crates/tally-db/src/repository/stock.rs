//! # Stock Repository
//!
//! Local stock ledger keyed by `(item_code, warehouse)`.
//!
//! Server pushes land through [`StockRepository::apply_quantities`], which
//! is authoritative. Sales queued while offline go through
//! [`StockRepository::decrement`] so the cached figure reflects stock that
//! has left the shelf but not yet reached the backend. The denormalized
//! `items.actual_qty` column is kept in step for the item's own warehouse.

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::StockUpdate;

#[derive(Debug, sqlx::FromRow)]
struct StockRow {
    item_code: String,
    warehouse: String,
    actual_qty: f64,
}

impl From<StockRow> for StockUpdate {
    fn from(row: StockRow) -> Self {
        StockUpdate::new(row.item_code, row.warehouse, row.actual_qty)
    }
}

/// One quantity leaving a warehouse.
#[derive(Debug, Clone, PartialEq)]
pub struct StockMovement {
    pub item_code: String,
    pub warehouse: String,
    pub qty: f64,
}

impl StockMovement {
    pub fn new(item_code: impl Into<String>, warehouse: impl Into<String>, qty: f64) -> Self {
        StockMovement {
            item_code: item_code.into(),
            warehouse: warehouse.into(),
            qty,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StockRepository {
    pool: SqlitePool,
}

impl StockRepository {
    pub fn new(pool: SqlitePool) -> Self {
        StockRepository { pool }
    }

    /// Sets authoritative quantities. Updates without a quantity are skipped.
    pub async fn apply_quantities(&self, updates: &[StockUpdate]) -> DbResult<usize> {
        let now = Utc::now();
        let mut applied = 0usize;

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for update in updates {
            if update.actual_qty.is_none() && update.stock_qty.is_none() {
                continue;
            }
            let qty = update.qty();

            sqlx::query(
                r#"
                INSERT INTO stock (item_code, warehouse, actual_qty, updated_at)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (item_code, warehouse) DO UPDATE SET
                    actual_qty = excluded.actual_qty,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&update.item_code)
            .bind(&update.warehouse)
            .bind(qty)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            applied += 1;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(applied, "Applied stock quantities");
        Ok(applied)
    }

    /// Subtracts sold quantities from the ledger and the item cache.
    ///
    /// Rows missing from the ledger start at zero and may go negative, the
    /// next server push corrects them.
    pub async fn decrement(&self, movements: &[StockMovement]) -> DbResult<usize> {
        if movements.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        decrement_in(&mut *tx, movements, now).await?;

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(count = movements.len(), "Decremented local stock");
        Ok(movements.len())
    }

    pub async fn get(&self, item_code: &str, warehouse: &str) -> DbResult<Option<f64>> {
        let qty: Option<f64> = sqlx::query_scalar(
            "SELECT actual_qty FROM stock WHERE item_code = ?1 AND warehouse = ?2",
        )
        .bind(item_code)
        .bind(warehouse)
        .fetch_optional(&self.pool)
        .await?;
        Ok(qty)
    }

    /// Every ledger row for one warehouse, ordered by item code.
    pub async fn for_warehouse(&self, warehouse: &str) -> DbResult<Vec<StockUpdate>> {
        let rows: Vec<StockRow> = sqlx::query_as(
            r#"
            SELECT item_code, warehouse, actual_qty
            FROM stock
            WHERE warehouse = ?1
            ORDER BY item_code
            "#,
        )
        .bind(warehouse)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(StockUpdate::from).collect())
    }

    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM stock").execute(&self.pool).await?;
        Ok(())
    }
}

/// Applies `movements` on an open connection or transaction. The caller
/// commits.
pub(crate) async fn decrement_in(
    conn: &mut SqliteConnection,
    movements: &[StockMovement],
    now: DateTime<Utc>,
) -> DbResult<()> {
    for movement in movements {
        sqlx::query(
            r#"
            INSERT INTO stock (item_code, warehouse, actual_qty, updated_at)
            VALUES (?1, ?2, -?3, ?4)
            ON CONFLICT (item_code, warehouse) DO UPDATE SET
                actual_qty = actual_qty - ?3,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&movement.item_code)
        .bind(&movement.warehouse)
        .bind(movement.qty)
        .bind(now)
        .execute(&mut *conn)
        .await?;

        sqlx::query(
            r#"
            UPDATE items SET actual_qty = actual_qty - ?2, updated_at = ?4
            WHERE item_code = ?1
              AND actual_qty IS NOT NULL
              AND (warehouse IS NULL OR warehouse = ?3)
            "#,
        )
        .bind(&movement.item_code)
        .bind(movement.qty)
        .bind(&movement.warehouse)
        .bind(now)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};
    use tally_core::CatalogItem;

    #[tokio::test]
    async fn test_apply_is_authoritative() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        let stock = db.stock();

        let applied = stock
            .apply_quantities(&[
                StockUpdate::new("A", "Main", 10.0),
                StockUpdate::new("A", "Main", 7.0),
                StockUpdate::new("B", "Main", 3.0),
                StockUpdate {
                    item_code: "C".into(),
                    warehouse: "Main".into(),
                    actual_qty: None,
                    stock_qty: None,
                },
            ])
            .await
            .unwrap();

        assert_eq!(applied, 3);
        assert_eq!(stock.get("A", "Main").await.unwrap(), Some(7.0));
        assert_eq!(stock.get("C", "Main").await.unwrap(), None);
        assert_eq!(stock.for_warehouse("Main").await.unwrap().len(), 2);
        assert!(stock.for_warehouse("Other").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_decrement_updates_ledger_and_item_cache() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let mut item = CatalogItem::new("A", "Apple", 1.0);
        item.warehouse = Some("Main".into());
        item.actual_qty = Some(10.0);
        db.items().bulk_put(&[item]).await.unwrap();
        db.stock()
            .apply_quantities(&[StockUpdate::new("A", "Main", 10.0)])
            .await
            .unwrap();

        db.stock()
            .decrement(&[
                StockMovement::new("A", "Main", 2.5),
                StockMovement::new("Z", "Main", 1.0),
            ])
            .await
            .unwrap();

        assert_eq!(db.stock().get("A", "Main").await.unwrap(), Some(7.5));
        assert_eq!(db.stock().get("Z", "Main").await.unwrap(), Some(-1.0));
        let cached = db.items().get("A").await.unwrap().unwrap();
        assert_eq!(cached.actual_qty, Some(7.5));
    }

    #[tokio::test]
    async fn test_decrement_other_warehouse_leaves_item_cache() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();

        let mut item = CatalogItem::new("A", "Apple", 1.0);
        item.warehouse = Some("Main".into());
        item.actual_qty = Some(10.0);
        db.items().bulk_put(&[item]).await.unwrap();

        db.stock()
            .decrement(&[StockMovement::new("A", "Backroom", 4.0)])
            .await
            .unwrap();

        let cached = db.items().get("A").await.unwrap().unwrap();
        assert_eq!(cached.actual_qty, Some(10.0));
    }
}
