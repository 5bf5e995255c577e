//! # Item Repository
//!
//! Cached catalog items and their barcode index.
//!
//! ## Search Ranking
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                    How Catalog Search Works                             │
//! │                                                                         │
//! │  Cashier types or scans: "123456"                                      │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  1. item_barcodes.barcode = "123456"       (exact, always first)       │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  2. item_code / item_name LIKE "123456%"   (prefix)                    │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  3. item_code / item_name LIKE "%123456%"  (contains)                  │
//! │       │                                                                 │
//! │       ▼                                                                 │
//! │  Deduplicate by item_code, truncate to limit                           │
//! │                                                                         │
//! │  Empty term: first `limit` items by name                               │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashSet;

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use super::like_pattern;
use crate::error::{DbError, DbResult};
use tally_core::{CatalogItem, StockUpdate};

const ITEM_COLUMNS: &str = "i.item_code, i.item_name, i.item_group, i.brand, i.rate, \
     i.price_list_rate, i.uom, i.stock_uom, i.conversion_factor, i.warehouse, \
     i.actual_qty, i.stock_qty, i.barcodes";

#[derive(Debug, sqlx::FromRow)]
struct ItemRow {
    item_code: String,
    item_name: String,
    item_group: Option<String>,
    brand: Option<String>,
    rate: f64,
    price_list_rate: f64,
    uom: Option<String>,
    stock_uom: Option<String>,
    conversion_factor: f64,
    warehouse: Option<String>,
    actual_qty: Option<f64>,
    stock_qty: Option<f64>,
    barcodes: String,
}

impl TryFrom<ItemRow> for CatalogItem {
    type Error = DbError;

    fn try_from(row: ItemRow) -> DbResult<Self> {
        Ok(CatalogItem {
            item_code: row.item_code,
            item_name: row.item_name,
            item_group: row.item_group,
            brand: row.brand,
            rate: row.rate,
            price_list_rate: row.price_list_rate,
            uom: row.uom,
            stock_uom: row.stock_uom,
            conversion_factor: row.conversion_factor,
            warehouse: row.warehouse,
            actual_qty: row.actual_qty,
            stock_qty: row.stock_qty,
            barcodes: serde_json::from_str(&row.barcodes)?,
        })
    }
}

fn into_items(rows: Vec<ItemRow>) -> DbResult<Vec<CatalogItem>> {
    rows.into_iter().map(CatalogItem::try_from).collect()
}

/// Repository for cached catalog items.
#[derive(Debug, Clone)]
pub struct ItemRepository {
    pool: SqlitePool,
}

impl ItemRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ItemRepository { pool }
    }

    /// Upserts a batch of items in one transaction.
    ///
    /// Idempotent: re-caching the same batch leaves the table unchanged.
    /// Each item's barcode rows are replaced with its current barcodes.
    pub async fn bulk_put(&self, items: &[CatalogItem]) -> DbResult<usize> {
        if items.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for item in items {
            let barcodes = serde_json::to_string(&item.barcodes)?;
            sqlx::query(
                r#"
                INSERT INTO items (
                    item_code, item_name, item_group, brand, rate, price_list_rate,
                    uom, stock_uom, conversion_factor, warehouse, actual_qty, stock_qty,
                    barcodes, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14)
                ON CONFLICT (item_code) DO UPDATE SET
                    item_name = excluded.item_name,
                    item_group = excluded.item_group,
                    brand = excluded.brand,
                    rate = excluded.rate,
                    price_list_rate = excluded.price_list_rate,
                    uom = excluded.uom,
                    stock_uom = excluded.stock_uom,
                    conversion_factor = excluded.conversion_factor,
                    warehouse = COALESCE(excluded.warehouse, items.warehouse),
                    actual_qty = COALESCE(excluded.actual_qty, items.actual_qty),
                    stock_qty = COALESCE(excluded.stock_qty, items.stock_qty),
                    barcodes = excluded.barcodes,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&item.item_code)
            .bind(&item.item_name)
            .bind(&item.item_group)
            .bind(&item.brand)
            .bind(item.rate)
            .bind(item.price_list_rate)
            .bind(&item.uom)
            .bind(&item.stock_uom)
            .bind(item.conversion_factor)
            .bind(&item.warehouse)
            .bind(item.actual_qty)
            .bind(item.stock_qty)
            .bind(barcodes)
            .bind(now)
            .execute(&mut *tx)
            .await?;

            sqlx::query("DELETE FROM item_barcodes WHERE item_code = ?1")
                .bind(&item.item_code)
                .execute(&mut *tx)
                .await?;

            for barcode in item.barcodes.iter().filter(|b| !b.is_empty()) {
                sqlx::query(
                    "INSERT OR IGNORE INTO item_barcodes (barcode, item_code) VALUES (?1, ?2)",
                )
                .bind(barcode)
                .bind(&item.item_code)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(count = items.len(), "Cached items");
        Ok(items.len())
    }

    pub async fn put(&self, item: &CatalogItem) -> DbResult<()> {
        self.bulk_put(std::slice::from_ref(item)).await.map(|_| ())
    }

    pub async fn get(&self, item_code: &str) -> DbResult<Option<CatalogItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items i WHERE i.item_code = ?1"
        ))
        .bind(item_code)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CatalogItem::try_from).transpose()
    }

    /// Exact barcode lookup.
    pub async fn find_by_barcode(&self, barcode: &str) -> DbResult<Option<CatalogItem>> {
        let row: Option<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items i \
             INNER JOIN item_barcodes b ON b.item_code = i.item_code \
             WHERE b.barcode = ?1 \
             ORDER BY i.item_name \
             LIMIT 1"
        ))
        .bind(barcode)
        .fetch_optional(&self.pool)
        .await?;

        row.map(CatalogItem::try_from).transpose()
    }

    /// Searches the cache. Barcode exact matches come first, then prefix
    /// matches on code or name, then contains matches.
    pub async fn search(&self, term: &str, limit: u32) -> DbResult<Vec<CatalogItem>> {
        let term = term.trim();
        debug!(term = %term, limit, "Searching cached items");

        if term.is_empty() {
            return self.list(0, limit).await;
        }

        let limit_i64 = i64::from(limit);
        let barcode_rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items i \
             INNER JOIN item_barcodes b ON b.item_code = i.item_code \
             WHERE b.barcode = ?1 \
             ORDER BY i.item_name \
             LIMIT ?2"
        ))
        .bind(term)
        .bind(limit_i64)
        .fetch_all(&self.pool)
        .await?;

        let text_rows: Vec<ItemRow> = sqlx::query_as(&format!(
            r#"SELECT {ITEM_COLUMNS} FROM items i
               WHERE i.item_code LIKE ?1 ESCAPE '\' OR i.item_name LIKE ?1 ESCAPE '\'
               ORDER BY
                   CASE WHEN i.item_code LIKE ?2 ESCAPE '\' OR i.item_name LIKE ?2 ESCAPE '\'
                        THEN 0 ELSE 1 END,
                   i.item_name COLLATE NOCASE
               LIMIT ?3"#
        ))
        .bind(like_pattern(term, false))
        .bind(like_pattern(term, true))
        .bind(limit_i64)
        .fetch_all(&self.pool)
        .await?;

        let mut seen = HashSet::new();
        let mut results = Vec::new();
        for row in barcode_rows.into_iter().chain(text_rows) {
            if results.len() >= limit as usize {
                break;
            }
            if seen.insert(row.item_code.clone()) {
                results.push(CatalogItem::try_from(row)?);
            }
        }

        debug!(count = results.len(), "Search returned items");
        Ok(results)
    }

    /// Range scan ordered by name.
    pub async fn list(&self, offset: u32, limit: u32) -> DbResult<Vec<CatalogItem>> {
        let rows: Vec<ItemRow> = sqlx::query_as(&format!(
            "SELECT {ITEM_COLUMNS} FROM items i \
             ORDER BY i.item_name COLLATE NOCASE, i.item_code \
             LIMIT ?1 OFFSET ?2"
        ))
        .bind(i64::from(limit))
        .bind(i64::from(offset))
        .fetch_all(&self.pool)
        .await?;

        into_items(rows)
    }

    /// Every cached item code, sorted.
    pub async fn codes(&self) -> DbResult<Vec<String>> {
        let codes = sqlx::query_scalar("SELECT item_code FROM items ORDER BY item_code")
            .fetch_all(&self.pool)
            .await?;
        Ok(codes)
    }

    /// Applies authoritative quantities to cached items.
    ///
    /// Returns the number of cached items that were updated.
    pub async fn update_stock(&self, updates: &[StockUpdate]) -> DbResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        let now = Utc::now();
        let mut updated = 0;
        for update in updates {
            let result = sqlx::query(
                r#"
                UPDATE items SET
                    actual_qty = ?2,
                    stock_qty = COALESCE(?3, stock_qty),
                    warehouse = CASE WHEN ?4 = '' THEN warehouse ELSE ?4 END,
                    updated_at = ?5
                WHERE item_code = ?1
                "#,
            )
            .bind(&update.item_code)
            .bind(update.qty())
            .bind(update.stock_qty)
            .bind(&update.warehouse)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            updated += result.rows_affected() as usize;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;
        Ok(updated)
    }

    /// Deletes one item. Returns true if it existed.
    pub async fn delete(&self, item_code: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM items WHERE item_code = ?1")
            .bind(item_code)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM items")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM item_barcodes")
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM items").execute(&self.pool).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn item(code: &str, name: &str, barcodes: &[&str]) -> CatalogItem {
        let mut item = CatalogItem::new(code, name, 10.0);
        item.barcodes = barcodes.iter().map(|b| b.to_string()).collect();
        item
    }

    async fn db() -> Database {
        Database::new(DbConfig::in_memory()).await.unwrap()
    }

    #[tokio::test]
    async fn test_bulk_put_is_idempotent() {
        let db = db().await;
        let batch = vec![item("A", "Apple", &["111"]), item("B", "Banana", &[])];

        assert_eq!(db.items().bulk_put(&batch).await.unwrap(), 2);
        assert_eq!(db.items().bulk_put(&batch).await.unwrap(), 2);
        assert_eq!(db.items().count().await.unwrap(), 2);

        let apple = db.items().get("A").await.unwrap().unwrap();
        assert_eq!(apple, batch[0]);
    }

    #[tokio::test]
    async fn test_barcode_match_ranks_first() {
        let db = db().await;
        db.items()
            .bulk_put(&[
                item("PROMO", "Promo pack 123456", &[]),
                item("SCANNED", "Mineral Water", &["123456"]),
            ])
            .await
            .unwrap();

        let results = db.items().search("123456", 10).await.unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].item_code, "SCANNED");
        assert_eq!(results[1].item_code, "PROMO");
    }

    #[tokio::test]
    async fn test_prefix_matches_before_contains() {
        let db = db().await;
        db.items()
            .bulk_put(&[
                item("X1", "Diet Cola", &[]),
                item("X2", "Cola Zero", &[]),
                item("X3", "Water", &[]),
            ])
            .await
            .unwrap();

        let results = db.items().search("cola", 10).await.unwrap();
        let codes: Vec<&str> = results.iter().map(|i| i.item_code.as_str()).collect();
        assert_eq!(codes, vec!["X2", "X1"]);
    }

    #[tokio::test]
    async fn test_empty_term_returns_first_rows() {
        let db = db().await;
        db.items()
            .bulk_put(&[item("C", "Cherry", &[]), item("A", "Apple", &[]), item("B", "Banana", &[])])
            .await
            .unwrap();

        let results = db.items().search("  ", 2).await.unwrap();
        let names: Vec<&str> = results.iter().map(|i| i.item_name.as_str()).collect();
        assert_eq!(names, vec!["Apple", "Banana"]);
    }

    #[tokio::test]
    async fn test_like_wildcards_are_literal() {
        let db = db().await;
        db.items()
            .bulk_put(&[item("P1", "100% Juice", &[]), item("P2", "1000 Sheets", &[])])
            .await
            .unwrap();

        let results = db.items().search("100%", 10).await.unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].item_code, "P1");
    }

    #[tokio::test]
    async fn test_barcodes_replaced_on_recache() {
        let db = db().await;
        db.items().put(&item("A", "Apple", &["111"])).await.unwrap();
        db.items().put(&item("A", "Apple", &["222"])).await.unwrap();

        assert!(db.items().find_by_barcode("111").await.unwrap().is_none());
        assert_eq!(
            db.items().find_by_barcode("222").await.unwrap().unwrap().item_code,
            "A"
        );
    }

    #[tokio::test]
    async fn test_update_stock() {
        let db = db().await;
        db.items().put(&item("A", "Apple", &[])).await.unwrap();

        let updated = db
            .items()
            .update_stock(&[
                StockUpdate::new("A", "Stores - T", 7.0),
                StockUpdate::new("MISSING", "Stores - T", 1.0),
            ])
            .await
            .unwrap();
        assert_eq!(updated, 1);

        let apple = db.items().get("A").await.unwrap().unwrap();
        assert_eq!(apple.actual_qty, Some(7.0));
        assert_eq!(apple.warehouse.as_deref(), Some("Stores - T"));
    }

    #[tokio::test]
    async fn test_delete_cascades_barcodes() {
        let db = db().await;
        db.items().put(&item("A", "Apple", &["111"])).await.unwrap();
        assert!(db.items().delete("A").await.unwrap());
        assert!(db.items().find_by_barcode("111").await.unwrap().is_none());
        assert!(db.items().codes().await.unwrap().is_empty());
    }
}
