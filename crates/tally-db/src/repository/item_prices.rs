//! Price list cache keyed by `(price_list, item_code)`.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::ItemPrice;

#[derive(Debug, sqlx::FromRow)]
struct ItemPriceRow {
    price_list: String,
    item_code: String,
    price_list_rate: f64,
    currency: Option<String>,
    uom: Option<String>,
}

impl From<ItemPriceRow> for ItemPrice {
    fn from(row: ItemPriceRow) -> Self {
        ItemPrice {
            price_list: row.price_list,
            item_code: row.item_code,
            price_list_rate: row.price_list_rate,
            currency: row.currency,
            uom: row.uom,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ItemPriceRepository {
    pool: SqlitePool,
}

impl ItemPriceRepository {
    pub fn new(pool: SqlitePool) -> Self {
        ItemPriceRepository { pool }
    }

    pub async fn bulk_put(&self, prices: &[ItemPrice]) -> DbResult<usize> {
        if prices.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for price in prices {
            sqlx::query(
                r#"
                INSERT INTO item_prices (price_list, item_code, price_list_rate, currency, uom, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ON CONFLICT (price_list, item_code) DO UPDATE SET
                    price_list_rate = excluded.price_list_rate,
                    currency = excluded.currency,
                    uom = excluded.uom,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&price.price_list)
            .bind(&price.item_code)
            .bind(price.price_list_rate)
            .bind(&price.currency)
            .bind(&price.uom)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(count = prices.len(), "Cached item prices");
        Ok(prices.len())
    }

    pub async fn get(&self, price_list: &str, item_code: &str) -> DbResult<Option<ItemPrice>> {
        let row: Option<ItemPriceRow> = sqlx::query_as(
            r#"
            SELECT price_list, item_code, price_list_rate, currency, uom
            FROM item_prices
            WHERE price_list = ?1 AND item_code = ?2
            "#,
        )
        .bind(price_list)
        .bind(item_code)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(ItemPrice::from))
    }

    pub async fn list_for(&self, price_list: &str) -> DbResult<Vec<ItemPrice>> {
        let rows: Vec<ItemPriceRow> = sqlx::query_as(
            r#"
            SELECT price_list, item_code, price_list_rate, currency, uom
            FROM item_prices
            WHERE price_list = ?1
            ORDER BY item_code
            "#,
        )
        .bind(price_list)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(ItemPrice::from).collect())
    }

    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM item_prices")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
