//! # Customer Repository
//!
//! Cached customers. Search is a case-insensitive contains match on the
//! name, customer name, mobile number or email.

use chrono::Utc;
use sqlx::SqlitePool;
use tracing::debug;

use super::like_pattern;
use crate::error::{DbError, DbResult};
use tally_core::Customer;

#[derive(Debug, sqlx::FromRow)]
struct CustomerRow {
    name: String,
    customer_name: String,
    mobile_no: Option<String>,
    email_id: Option<String>,
}

impl From<CustomerRow> for Customer {
    fn from(row: CustomerRow) -> Self {
        Customer {
            name: row.name,
            customer_name: row.customer_name,
            mobile_no: row.mobile_no,
            email_id: row.email_id,
        }
    }
}

#[derive(Debug, Clone)]
pub struct CustomerRepository {
    pool: SqlitePool,
}

impl CustomerRepository {
    pub fn new(pool: SqlitePool) -> Self {
        CustomerRepository { pool }
    }

    /// Upserts a batch of customers in one transaction.
    pub async fn bulk_put(&self, customers: &[Customer]) -> DbResult<usize> {
        if customers.is_empty() {
            return Ok(0);
        }

        let now = Utc::now();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        for customer in customers {
            sqlx::query(
                r#"
                INSERT INTO customers (name, customer_name, mobile_no, email_id, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5)
                ON CONFLICT (name) DO UPDATE SET
                    customer_name = excluded.customer_name,
                    mobile_no = excluded.mobile_no,
                    email_id = excluded.email_id,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(&customer.name)
            .bind(&customer.customer_name)
            .bind(&customer.mobile_no)
            .bind(&customer.email_id)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(count = customers.len(), "Cached customers");
        Ok(customers.len())
    }

    pub async fn get(&self, name: &str) -> DbResult<Option<Customer>> {
        let row: Option<CustomerRow> = sqlx::query_as(
            "SELECT name, customer_name, mobile_no, email_id FROM customers WHERE name = ?1",
        )
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row.map(Customer::from))
    }

    /// Contains match on any searchable field. Empty term lists by name.
    pub async fn search(&self, term: &str, limit: u32) -> DbResult<Vec<Customer>> {
        let term = term.trim();
        let pattern = like_pattern(term, false);

        let rows: Vec<CustomerRow> = sqlx::query_as(
            r#"
            SELECT name, customer_name, mobile_no, email_id
            FROM customers
            WHERE ?1 = ''
               OR name LIKE ?2 ESCAPE '\'
               OR customer_name LIKE ?2 ESCAPE '\'
               OR mobile_no LIKE ?2 ESCAPE '\'
               OR email_id LIKE ?2 ESCAPE '\'
            ORDER BY customer_name COLLATE NOCASE, name
            LIMIT ?3
            "#,
        )
        .bind(term)
        .bind(pattern)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(Customer::from).collect())
    }

    pub async fn delete(&self, name: &str) -> DbResult<bool> {
        let result = sqlx::query("DELETE FROM customers WHERE name = ?1")
            .bind(name)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> DbResult<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM customers")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM customers")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::{Database, DbConfig};

    fn customer(name: &str, full: &str, mobile: Option<&str>) -> Customer {
        Customer {
            name: name.to_string(),
            customer_name: full.to_string(),
            mobile_no: mobile.map(str::to_string),
            email_id: None,
        }
    }

    #[tokio::test]
    async fn test_search_any_field_case_insensitive() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.customers()
            .bulk_put(&[
                customer("CUST-1", "Ayesha Khan", Some("03001234567")),
                customer("CUST-2", "Bilal Ahmed", None),
            ])
            .await
            .unwrap();

        let hits = db.customers().search("KHAN", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].name, "CUST-1");

        let hits = db.customers().search("1234", 10).await.unwrap();
        assert_eq!(hits[0].name, "CUST-1");

        assert_eq!(db.customers().search("", 10).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_upsert_replaces_fields() {
        let db = Database::new(DbConfig::in_memory()).await.unwrap();
        db.customers()
            .bulk_put(&[customer("CUST-1", "Old Name", None)])
            .await
            .unwrap();
        db.customers()
            .bulk_put(&[customer("CUST-1", "New Name", Some("0300"))])
            .await
            .unwrap();

        let stored = db.customers().get("CUST-1").await.unwrap().unwrap();
        assert_eq!(stored.customer_name, "New Name");
        assert_eq!(db.customers().count().await.unwrap(), 1);

        assert!(db.customers().delete("CUST-1").await.unwrap());
        assert!(db.customers().get("CUST-1").await.unwrap().is_none());
    }
}
