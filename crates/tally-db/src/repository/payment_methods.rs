use sqlx::SqlitePool;
use tracing::debug;

use crate::error::{DbError, DbResult};
use tally_core::PaymentMethod;

#[derive(Debug, sqlx::FromRow)]
struct PaymentMethodRow {
    mode_of_payment: String,
    pos_profile: String,
    is_default: bool,
    payment_type: Option<String>,
}

impl From<PaymentMethodRow> for PaymentMethod {
    fn from(row: PaymentMethodRow) -> Self {
        PaymentMethod {
            mode_of_payment: row.mode_of_payment,
            pos_profile: row.pos_profile,
            default: row.is_default,
            payment_type: row.payment_type,
        }
    }
}

/// Modes of payment cached per POS profile.
#[derive(Debug, Clone)]
pub struct PaymentMethodRepository {
    pool: SqlitePool,
}

impl PaymentMethodRepository {
    pub fn new(pool: SqlitePool) -> Self {
        PaymentMethodRepository { pool }
    }

    /// Replaces the cached methods of one profile.
    pub async fn replace_for_profile(
        &self,
        pos_profile: &str,
        methods: &[PaymentMethod],
    ) -> DbResult<usize> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        sqlx::query("DELETE FROM payment_methods WHERE pos_profile = ?1")
            .bind(pos_profile)
            .execute(&mut *tx)
            .await?;

        for method in methods {
            sqlx::query(
                r#"
                INSERT INTO payment_methods (mode_of_payment, pos_profile, is_default, payment_type)
                VALUES (?1, ?2, ?3, ?4)
                ON CONFLICT (mode_of_payment, pos_profile) DO UPDATE SET
                    is_default = excluded.is_default,
                    payment_type = excluded.payment_type
                "#,
            )
            .bind(&method.mode_of_payment)
            .bind(pos_profile)
            .bind(method.default)
            .bind(&method.payment_type)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit()
            .await
            .map_err(|e| DbError::TransactionFailed(e.to_string()))?;

        debug!(pos_profile = %pos_profile, count = methods.len(), "Cached payment methods");
        Ok(methods.len())
    }

    /// Methods for a profile, default first.
    pub async fn list(&self, pos_profile: &str) -> DbResult<Vec<PaymentMethod>> {
        let rows: Vec<PaymentMethodRow> = sqlx::query_as(
            r#"
            SELECT mode_of_payment, pos_profile, is_default, payment_type
            FROM payment_methods
            WHERE pos_profile = ?1
            ORDER BY is_default DESC, mode_of_payment
            "#,
        )
        .bind(pos_profile)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(PaymentMethod::from).collect())
    }

    pub async fn clear(&self) -> DbResult<()> {
        sqlx::query("DELETE FROM payment_methods")
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
