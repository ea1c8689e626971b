//! Repository for the append-only balance ledger.

use rust_decimal::Decimal;

use crate::models::{BalanceTransaction, TxDirection};
use crate::repos::RepoError;
use crate::uow::Db;

/// Arguments for a new ledger entry.
#[derive(Debug, Clone)]
pub struct NewBalanceTransaction {
    pub user_id: i64,
    pub order_id: i64,
    pub order_code: String,
    pub direction: TxDirection,
    pub amount: Decimal,
}

/// Per-direction sums of a user's ledger.
#[derive(Debug, Clone, Copy, Default)]
pub struct BalanceSums {
    pub debit: Decimal,
    pub credit: Decimal,
}

#[derive(Clone)]
pub struct BalanceRepo {
    db: Db,
}

impl BalanceRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(
        &self,
        transaction: &NewBalanceTransaction,
    ) -> Result<BalanceTransaction, RepoError> {
        let query = sqlx::query_as::<_, BalanceTransaction>(
            r#"
            INSERT INTO balance_transactions (user_id, order_id, order_code, direction, amount)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, order_id, order_code, direction, amount,
                      created_at, updated_at
            "#,
        )
        .bind(transaction.user_id)
        .bind(transaction.order_id)
        .bind(&transaction.order_code)
        .bind(transaction.direction)
        .bind(transaction.amount);

        self.db.fetch_one(query).await
    }

    /// Inserts ledger entries row by row. A duplicate-key outcome at index
    /// `i` means element `i` was already credited or debited; the caller
    /// decides whether that is an error.
    ///
    /// The conflict is absorbed with `ON CONFLICT DO NOTHING` and surfaced
    /// via `rows_affected`: a raised unique violation would abort the
    /// enclosing transaction, and these inserts run inside the accrual
    /// apply transaction.
    pub async fn batch_create(
        &self,
        transactions: &[NewBalanceTransaction],
    ) -> Vec<Result<(), RepoError>> {
        let mut results = Vec::with_capacity(transactions.len());

        for transaction in transactions {
            let query = sqlx::query(
                r#"
                INSERT INTO balance_transactions (user_id, order_id, order_code, direction, amount)
                VALUES ($1, $2, $3, $4, $5)
                ON CONFLICT (order_id, direction) DO NOTHING
                "#,
            )
            .bind(transaction.user_id)
            .bind(transaction.order_id)
            .bind(&transaction.order_code)
            .bind(transaction.direction)
            .bind(transaction.amount);

            results.push(match self.db.execute(query).await {
                Ok(done) if done.rows_affected() == 0 => Err(RepoError::DuplicateKey),
                Ok(_) => Ok(()),
                Err(err) => Err(err),
            });
        }

        results
    }

    pub async fn sum_by_user(&self, user_id: i64) -> Result<BalanceSums, RepoError> {
        let query = sqlx::query_as::<_, (TxDirection, Decimal)>(
            r#"
            SELECT direction, SUM(amount)
            FROM balance_transactions
            WHERE user_id = $1
            GROUP BY direction
            "#,
        )
        .bind(user_id);

        let rows = self.db.fetch_all(query).await?;

        let mut sums = BalanceSums::default();
        for (direction, total) in rows {
            match direction {
                TxDirection::Debit => sums.debit = total,
                TxDirection::Credit => sums.credit = total,
            }
        }
        Ok(sums)
    }

    pub async fn get_by_direction(
        &self,
        user_id: i64,
        direction: TxDirection,
    ) -> Result<Vec<BalanceTransaction>, RepoError> {
        let query = sqlx::query_as::<_, BalanceTransaction>(
            r#"
            SELECT id, user_id, order_id, order_code, direction, amount,
                   created_at, updated_at
            FROM balance_transactions
            WHERE user_id = $1 AND direction = $2
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .bind(direction);

        self.db.fetch_all(query).await
    }
}
