//! Repository for order rows, including the batch operations the accrual
//! pipeline applies inside one transaction.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::models::{Order, OrderStatus};
use crate::repos::RepoError;
use crate::uow::Db;

/// One row of a batch status/accrual update.
#[derive(Debug, Clone)]
pub struct OrderAccrualUpdate {
    pub id: i64,
    pub status: OrderStatus,
    pub accrual: Decimal,
}

/// One row of a batch retry-scheduling update. The attempt counter itself
/// is incremented by the repository.
#[derive(Debug, Clone)]
pub struct AttemptSchedule {
    pub id: i64,
    pub next_attempt_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct OrderRepo {
    db: Db,
}

impl OrderRepo {
    pub fn new(db: Db) -> Self {
        Self { db }
    }

    pub async fn create(&self, user_id: i64, order_code: &str) -> Result<Order, RepoError> {
        let query = sqlx::query_as::<_, Order>(
            r#"
            INSERT INTO orders (user_id, order_code)
            VALUES ($1, $2)
            RETURNING id, user_id, order_code, status, accrual, attempts,
                      next_attempt_at, created_at, updated_at
            "#,
        )
        .bind(user_id)
        .bind(order_code);

        self.db.fetch_one(query).await
    }

    pub async fn find_by_code(&self, order_code: &str) -> Result<Order, RepoError> {
        let query = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, order_code, status, accrual, attempts,
                   next_attempt_at, created_at, updated_at
            FROM orders
            WHERE order_code = $1
            "#,
        )
        .bind(order_code);

        self.db
            .fetch_optional(query)
            .await?
            .ok_or(RepoError::NotFound)
    }

    pub async fn get_by_user(&self, user_id: i64) -> Result<Vec<Order>, RepoError> {
        let query = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, order_code, status, accrual, attempts,
                   next_attempt_at, created_at, updated_at
            FROM orders
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id);

        self.db.fetch_all(query).await
    }

    /// Due orders for the accrual monitor: non-terminal status and
    /// `next_attempt_at` in the past, oldest due first.
    pub async fn get_for_monitoring(&self, limit: i64) -> Result<Vec<Order>, RepoError> {
        let query = sqlx::query_as::<_, Order>(
            r#"
            SELECT id, user_id, order_code, status, accrual, attempts,
                   next_attempt_at, created_at, updated_at
            FROM orders
            WHERE status NOT IN ('PROCESSED', 'INVALID')
              AND next_attempt_at <= now()
            ORDER BY next_attempt_at ASC
            LIMIT $1
            "#,
        )
        .bind(limit);

        self.db.fetch_all(query).await
    }

    /// Applies status/accrual updates row by row, returning the full updated
    /// row (or the per-row error) at the index of the request element.
    pub async fn batch_update_with_accrual(
        &self,
        updates: &[OrderAccrualUpdate],
    ) -> Vec<Result<Order, RepoError>> {
        let mut results = Vec::with_capacity(updates.len());

        for update in updates {
            let query = sqlx::query_as::<_, Order>(
                r#"
                UPDATE orders
                SET status = $2, accrual = $3, updated_at = now()
                WHERE id = $1
                RETURNING id, user_id, order_code, status, accrual, attempts,
                          next_attempt_at, created_at, updated_at
                "#,
            )
            .bind(update.id)
            .bind(update.status)
            .bind(update.accrual);

            results.push(self.db.fetch_one(query).await);
        }

        results
    }

    /// Increments the attempt counter and reschedules the next poll, row by
    /// row, preserving index correspondence with the request.
    pub async fn batch_increment_attempts(
        &self,
        schedules: &[AttemptSchedule],
    ) -> Vec<Result<(), RepoError>> {
        let mut results = Vec::with_capacity(schedules.len());

        for schedule in schedules {
            let query = sqlx::query(
                r#"
                UPDATE orders
                SET attempts = attempts + 1, next_attempt_at = $2, updated_at = now()
                WHERE id = $1
                "#,
            )
            .bind(schedule.id)
            .bind(schedule.next_attempt_at);

            results.push(self.db.execute(query).await.map(|_| ()));
        }

        results
    }
}
