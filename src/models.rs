//! Domain models shared across repositories, services and the HTTP layer.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

#[derive(Debug, Clone, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub password_hash: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Order lifecycle status. Transitions are monotone towards the terminal
/// pair {PROCESSED, INVALID}; a terminal order is never polled again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "order_status", rename_all = "UPPERCASE")]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    New,
    Processing,
    Processed,
    Invalid,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Processed | OrderStatus::Invalid)
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct Order {
    pub id: i64,
    pub user_id: i64,
    pub order_code: String,
    pub status: OrderStatus,
    pub accrual: Decimal,
    pub attempts: i32,
    pub next_attempt_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Ledger entry direction. A debit increases the user's spendable balance
/// (accrual award), a credit decreases it (withdrawal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "tx_direction", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum TxDirection {
    Debit,
    Credit,
}

#[derive(Debug, Clone, FromRow)]
pub struct BalanceTransaction {
    pub id: i64,
    pub user_id: i64,
    pub order_id: i64,
    pub order_code: String,
    pub direction: TxDirection,
    pub amount: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Aggregated view of a user's ledger: `current = Σdebit − Σcredit`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UserBalance {
    pub current: Decimal,
    pub withdrawn: Decimal,
}
