//! Ledger repositories over the Unit-of-Work database handle.
//!
//! Batch operations return one outcome per request element, in request
//! order, so callers can decide per row whether a failure is fatal
//! (duplicate-key on a debit insert is not).

pub mod balance_repo;
pub mod order_repo;
pub mod user_repo;

pub use balance_repo::BalanceRepo;
pub use order_repo::OrderRepo;
pub use user_repo::UserRepo;

use thiserror::Error;

use crate::uow::RepoName;

pub const USER_REPO: RepoName = "user";
pub const ORDER_REPO: RepoName = "order";
pub const BALANCE_REPO: RepoName = "balance_transaction";

/// Error taxonomy the repositories map raw driver errors into. Everything
/// the taxonomy does not recognize stays wrapped as `Database`.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("record not found")]
    NotFound,

    #[error("duplicate key")]
    DuplicateKey,

    #[error("transaction scope already completed")]
    Closed,

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
}

const UNIQUE_VIOLATION_CODE: &str = "23505";

impl RepoError {
    pub fn from_sqlx(err: sqlx::Error) -> Self {
        match &err {
            sqlx::Error::RowNotFound => RepoError::NotFound,
            sqlx::Error::Database(db_err)
                if db_err.code().as_deref() == Some(UNIQUE_VIOLATION_CODE) =>
            {
                RepoError::DuplicateKey
            }
            _ => RepoError::Database(err),
        }
    }

    pub fn is_duplicate_key(&self) -> bool {
        matches!(self, RepoError::DuplicateKey)
    }
}
