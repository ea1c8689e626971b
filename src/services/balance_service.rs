//! Balance aggregation and withdrawals.

use std::sync::Arc;

use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{BalanceTransaction, TxDirection, UserBalance};
use crate::repos::balance_repo::NewBalanceTransaction;
use crate::repos::{
    BalanceRepo, OrderRepo, RepoError, UserRepo, BALANCE_REPO, ORDER_REPO, USER_REPO,
};
use crate::uow::{UnitOfWork, UowError};

#[derive(Debug, Error)]
pub enum BalanceServiceError {
    #[error("not enough balance")]
    NotEnoughBalance,

    /// The order code supplied for the withdrawal is already taken.
    #[error("order code already used")]
    DuplicateOrderCode,

    #[error(transparent)]
    Uow(#[from] UowError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

pub struct BalanceService {
    uow: Arc<UnitOfWork>,
    balances: BalanceRepo,
}

impl BalanceService {
    pub fn new(uow: Arc<UnitOfWork>) -> Result<Self, UowError> {
        let balances: BalanceRepo = uow.repository(BALANCE_REPO)?;
        Ok(Self { uow, balances })
    }

    pub async fn get_user_balance(&self, user_id: i64) -> Result<UserBalance, BalanceServiceError> {
        let sums = self.balances.sum_by_user(user_id).await?;
        Ok(UserBalance {
            current: sums.debit - sums.credit,
            withdrawn: sums.credit,
        })
    }

    /// Withdraws `amount` points against a fresh order code, all in one
    /// transaction:
    ///
    /// 1. the user row is locked, so concurrent withdrawals for one user
    ///    cannot both observe a sufficient balance;
    /// 2. a new order row reserves the code (uniqueness blocks a second
    ///    withdrawal against the same code);
    /// 3. the balance is read inside the same transaction;
    /// 4. insufficient balance rolls everything back, including the order;
    /// 5. otherwise a credit ledger entry is written and committed.
    pub async fn withdraw(
        &self,
        user_id: i64,
        order_code: String,
        amount: Decimal,
    ) -> Result<BalanceTransaction, BalanceServiceError> {
        self.uow
            .transact(move |scope| async move {
                let users_repo: UserRepo = scope.get(USER_REPO)?;
                users_repo.lock(user_id).await?;

                let orders_repo: OrderRepo = scope.get(ORDER_REPO)?;
                let order = orders_repo
                    .create(user_id, &order_code)
                    .await
                    .map_err(|err| match err {
                        RepoError::DuplicateKey => BalanceServiceError::DuplicateOrderCode,
                        other => other.into(),
                    })?;

                let balances_repo: BalanceRepo = scope.get(BALANCE_REPO)?;
                let sums = balances_repo.sum_by_user(user_id).await?;
                if sums.debit - sums.credit < amount {
                    return Err(BalanceServiceError::NotEnoughBalance);
                }

                let transaction = balances_repo
                    .create(&NewBalanceTransaction {
                        user_id,
                        order_id: order.id,
                        order_code: order.order_code,
                        direction: TxDirection::Credit,
                        amount,
                    })
                    .await?;

                Ok(transaction)
            })
            .await
    }

    /// A user's withdrawals, newest first.
    pub async fn get_withdrawals(
        &self,
        user_id: i64,
    ) -> Result<Vec<BalanceTransaction>, BalanceServiceError> {
        Ok(self
            .balances
            .get_by_direction(user_id, TxDirection::Credit)
            .await?)
    }
}
