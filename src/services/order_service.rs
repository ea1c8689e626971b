//! Order creation and the transactional apply step of the accrual pipeline.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use thiserror::Error;

use crate::models::{Order, OrderStatus, TxDirection};
use crate::repos::balance_repo::NewBalanceTransaction;
use crate::repos::order_repo::{AttemptSchedule, OrderAccrualUpdate};
use crate::repos::{BalanceRepo, OrderRepo, RepoError, BALANCE_REPO, ORDER_REPO};
use crate::services::jitter;
use crate::uow::{UnitOfWork, UowError};

/// Base of the exponential retry backoff: the n-th failure reschedules the
/// order roughly `1.1^n` seconds ahead.
const ATTEMPT_BACKOFF_BASE: f64 = 1.1;
const ATTEMPT_JITTER_SPREAD: f64 = 0.25;

#[derive(Debug, Error)]
pub enum OrderServiceError {
    /// The order code is already taken; `existing` tells whose it is.
    #[error("order code already uploaded")]
    Duplicate { existing: Order },

    #[error(transparent)]
    Uow(#[from] UowError),

    #[error(transparent)]
    Repo(#[from] RepoError),
}

/// Outcome of polling the provider for one order, as handed to
/// [`OrderService::update_accrual`].
#[derive(Debug, Clone)]
pub enum AccrualOutcome {
    /// The provider answered with a status the ledger recognizes.
    Settled { status: OrderStatus, accrual: Decimal },
    /// The poll failed; the order will be rescheduled.
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub struct AccrualUpdate {
    pub order_id: i64,
    pub attempts: u32,
    pub outcome: AccrualOutcome,
}

pub struct OrderService {
    uow: Arc<UnitOfWork>,
    orders: OrderRepo,
}

impl OrderService {
    pub fn new(uow: Arc<UnitOfWork>) -> Result<Self, UowError> {
        let orders: OrderRepo = uow.repository(ORDER_REPO)?;
        Ok(Self { uow, orders })
    }

    /// Inserts a new order for `user_id`. When the code is already taken the
    /// existing row is loaded so callers can distinguish "already yours"
    /// from "owned by another user".
    pub async fn create(&self, user_id: i64, order_code: &str) -> Result<Order, OrderServiceError> {
        match self.orders.create(user_id, order_code).await {
            Ok(order) => Ok(order),
            Err(RepoError::DuplicateKey) => {
                let existing = self.orders.find_by_code(order_code).await?;
                Err(OrderServiceError::Duplicate { existing })
            }
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_by_user(&self, user_id: i64) -> Result<Vec<Order>, OrderServiceError> {
        Ok(self.orders.get_by_user(user_id).await?)
    }

    /// Due orders for the reconciliation loop; the repository predicate
    /// (non-terminal, `next_attempt_at <= now`) is the single source of
    /// truth here.
    pub async fn orders_for_accrual_monitoring(
        &self,
        limit: i64,
    ) -> Result<Vec<Order>, OrderServiceError> {
        Ok(self.orders.get_for_monitoring(limit).await?)
    }

    /// Applies one batch of poll outcomes in a single transaction:
    ///
    /// 1. successful polls update order status/accrual;
    /// 2. orders that reached PROCESSED get a debit ledger entry, where a
    ///    duplicate-key outcome is swallowed (at-most-once debit);
    /// 3. failed polls get their attempt counter bumped and the next poll
    ///    scheduled with jittered exponential backoff.
    ///
    /// Successes are applied before failures so a row that went terminal in
    /// this batch is not also rescheduled. Any retained error rolls the
    /// whole batch back; per-row errors keep only the last one.
    pub async fn update_accrual(
        &self,
        updates: Vec<AccrualUpdate>,
    ) -> Result<(), OrderServiceError> {
        if updates.is_empty() {
            return Ok(());
        }

        self.uow
            .transact(move |scope| async move {
                let (successes, failures) = split_outcomes(updates);

                let orders_repo: OrderRepo = scope.get(ORDER_REPO)?;

                let updated = apply_success_updates(&orders_repo, &successes).await?;

                let debits = debits_for_processed(&updated);
                if !debits.is_empty() {
                    let balances_repo: BalanceRepo = scope.get(BALANCE_REPO)?;
                    insert_debits(&balances_repo, &debits).await?;
                }

                schedule_failed_attempts(&orders_repo, &failures).await?;

                Ok(())
            })
            .await
    }
}

#[derive(Debug, Clone, Copy)]
struct FailedAttempt {
    order_id: i64,
    attempts: u32,
}

fn split_outcomes(updates: Vec<AccrualUpdate>) -> (Vec<OrderAccrualUpdate>, Vec<FailedAttempt>) {
    let mut successes = Vec::with_capacity(updates.len());
    let mut failures = Vec::new();

    for update in updates {
        match update.outcome {
            AccrualOutcome::Settled { status, accrual } => successes.push(OrderAccrualUpdate {
                id: update.order_id,
                status,
                accrual,
            }),
            AccrualOutcome::Failed { .. } => failures.push(FailedAttempt {
                order_id: update.order_id,
                attempts: update.attempts,
            }),
        }
    }

    (successes, failures)
}

async fn apply_success_updates(
    orders_repo: &OrderRepo,
    successes: &[OrderAccrualUpdate],
) -> Result<Vec<Order>, OrderServiceError> {
    if successes.is_empty() {
        return Ok(Vec::new());
    }

    let mut updated = Vec::with_capacity(successes.len());
    let mut last_err = None;
    for result in orders_repo.batch_update_with_accrual(successes).await {
        match result {
            Ok(order) => updated.push(order),
            Err(err) => last_err = Some(err),
        }
    }
    match last_err {
        Some(err) => Err(err.into()),
        None => Ok(updated),
    }
}

fn debits_for_processed(orders: &[Order]) -> Vec<NewBalanceTransaction> {
    orders
        .iter()
        .filter(|order| order.status == OrderStatus::Processed)
        .map(|order| NewBalanceTransaction {
            user_id: order.user_id,
            order_id: order.id,
            order_code: order.order_code.clone(),
            direction: TxDirection::Debit,
            amount: order.accrual,
        })
        .collect()
}

/// Duplicate-key here means the order was already credited once; that is
/// the at-most-once-debit invariant holding, not an error.
async fn insert_debits(
    balances_repo: &BalanceRepo,
    debits: &[NewBalanceTransaction],
) -> Result<(), OrderServiceError> {
    let mut last_err = None;
    for result in balances_repo.batch_create(debits).await {
        if let Err(err) = result {
            if !err.is_duplicate_key() {
                last_err = Some(err);
            }
        }
    }
    match last_err {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

async fn schedule_failed_attempts(
    orders_repo: &OrderRepo,
    failures: &[FailedAttempt],
) -> Result<(), OrderServiceError> {
    if failures.is_empty() {
        return Ok(());
    }

    let now = Utc::now();
    let schedules: Vec<AttemptSchedule> = failures
        .iter()
        .map(|failure| AttemptSchedule {
            id: failure.order_id,
            next_attempt_at: now + next_attempt_delay(failure.attempts),
        })
        .collect();

    let mut last_err = None;
    for result in orders_repo.batch_increment_attempts(&schedules).await {
        if let Err(err) = result {
            last_err = Some(err);
        }
    }
    match last_err {
        Some(err) => Err(err.into()),
        None => Ok(()),
    }
}

fn next_attempt_delay(attempts: u32) -> chrono::Duration {
    let seconds = ATTEMPT_BACKOFF_BASE.powi(attempts as i32);
    let jittered = jitter(seconds, ATTEMPT_JITTER_SPREAD);
    chrono::Duration::milliseconds((jittered * 1000.0) as i64)
}
