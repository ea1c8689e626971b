//! Reconciliation engine: polls the provider for every due order and applies
//! the outcomes through the order service in one transactional batch.

use std::sync::Arc;
use std::time::Duration;

use futures::{stream, StreamExt};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use super::client::AccrualClientError;
use super::{AccrualApi, AccrualReply, ReconciliationService};
use crate::models::Order;
use crate::services::order_service::{AccrualOutcome, AccrualUpdate, OrderServiceError};

const DEFAULT_LIMIT_PER_ITERATION: i64 = 100;
const DEFAULT_ACCRUAL_WORKERS: usize = 10;
/// Bounds calls into the order service (produce and apply steps).
const DEFAULT_SERVICE_TIMEOUT: Duration = Duration::from_secs(3);
/// Pause between iterations so a failing batch does not hot-loop the database.
const ITERATION_PAUSE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
enum IterationError {
    #[error("service call timed out")]
    ServiceTimeout,

    #[error(transparent)]
    Service(#[from] OrderServiceError),
}

#[derive(Debug, Error)]
enum PollFailure {
    #[error(transparent)]
    Client(#[from] AccrualClientError),

    #[error("cancelled while waiting out provider throttle")]
    Cancelled,
}

struct PollResult {
    order: Order,
    outcome: Result<AccrualReply, PollFailure>,
}

pub struct AccrualProcessor {
    service: Arc<dyn ReconciliationService>,
    client: Arc<dyn AccrualApi>,
    limit_per_iteration: i64,
    workers: usize,
    service_timeout: Duration,
}

impl AccrualProcessor {
    pub fn new(service: Arc<dyn ReconciliationService>, client: Arc<dyn AccrualApi>) -> Self {
        Self {
            service,
            client,
            limit_per_iteration: DEFAULT_LIMIT_PER_ITERATION,
            workers: DEFAULT_ACCRUAL_WORKERS,
            service_timeout: DEFAULT_SERVICE_TIMEOUT,
        }
    }

    pub fn with_limit_per_iteration(mut self, limit: i64) -> Self {
        self.limit_per_iteration = limit;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Runs reconciliation until `shutdown` fires. Iteration failures are
    /// logged and the loop carries on; cancellation is the only way out.
    pub async fn run(&self, shutdown: CancellationToken) {
        tracing::info!(
            limit_per_iteration = self.limit_per_iteration,
            workers = self.workers,
            "accrual processor started"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            if let Err(err) = self.iterate(&shutdown).await {
                tracing::error!(error = %err, "accrual iteration failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(ITERATION_PAUSE) => {}
            }
        }

        tracing::info!("accrual processor stopped");
    }

    async fn iterate(&self, shutdown: &CancellationToken) -> Result<(), IterationError> {
        let orders = tokio::time::timeout(
            self.service_timeout,
            self.service
                .orders_for_accrual_monitoring(self.limit_per_iteration),
        )
        .await
        .map_err(|_| IterationError::ServiceTimeout)??;

        if orders.is_empty() {
            tracing::debug!("no orders due for accrual polling");
            return Ok(());
        }

        let results = self.poll_orders(orders, shutdown).await;
        let updates = collect_updates(results);
        if updates.is_empty() {
            return Ok(());
        }

        // The apply step keeps its own timeout rather than the shutdown
        // token, so stopping the service cannot hang on a slow database.
        tokio::time::timeout(self.service_timeout, self.service.update_accrual(updates))
            .await
            .map_err(|_| IterationError::ServiceTimeout)??;

        Ok(())
    }

    /// Fan-out: at most `workers` concurrent provider polls; fan-in: all
    /// results collected before the batch is applied.
    async fn poll_orders(&self, orders: Vec<Order>, shutdown: &CancellationToken) -> Vec<PollResult> {
        stream::iter(orders)
            .map(|order| self.poll_order(order, shutdown))
            .buffer_unordered(self.workers)
            .collect()
            .await
    }

    /// Polls one order. A 429 puts the worker to sleep for the provider's
    /// `Retry-After` and retries the same order, indefinitely, until the
    /// provider recovers or the run is cancelled.
    async fn poll_order(&self, order: Order, shutdown: &CancellationToken) -> PollResult {
        loop {
            match self.client.get_order_accrual(&order.order_code).await {
                Ok(reply) => {
                    return PollResult {
                        order,
                        outcome: Ok(reply),
                    }
                }
                Err(AccrualClientError::TooManyRequests(retry_after)) => {
                    tracing::warn!(
                        order_id = order.id,
                        retry_after_secs = retry_after.as_secs(),
                        "provider throttled, backing off"
                    );
                    tokio::select! {
                        _ = shutdown.cancelled() => {
                            return PollResult {
                                order,
                                outcome: Err(PollFailure::Cancelled),
                            }
                        }
                        _ = tokio::time::sleep(retry_after) => {}
                    }
                }
                Err(err) => {
                    return PollResult {
                        order,
                        outcome: Err(err.into()),
                    }
                }
            }
        }
    }
}

/// Maps poll results onto service updates. REGISTERED replies are dropped
/// entirely: the ledger does not recognize that status, and the order will
/// be polled again next tick with its attempt count untouched.
fn collect_updates(results: Vec<PollResult>) -> Vec<AccrualUpdate> {
    let mut updates = Vec::with_capacity(results.len());

    for result in results {
        let attempts = result.order.attempts.max(0) as u32;
        match result.outcome {
            Ok(reply) => {
                let Some(status) = reply.status.as_order_status() else {
                    tracing::debug!(
                        order_id = result.order.id,
                        "provider has not registered the order yet"
                    );
                    continue;
                };
                tracing::info!(
                    order_id = result.order.id,
                    status = ?status,
                    accrual = %reply.accrual.unwrap_or_default(),
                    "accrual poll succeeded"
                );
                updates.push(AccrualUpdate {
                    order_id: result.order.id,
                    attempts,
                    outcome: AccrualOutcome::Settled {
                        status,
                        accrual: reply.accrual.unwrap_or_default(),
                    },
                });
            }
            Err(failure) => {
                tracing::warn!(
                    order_id = result.order.id,
                    attempt = attempts + 1,
                    error = %failure,
                    "accrual poll failed"
                );
                updates.push(AccrualUpdate {
                    order_id: result.order.id,
                    attempts,
                    outcome: AccrualOutcome::Failed {
                        reason: failure.to_string(),
                    },
                });
            }
        }
    }

    updates
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;

    use async_trait::async_trait;
    use chrono::Utc;
    use rust_decimal::Decimal;
    use tokio::time::Instant;

    use crate::accrual::client::ProviderStatus;
    use crate::models::OrderStatus;

    fn order(id: i64, code: &str, attempts: i32) -> Order {
        let now = Utc::now();
        Order {
            id,
            user_id: 100,
            order_code: code.to_string(),
            status: OrderStatus::New,
            accrual: Decimal::ZERO,
            attempts,
            next_attempt_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    fn reply(code: &str, status: ProviderStatus, accrual: Option<i64>) -> AccrualReply {
        AccrualReply {
            order_code: code.to_string(),
            status,
            accrual: accrual.map(Decimal::from),
        }
    }

    /// Hands out one batch of due orders, then nothing; records every
    /// `update_accrual` call.
    struct StubService {
        due: Mutex<Vec<Order>>,
        applied: Mutex<Vec<Vec<AccrualUpdate>>>,
    }

    impl StubService {
        fn new(due: Vec<Order>) -> Self {
            Self {
                due: Mutex::new(due),
                applied: Mutex::new(Vec::new()),
            }
        }

        fn applied(&self) -> Vec<Vec<AccrualUpdate>> {
            self.applied.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl ReconciliationService for StubService {
        async fn orders_for_accrual_monitoring(
            &self,
            _limit: i64,
        ) -> Result<Vec<Order>, OrderServiceError> {
            Ok(std::mem::take(&mut *self.due.lock().unwrap()))
        }

        async fn update_accrual(
            &self,
            updates: Vec<AccrualUpdate>,
        ) -> Result<(), OrderServiceError> {
            self.applied.lock().unwrap().push(updates);
            Ok(())
        }
    }

    /// Serves scripted responses per order code and records call times.
    struct StubClient {
        scripts: Mutex<HashMap<String, Vec<Result<AccrualReply, AccrualClientError>>>>,
        calls: Mutex<Vec<(String, Instant)>>,
    }

    impl StubClient {
        fn new() -> Self {
            Self {
                scripts: Mutex::new(HashMap::new()),
                calls: Mutex::new(Vec::new()),
            }
        }

        fn script(
            self,
            code: &str,
            mut responses: Vec<Result<AccrualReply, AccrualClientError>>,
        ) -> Self {
            responses.reverse(); // popped back-to-front
            self.scripts
                .lock()
                .unwrap()
                .insert(code.to_string(), responses);
            self
        }

        fn calls(&self) -> Vec<(String, Instant)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl AccrualApi for StubClient {
        async fn get_order_accrual(
            &self,
            order_code: &str,
        ) -> Result<AccrualReply, AccrualClientError> {
            self.calls
                .lock()
                .unwrap()
                .push((order_code.to_string(), Instant::now()));
            self.scripts
                .lock()
                .unwrap()
                .get_mut(order_code)
                .and_then(Vec::pop)
                .unwrap_or(Err(AccrualClientError::StatusCode(404)))
        }
    }

    fn processor(service: Arc<StubService>, client: Arc<StubClient>) -> AccrualProcessor {
        AccrualProcessor::new(service, client)
    }

    #[tokio::test]
    async fn empty_due_set_is_a_noop() {
        let service = Arc::new(StubService::new(Vec::new()));
        let client = Arc::new(StubClient::new());
        let p = processor(service.clone(), client.clone());

        p.iterate(&CancellationToken::new()).await.unwrap();

        assert!(service.applied().is_empty());
        assert!(client.calls().is_empty());
    }

    #[tokio::test]
    async fn settled_and_failed_polls_are_both_applied() {
        let service = Arc::new(StubService::new(vec![
            order(1, "ORDER-001", 0),
            order(2, "ORDER-002", 3),
        ]));
        let client = Arc::new(
            StubClient::new()
                .script(
                    "ORDER-001",
                    vec![Ok(reply("ORDER-001", ProviderStatus::Processed, Some(500)))],
                )
                .script("ORDER-002", vec![Err(AccrualClientError::StatusCode(500))]),
        );
        let p = processor(service.clone(), client.clone());

        p.iterate(&CancellationToken::new()).await.unwrap();

        let applied = service.applied();
        assert_eq!(applied.len(), 1);
        let updates = &applied[0];
        assert_eq!(updates.len(), 2);

        let settled = updates.iter().find(|u| u.order_id == 1).unwrap();
        assert!(matches!(
            settled.outcome,
            AccrualOutcome::Settled {
                status: OrderStatus::Processed,
                ..
            }
        ));

        let failed = updates.iter().find(|u| u.order_id == 2).unwrap();
        assert_eq!(failed.attempts, 3);
        assert!(matches!(failed.outcome, AccrualOutcome::Failed { .. }));
    }

    #[tokio::test]
    async fn registered_replies_are_dropped() {
        let service = Arc::new(StubService::new(vec![order(1, "ORDER-001", 2)]));
        let client = Arc::new(StubClient::new().script(
            "ORDER-001",
            vec![Ok(reply("ORDER-001", ProviderStatus::Registered, None))],
        ));
        let p = processor(service.clone(), client.clone());

        p.iterate(&CancellationToken::new()).await.unwrap();

        // Nothing recognized, so the apply step is skipped entirely and the
        // attempt counter stays where it was.
        assert!(service.applied().is_empty());
        assert_eq!(client.calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn throttled_worker_waits_and_retries_the_same_order() {
        let retry_after = Duration::from_secs(2);
        let service = Arc::new(StubService::new(vec![order(1, "ORDER-001", 1)]));
        let client = Arc::new(StubClient::new().script(
            "ORDER-001",
            vec![
                Err(AccrualClientError::TooManyRequests(retry_after)),
                Ok(reply("ORDER-001", ProviderStatus::Processed, Some(500))),
            ],
        ));
        let p = processor(service.clone(), client.clone());

        p.iterate(&CancellationToken::new()).await.unwrap();

        let calls = client.calls();
        assert_eq!(calls.len(), 2);
        assert!(calls[1].1.duration_since(calls[0].1) >= retry_after);

        // The throttled retry succeeded, so this is a success on the entry
        // attempt count, not a failure.
        let applied = service.applied();
        assert_eq!(applied.len(), 1);
        assert_eq!(applied[0].len(), 1);
        assert_eq!(applied[0][0].attempts, 1);
        assert!(matches!(
            applied[0][0].outcome,
            AccrualOutcome::Settled { .. }
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn cancellation_interrupts_throttle_wait() {
        let service = Arc::new(StubService::new(vec![order(1, "ORDER-001", 0)]));
        let client = Arc::new(StubClient::new().script(
            "ORDER-001",
            vec![Err(AccrualClientError::TooManyRequests(Duration::from_secs(
                120,
            )))],
        ));
        let p = processor(service.clone(), client.clone());

        let shutdown = CancellationToken::new();
        shutdown.cancel();
        p.iterate(&shutdown).await.unwrap();

        // One call, no endless throttle wait: the worker reported the
        // cancellation as a failed poll.
        assert_eq!(client.calls().len(), 1);
        let applied = service.applied();
        assert_eq!(applied.len(), 1);
        assert!(matches!(
            applied[0][0].outcome,
            AccrualOutcome::Failed { .. }
        ));
    }

    #[tokio::test]
    async fn run_stops_on_cancellation() {
        let service = Arc::new(StubService::new(Vec::new()));
        let client = Arc::new(StubClient::new());
        let p = processor(service, client);

        let shutdown = CancellationToken::new();
        shutdown.cancel();

        tokio::time::timeout(Duration::from_secs(1), p.run(shutdown))
            .await
            .expect("run should return promptly once cancelled");
    }
}
