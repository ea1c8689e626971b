//! Accrual provider integration: stateless HTTP client plus the
//! long-running reconciliation processor.

pub mod client;
pub mod processor;

pub use client::{AccrualClient, AccrualClientError, AccrualReply, ProviderStatus};
pub use processor::AccrualProcessor;

use async_trait::async_trait;

use crate::models::Order;
use crate::services::order_service::{AccrualUpdate, OrderServiceError};
use crate::services::OrderService;

/// Provider lookup seam; the processor only ever talks to this.
#[async_trait]
pub trait AccrualApi: Send + Sync {
    async fn get_order_accrual(&self, order_code: &str) -> Result<AccrualReply, AccrualClientError>;
}

/// Ledger-side seam of the processor: produce due orders, apply outcomes.
#[async_trait]
pub trait ReconciliationService: Send + Sync {
    async fn orders_for_accrual_monitoring(&self, limit: i64)
        -> Result<Vec<Order>, OrderServiceError>;

    async fn update_accrual(&self, updates: Vec<AccrualUpdate>) -> Result<(), OrderServiceError>;
}

#[async_trait]
impl ReconciliationService for OrderService {
    async fn orders_for_accrual_monitoring(
        &self,
        limit: i64,
    ) -> Result<Vec<Order>, OrderServiceError> {
        OrderService::orders_for_accrual_monitoring(self, limit).await
    }

    async fn update_accrual(&self, updates: Vec<AccrualUpdate>) -> Result<(), OrderServiceError> {
        OrderService::update_accrual(self, updates).await
    }
}
