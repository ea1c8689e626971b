//! Stateless HTTP client for the external accrual provider.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{header, StatusCode};
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;

use super::AccrualApi;
use crate::models::OrderStatus;

/// `Retry-After` values outside this window are replaced by the default.
const MIN_RETRY_AFTER_SECS: u64 = 1;
const MAX_RETRY_AFTER_SECS: u64 = 120;
const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ProviderStatus {
    Registered,
    Processing,
    Processed,
    Invalid,
}

impl ProviderStatus {
    /// The ledger status this provider status maps onto. REGISTERED has no
    /// counterpart: the order is simply polled again next tick.
    pub fn as_order_status(self) -> Option<OrderStatus> {
        match self {
            ProviderStatus::Registered => None,
            ProviderStatus::Processing => Some(OrderStatus::Processing),
            ProviderStatus::Processed => Some(OrderStatus::Processed),
            ProviderStatus::Invalid => Some(OrderStatus::Invalid),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AccrualReply {
    #[serde(rename = "order")]
    pub order_code: String,
    pub status: ProviderStatus,
    #[serde(default, with = "rust_decimal::serde::float_option")]
    pub accrual: Option<Decimal>,
}

#[derive(Debug, Error)]
pub enum AccrualClientError {
    #[error("unexpected status code {0}")]
    StatusCode(u16),

    #[error("provider throttled, retry after {0:?}")]
    TooManyRequests(Duration),

    #[error("accrual request failed: {0}")]
    Request(#[from] reqwest::Error),
}

#[derive(Clone)]
pub struct AccrualClient {
    base_url: String,
    http: reqwest::Client,
}

impl AccrualClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            http,
        })
    }

    /// `GET {base}/api/orders/{code}`. The body is decoded only on 200; 429
    /// becomes [`AccrualClientError::TooManyRequests`] with a sanitized
    /// `Retry-After`, every other status the typed status-code error.
    async fn fetch_order_accrual(
        &self,
        order_code: &str,
    ) -> Result<AccrualReply, AccrualClientError> {
        let url = format!("{}/api/orders/{}", self.base_url, order_code);
        let response = self.http.get(&url).send().await?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            let retry_after = parse_retry_after(
                response
                    .headers()
                    .get(header::RETRY_AFTER)
                    .and_then(|value| value.to_str().ok()),
            );
            return Err(AccrualClientError::TooManyRequests(retry_after));
        }
        if status != StatusCode::OK {
            return Err(AccrualClientError::StatusCode(status.as_u16()));
        }

        Ok(response.json::<AccrualReply>().await?)
    }
}

#[async_trait]
impl AccrualApi for AccrualClient {
    async fn get_order_accrual(&self, order_code: &str) -> Result<AccrualReply, AccrualClientError> {
        self.fetch_order_accrual(order_code).await
    }
}

fn parse_retry_after(header: Option<&str>) -> Duration {
    let seconds = header
        .and_then(|value| value.trim().parse::<u64>().ok())
        .filter(|secs| (MIN_RETRY_AFTER_SECS..=MAX_RETRY_AFTER_SECS).contains(secs))
        .unwrap_or(DEFAULT_RETRY_AFTER_SECS);
    Duration::from_secs(seconds)
}
