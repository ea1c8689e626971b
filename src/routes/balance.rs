//! Balance, withdrawal and withdrawal-history handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use super::AppState;
use crate::middleware::CurrentUser;
use crate::models::{BalanceTransaction, UserBalance};
use crate::services::BalanceServiceError;
use crate::validation::is_valid_order_code;

#[derive(Debug, Serialize)]
pub struct BalanceResponse {
    #[serde(with = "rust_decimal::serde::float")]
    pub current: Decimal,
    #[serde(with = "rust_decimal::serde::float")]
    pub withdrawn: Decimal,
}

impl From<UserBalance> for BalanceResponse {
    fn from(balance: UserBalance) -> Self {
        Self {
            current: balance.current,
            withdrawn: balance.withdrawn,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub order: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
}

#[derive(Debug, Serialize)]
pub struct WithdrawalResponse {
    pub order: String,
    #[serde(with = "rust_decimal::serde::float")]
    pub sum: Decimal,
    pub processed_at: DateTime<Utc>,
}

impl From<BalanceTransaction> for WithdrawalResponse {
    fn from(transaction: BalanceTransaction) -> Self {
        Self {
            order: transaction.order_code,
            sum: transaction.amount,
            processed_at: transaction.created_at,
        }
    }
}

/// GET /api/user/balance
pub async fn index(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Json<BalanceResponse>, ApiError> {
    let balance = state
        .balances
        .get_user_balance(user_id)
        .await
        .map_err(ApiError::internal)?;

    Ok(Json(balance.into()))
}

/// POST /api/user/balance/withdraw
pub async fn withdraw(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    body: Result<Json<WithdrawRequest>, JsonRejection>,
) -> Result<StatusCode, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;

    if !is_valid_order_code(&req.order) {
        return Err(ApiError::unprocessable("invalid order code"));
    }
    if req.sum <= Decimal::ZERO {
        return Err(ApiError::unprocessable("withdrawal sum must be positive"));
    }

    match state.balances.withdraw(user_id, req.order, req.sum).await {
        Ok(_) => Ok(StatusCode::OK),
        Err(BalanceServiceError::NotEnoughBalance) => Err(ApiError::new(
            StatusCode::PAYMENT_REQUIRED,
            "not enough balance",
        )),
        Err(BalanceServiceError::DuplicateOrderCode) => {
            Err(ApiError::unprocessable("order code already used"))
        }
        Err(err) => Err(ApiError::internal(err)),
    }
}

/// GET /api/user/withdrawals
pub async fn withdrawals(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Response, ApiError> {
    let withdrawals = state
        .balances
        .get_withdrawals(user_id)
        .await
        .map_err(ApiError::internal)?;

    if withdrawals.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let response: Vec<WithdrawalResponse> = withdrawals
        .into_iter()
        .map(WithdrawalResponse::from)
        .collect();
    Ok(Json(response).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn balance_serializes_as_numbers() {
        let body = serde_json::to_value(BalanceResponse {
            current: Decimal::new(5005, 1), // 500.5
            withdrawn: Decimal::from(42),
        })
        .unwrap();
        assert_eq!(body["current"], serde_json::json!(500.5));
        assert_eq!(body["withdrawn"], serde_json::json!(42.0));
    }

    #[test]
    fn withdraw_request_accepts_integer_and_fractional_sums() {
        let req: WithdrawRequest =
            serde_json::from_str(r#"{"order":"12345678903","sum":300}"#).unwrap();
        assert_eq!(req.sum, Decimal::from(300));

        let req: WithdrawRequest =
            serde_json::from_str(r#"{"order":"12345678903","sum":10.5}"#).unwrap();
        assert_eq!(req.sum, Decimal::new(105, 1));
    }
}
