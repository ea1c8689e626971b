//! Order upload and listing handlers.

use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::{Extension, Json};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::Serialize;

use super::error::ApiError;
use super::AppState;
use crate::middleware::CurrentUser;
use crate::models::{Order, OrderStatus};
use crate::services::OrderServiceError;
use crate::validation::is_valid_order_code;

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub number: String,
    pub status: OrderStatus,
    #[serde(
        skip_serializing_if = "Option::is_none",
        with = "rust_decimal::serde::float_option"
    )]
    pub accrual: Option<Decimal>,
    pub uploaded_at: DateTime<Utc>,
}

impl From<Order> for OrderResponse {
    fn from(order: Order) -> Self {
        let accrual = if order.accrual.is_zero() {
            None
        } else {
            Some(order.accrual)
        };
        Self {
            number: order.order_code,
            status: order.status,
            accrual,
            uploaded_at: order.created_at,
        }
    }
}

/// POST /api/user/orders — plain-text body carrying the order code.
pub async fn create(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    headers: HeaderMap,
    body: String,
) -> Result<StatusCode, ApiError> {
    if !is_text_plain(&headers) {
        return Err(ApiError::bad_request("expected text/plain body"));
    }

    let order_code = body.trim();
    if !is_valid_order_code(order_code) {
        return Err(ApiError::unprocessable("invalid order code"));
    }

    match state.orders.create(user_id, order_code).await {
        Ok(_) => Ok(StatusCode::ACCEPTED),
        Err(OrderServiceError::Duplicate { existing }) => {
            if existing.user_id == user_id {
                // Re-uploading your own code is idempotent.
                Ok(StatusCode::OK)
            } else {
                Err(ApiError::new(
                    StatusCode::CONFLICT,
                    "order code uploaded by another user",
                ))
            }
        }
        Err(err) => Err(ApiError::internal(err)),
    }
}

/// GET /api/user/orders
pub async fn index(
    State(state): State<AppState>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
) -> Result<Response, ApiError> {
    let orders = state
        .orders
        .get_by_user(user_id)
        .await
        .map_err(ApiError::internal)?;

    if orders.is_empty() {
        return Ok(StatusCode::NO_CONTENT.into_response());
    }

    let response: Vec<OrderResponse> = orders.into_iter().map(OrderResponse::from).collect();
    Ok(Json(response).into_response())
}

fn is_text_plain(headers: &HeaderMap) -> bool {
    headers
        .get(header::CONTENT_TYPE)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.contains("text/plain"))
        .unwrap_or(false)
}
