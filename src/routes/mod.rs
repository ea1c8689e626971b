//! HTTP surface: maps requests onto the services.

pub mod auth;
pub mod balance;
pub mod error;
pub mod health;
pub mod orders;

use std::sync::Arc;

use axum::middleware::from_fn_with_state;
use axum::routing::{get, post};
use axum::Router;
use tower_http::cors::{Any, CorsLayer};

use crate::auth::JwtKeys;
use crate::middleware::require_auth;
use crate::services::{BalanceService, OrderService, UserService};

#[derive(Clone)]
pub struct AppState {
    pub users: Arc<UserService>,
    pub orders: Arc<OrderService>,
    pub balances: Arc<BalanceService>,
    pub jwt: JwtKeys,
}

pub fn router(state: AppState) -> Router {
    let protected = Router::new()
        .route("/user/orders", post(orders::create).get(orders::index))
        .route("/user/balance", get(balance::index))
        .route("/user/balance/withdraw", post(balance::withdraw))
        .route("/user/withdrawals", get(balance::withdrawals))
        .route_layer(from_fn_with_state(state.clone(), require_auth));

    let api = Router::new()
        .route("/health", get(health::health))
        .route("/user/register", post(auth::register))
        .route("/user/login", post(auth::login))
        .merge(protected);

    Router::new()
        .nest("/api", api)
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
