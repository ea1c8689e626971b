//! Bearer-token authentication middleware.

use axum::extract::{Request, State};
use axum::http::header;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};

use crate::routes::error::ApiError;
use crate::routes::AppState;

/// Identity of the authenticated caller, inserted into request extensions
/// by [`require_auth`].
#[derive(Debug, Clone, Copy)]
pub struct CurrentUser(pub i64);

pub async fn require_auth(
    State(state): State<AppState>,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(user_id) = bearer_user_id(&state, &request) else {
        return ApiError::unauthorized().into_response();
    };

    request.extensions_mut().insert(CurrentUser(user_id));
    next.run(request).await
}

fn bearer_user_id(state: &AppState, request: &Request) -> Option<i64> {
    let header = request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?;
    let token = header.strip_prefix("Bearer ")?;
    state.jwt.validate_user_token(token).ok()
}
