//! Registration and login handlers.

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::error::ApiError;
use super::AppState;
use crate::models::User;
use crate::services::UserServiceError;

const MAX_LOGIN_CHARS: usize = 15;
const MIN_PASSWORD_CHARS: usize = 6;
const MAX_PASSWORD_CHARS: usize = 255;

#[derive(Debug, Deserialize)]
pub struct CredentialsRequest {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub id: i64,
    pub login: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            login: user.username,
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

pub async fn register(
    State(state): State<AppState>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let req = bind_credentials(body)?;

    match state.users.register(&req.login, &req.password).await {
        Ok((_, token)) => Ok((bearer_header(&token), StatusCode::OK).into_response()),
        Err(UserServiceError::DuplicateUsername) => Err(ApiError::new(
            StatusCode::CONFLICT,
            "user with this login already exists",
        )),
        Err(err) => Err(ApiError::internal(err)),
    }
}

pub async fn login(
    State(state): State<AppState>,
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<Response, ApiError> {
    let req = bind_credentials(body)?;

    match state.users.login(&req.login, &req.password).await {
        Ok((user, token)) => Ok((
            bearer_header(&token),
            Json(json!({ "user": UserResponse::from(user) })),
        )
            .into_response()),
        Err(UserServiceError::InvalidCredentials) => Err(ApiError::new(
            StatusCode::UNAUTHORIZED,
            "invalid credentials",
        )),
        Err(err) => Err(ApiError::internal(err)),
    }
}

fn bind_credentials(
    body: Result<Json<CredentialsRequest>, JsonRejection>,
) -> Result<CredentialsRequest, ApiError> {
    let Json(req) = body.map_err(|_| ApiError::bad_request("invalid request body"))?;
    validate_credentials(&req)?;
    Ok(req)
}

fn validate_credentials(req: &CredentialsRequest) -> Result<(), ApiError> {
    let login_chars = req.login.chars().count();
    if login_chars == 0 || login_chars > MAX_LOGIN_CHARS {
        return Err(ApiError::unprocessable("login must be 1-15 characters"));
    }

    let password_chars = req.password.chars().count();
    if !(MIN_PASSWORD_CHARS..=MAX_PASSWORD_CHARS).contains(&password_chars) {
        return Err(ApiError::unprocessable("password must be 6-255 characters"));
    }

    Ok(())
}

fn bearer_header(token: &str) -> [(header::HeaderName, String); 1] {
    [(header::AUTHORIZATION, format!("Bearer {token}"))]
}
