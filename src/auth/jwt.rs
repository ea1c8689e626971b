//! Symmetric (HS256) bearer tokens carrying the user id.

use chrono::{Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Issued tokens expire after one hour.
const TOKEN_TTL_HOURS: i64 = 1;

#[derive(Debug, Serialize, Deserialize)]
pub struct UserClaims {
    pub sub: String, // user id
    pub iat: i64,
    pub exp: i64,
}

#[derive(Debug, Error)]
pub enum TokenError {
    #[error("sign token: {0}")]
    Sign(#[source] jsonwebtoken::errors::Error),

    #[error("invalid bearer token")]
    Invalid,
}

#[derive(Clone)]
pub struct JwtKeys {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl JwtKeys {
    pub fn from_secret(secret: &[u8]) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
        }
    }

    pub fn sign_user_token(&self, user_id: i64) -> Result<String, TokenError> {
        let now = Utc::now();
        let claims = UserClaims {
            sub: user_id.to_string(),
            iat: now.timestamp(),
            exp: (now + Duration::hours(TOKEN_TTL_HOURS)).timestamp(),
        };

        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(TokenError::Sign)
    }

    /// Validates signature and expiry, returning the user id the token was
    /// issued for.
    pub fn validate_user_token(&self, token: &str) -> Result<i64, TokenError> {
        let validation = Validation::new(Algorithm::HS256);
        let data = jsonwebtoken::decode::<UserClaims>(token, &self.decoding, &validation)
            .map_err(|_| TokenError::Invalid)?;

        data.claims.sub.parse().map_err(|_| TokenError::Invalid)
    }
}
