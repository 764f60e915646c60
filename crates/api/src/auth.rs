//! Bearer-token authentication
//!
//! The login flow lives in the web frontend; this API only validates the
//! HS256 session tokens it is handed and resolves them to a user email,
//! which is the key into the Stripe customer store.

use axum::{
    async_trait,
    extract::FromRequestParts,
    http::{header, request::Parts},
};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::ApiError;
use crate::state::AppState;

/// Claims carried by a session token
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// Subject (user id from the identity provider)
    pub sub: String,
    /// Email, the key into the customer store
    pub email: String,
    /// Issued at
    pub iat: i64,
    /// Expiration
    pub exp: i64,
}

/// JWT manager for token operations
#[derive(Clone)]
pub struct JwtManager {
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
}

impl JwtManager {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding_key: EncodingKey::from_secret(secret.as_bytes()),
            decoding_key: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    /// Generate a session token (used by tests and tooling; the production
    /// issuer is the frontend's auth layer sharing the same secret)
    pub fn generate_token(&self, sub: &str, email: &str) -> Result<String, ApiError> {
        let now = OffsetDateTime::now_utc();
        let claims = Claims {
            sub: sub.to_string(),
            email: email.to_string(),
            iat: now.unix_timestamp(),
            exp: (now + Duration::hours(24)).unix_timestamp(),
        };
        // Explicit algorithm prevents algorithm confusion attacks
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|_| ApiError::Internal)
    }

    /// Validate a session token and return its claims
    pub fn validate_token(&self, token: &str) -> Result<Claims, ApiError> {
        let validation = Validation::new(Algorithm::HS256);
        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|_| ApiError::InvalidToken)
    }
}

/// Authenticated user extracted from the bearer token
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub email: String,
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AppState,
    ) -> Result<Self, Self::Rejection> {
        let token = parts
            .headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.strip_prefix("Bearer "))
            .ok_or(ApiError::Unauthorized)?;

        let claims = state.jwt.validate_token(token)?;

        Ok(AuthUser {
            email: claims.email,
        })
    }
}
