//! API error types and handling

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pinegate_provisioning::ProvisioningError;
use serde_json::json;

/// Application error type
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    // Authentication errors
    #[error("Authentication required")]
    Unauthorized,
    #[error("Invalid or expired token")]
    InvalidToken,

    // Validation errors
    #[error("Validation error: {0}")]
    Validation(String),
    #[error("Invalid request: {0}")]
    BadRequest(String),

    // Resource errors
    #[error("Customer not found")]
    CustomerNotFound,
    #[error("No active subscription found")]
    NoActiveSubscription,
    #[error("No TradingView username found")]
    NeedsOnboarding,

    // Upstream errors
    #[error("Upstream service error: {0}")]
    Upstream(String),

    // Internal errors
    #[error("Internal server error")]
    Internal,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code, message) = match &self {
            // Authentication
            ApiError::Unauthorized => (StatusCode::UNAUTHORIZED, "UNAUTHORIZED", self.to_string()),
            ApiError::InvalidToken => (StatusCode::UNAUTHORIZED, "INVALID_TOKEN", self.to_string()),

            // Validation
            ApiError::Validation(msg) => (StatusCode::BAD_REQUEST, "VALIDATION_ERROR", msg.clone()),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, "BAD_REQUEST", msg.clone()),

            // Resources
            ApiError::CustomerNotFound => {
                (StatusCode::NOT_FOUND, "CUSTOMER_NOT_FOUND", self.to_string())
            }
            ApiError::NoActiveSubscription => (
                StatusCode::BAD_REQUEST,
                "NO_ACTIVE_SUBSCRIPTION",
                self.to_string(),
            ),
            ApiError::NeedsOnboarding => (
                StatusCode::BAD_REQUEST,
                "NEEDS_ONBOARDING",
                self.to_string(),
            ),

            // Upstream: keep detail in logs, not in the response
            ApiError::Upstream(_) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "UPSTREAM_ERROR",
                "Upstream service error".to_string(),
            ),

            // Internal
            ApiError::Internal => (
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL_ERROR",
                self.to_string(),
            ),
        };

        let body = Json(json!({
            "error": {
                "code": code,
                "message": message,
            }
        }));

        (status, body).into_response()
    }
}

impl From<ProvisioningError> for ApiError {
    fn from(err: ProvisioningError) -> Self {
        match err {
            ProvisioningError::NeedsOnboarding => ApiError::NeedsOnboarding,
            ProvisioningError::CustomerNotFound(_) => ApiError::CustomerNotFound,
            other => {
                tracing::error!(error = %other, "Provisioning error");
                ApiError::Upstream(other.to_string())
            }
        }
    }
}

/// Result type alias for API handlers
pub type ApiResult<T> = Result<T, ApiError>;
