//! TradingView username validation

use axum::{extract::State, Json};
use serde::{Deserialize, Serialize};

use crate::{auth::AuthUser, error::ApiResult, state::AppState};
use crate::error::ApiError;

#[derive(Debug, Deserialize)]
pub struct ValidateRequest {
    pub username: String,
}

#[derive(Debug, Serialize)]
pub struct ValidateResponse {
    pub success: bool,
    pub verified_username: String,
}

/// Validate a TradingView username and store it on the customer record.
///
/// The stored value is the platform's canonical casing, not what the user
/// typed; it is set once here and only changes through re-validation.
pub async fn validate_username(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<ValidateRequest>,
) -> ApiResult<Json<ValidateResponse>> {
    let username = req.username.trim();

    if username.is_empty() {
        return Err(ApiError::Validation("Username cannot be empty".to_string()));
    }
    if !username
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(ApiError::Validation(
            "Username can only contain letters, numbers, underscores, and hyphens".to_string(),
        ));
    }

    let validation = state.tradingview.validate_username(username).await?;

    if !validation.valid {
        return Err(ApiError::Validation(
            "TradingView username not found. Please check and try again.".to_string(),
        ));
    }

    let customer = state.customers.get_or_create(&auth_user.email).await?;
    state
        .customers
        .set_username(&customer, &validation.verified_username)
        .await?;

    Ok(Json(ValidateResponse {
        success: true,
        verified_username: validation.verified_username,
    }))
}
