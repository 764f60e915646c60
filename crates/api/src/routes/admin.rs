//! Operator endpoints
//!
//! Bearer-secret protected surface for the session-refresh workflow and
//! manual intervention: retry a stuck customer, inspect or revoke the raw
//! TradingView grant state.

use axum::{extract::State, http::header, http::HeaderMap, Json};
use pinegate_provisioning::{
    AccessState, CustomerProfile, GrantOutcome, ProvisionReason, ProvisioningStatus,
};
use serde::{Deserialize, Serialize};

use crate::{error::ApiError, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CustomerRequest {
    pub customer_id: String,
}

#[derive(Debug, Serialize)]
pub struct RetryAccessResponse {
    pub success: bool,
    pub provisioning_status: ProvisioningStatus,
    pub message: String,
    pub results: Vec<GrantOutcome>,
}

#[derive(Debug, Serialize)]
pub struct AccessStateResponse {
    pub username: String,
    pub states: Vec<AccessState>,
}

#[derive(Debug, Serialize)]
pub struct RevokeAccessResponse {
    pub username: String,
    pub results: Vec<GrantOutcome>,
}

fn authorize(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    let expected = state
        .config
        .admin_retry_secret
        .as_deref()
        .ok_or(ApiError::Unauthorized)?;
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", expected));
    if !authorized {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

/// Username lookup shared by the raw-grant endpoints
async fn stored_username(state: &AppState, customer_id: &str) -> Result<String, ApiError> {
    let customer = state.customers.retrieve(customer_id).await?;
    CustomerProfile::of(&customer)
        .tradingview_username
        .ok_or(ApiError::NeedsOnboarding)
}

/// Re-attempt provisioning for a customer, bypassing the short-circuit.
///
/// Typically invoked by the session-refresh workflow after rotating the
/// TradingView credential, to drain customers stuck in `retry_pending`.
pub async fn retry_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CustomerRequest>,
) -> ApiResult<Json<RetryAccessResponse>> {
    authorize(&state, &headers)?;

    let customer = state.customers.retrieve(&req.customer_id).await?;

    let outcome = state
        .provisioner
        .ensure_access(&customer, None, ProvisionReason::ManualRefresh)
        .await?;

    let status = outcome.status();
    let success = status == ProvisioningStatus::Complete;
    let results = match outcome {
        pinegate_provisioning::ProvisionOutcome::Granted { outcomes, .. }
        | pinegate_provisioning::ProvisionOutcome::Failed { outcomes, .. } => outcomes,
        pinegate_provisioning::ProvisionOutcome::AlreadyProvisioned => Vec::new(),
    };

    Ok(Json(RetryAccessResponse {
        success,
        provisioning_status: status,
        message: if success {
            "Access granted".to_string()
        } else {
            "Provisioning failed; see customer last_error".to_string()
        },
        results,
    }))
}

/// Raw per-indicator grant state for a customer's stored username
pub async fn access_state(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CustomerRequest>,
) -> ApiResult<Json<AccessStateResponse>> {
    authorize(&state, &headers)?;

    let username = stored_username(&state, &req.customer_id).await?;
    let states = state.tradingview.check_access(&username).await?;

    Ok(Json(AccessStateResponse { username, states }))
}

/// Remove the TradingView grants for a customer's stored username.
///
/// Never called by the billing lifecycle (cancellation lets access lapse);
/// this exists for manual cleanup of refunds and abuse.
pub async fn revoke_access(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CustomerRequest>,
) -> ApiResult<Json<RevokeAccessResponse>> {
    authorize(&state, &headers)?;

    let username = stored_username(&state, &req.customer_id).await?;
    let results = state.tradingview.revoke_access(&username).await?;

    tracing::info!(
        customer_id = %req.customer_id,
        username = %username,
        "Revoked TradingView access via operator endpoint"
    );

    Ok(Json(RevokeAccessResponse { username, results }))
}
