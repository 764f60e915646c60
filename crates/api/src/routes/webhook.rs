//! Stripe webhook ingestion

use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{error::ApiError, state::AppState};

/// Handle Stripe webhook events.
///
/// Acknowledges with `{"received": true}` once the event is authenticated,
/// even when downstream provisioning failed - those failures live in the
/// customer's provisioning status, and a 500 would only make Stripe redeliver
/// an event we have already acted on.
pub async fn stripe_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> Result<Json<Value>, ApiError> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| {
            tracing::warn!("Stripe webhook missing signature header");
            ApiError::BadRequest("Missing Stripe signature".to_string())
        })?;

    let event = state.webhooks.verify_event(&body, signature).map_err(|e| {
        tracing::warn!(error = ?e, "Stripe webhook signature verification failed");
        ApiError::BadRequest("Invalid webhook signature".to_string())
    })?;

    tracing::info!(
        event_type = %event.type_,
        event_id = %event.id,
        "Stripe webhook event verified"
    );

    state.webhooks.handle_event(event).await.map_err(|e| {
        tracing::error!(error = %e, "Webhook handling error");
        ApiError::Upstream(e.to_string())
    })?;

    Ok(Json(json!({ "received": true })))
}
