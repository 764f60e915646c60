//! Checkout and billing portal sessions
//!
//! Billing mechanics (proration, invoicing, tax) are fully delegated to
//! Stripe; these handlers only open the hosted surfaces.

use axum::{extract::State, Json};
use pinegate_provisioning::{CustomerProfile, ProvisioningStatus};
use serde::{Deserialize, Serialize};
use stripe::{
    BillingPortalSession, CheckoutSession, CheckoutSessionMode, CreateBillingPortalSession,
    CreateCheckoutSession, CreateCheckoutSessionLineItems, CustomerId,
};

use crate::{auth::AuthUser, error::ApiError, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct CreateCheckoutRequest {
    pub plan_id: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub session_id: String,
    pub url: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct PortalResponse {
    pub portal_url: String,
}

/// Create a subscription-mode checkout session for a known plan.
///
/// Requires a validated TradingView username up front, so the webhook can
/// grant access the moment payment lands. The plan snapshot is written with
/// status `incomplete` before redirecting to Stripe; checkout completion
/// moves it through `pending` to `complete`.
pub async fn create_checkout_session(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<CreateCheckoutRequest>,
) -> ApiResult<Json<CheckoutResponse>> {
    let plan = state
        .plans
        .by_plan_id(&req.plan_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest("Invalid plan selected".to_string()))?;

    let customer = state.customers.get_or_create(&auth_user.email).await?;

    if CustomerProfile::of(&customer)
        .tradingview_username
        .is_none()
    {
        return Err(ApiError::Validation(
            "Please set your TradingView username first".to_string(),
        ));
    }

    state
        .customers
        .write_plan_snapshot(customer.id.as_str(), &plan)
        .await?;
    state
        .customers
        .set_provisioning_status(customer.id.as_str(), ProvisioningStatus::Incomplete)
        .await?;

    let customer_id = parse_customer_id(customer.id.as_str())?;
    let base_url = &state.stripe.config().app_base_url;
    let success_url = format!("{}/success?session_id={{CHECKOUT_SESSION_ID}}", base_url);
    let cancel_url = format!("{}/checkout", base_url);

    let params = CreateCheckoutSession {
        customer: Some(customer_id),
        mode: Some(CheckoutSessionMode::Subscription),
        line_items: Some(vec![CreateCheckoutSessionLineItems {
            price: Some(plan.price_id.clone()),
            quantity: Some(1),
            ..Default::default()
        }]),
        success_url: Some(&success_url),
        cancel_url: Some(&cancel_url),
        allow_promotion_codes: Some(true),
        ..Default::default()
    };

    let session = CheckoutSession::create(state.stripe.inner(), params)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create checkout session");
            ApiError::Upstream(e.to_string())
        })?;

    tracing::info!(
        customer_id = %customer.id,
        session_id = %session.id,
        plan_type = %plan.plan_type,
        "Created checkout session"
    );

    Ok(Json(CheckoutResponse {
        session_id: session.id.to_string(),
        url: session.url,
    }))
}

/// Create a billing portal session
pub async fn create_portal_session(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<PortalResponse>> {
    let customer = state
        .customers
        .find_by_email(&auth_user.email)
        .await?
        .ok_or(ApiError::CustomerNotFound)?;
    let customer_id = parse_customer_id(customer.id.as_str())?;

    let return_url = format!("{}/dashboard", state.stripe.config().app_base_url);

    let mut params = CreateBillingPortalSession::new(customer_id);
    params.return_url = Some(&return_url);

    let session = BillingPortalSession::create(state.stripe.inner(), params)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to create billing portal session");
            ApiError::Upstream(e.to_string())
        })?;

    Ok(Json(PortalResponse {
        portal_url: session.url,
    }))
}

fn parse_customer_id(customer_id: &str) -> Result<CustomerId, ApiError> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| ApiError::Upstream(format!("Invalid customer ID: {}", e)))
}
