//! Subscription endpoints: refresh, status, plans, change-plan, cancel

use axum::{
    extract::{Query, State},
    Json,
};
use pinegate_provisioning::{
    subscription_price, CustomerProfile, Plan, ProvisionOutcome, ProvisionReason,
    ProvisioningStatus,
};
use serde::{Deserialize, Serialize};
use stripe::{
    Subscription, SubscriptionId, SubscriptionStatus, UpdateSubscription,
    UpdateSubscriptionItems,
};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

use crate::{auth::AuthUser, error::ApiError, error::ApiResult, state::AppState};

#[derive(Debug, Deserialize)]
pub struct RefreshQuery {
    /// Force a re-attempt even when provisioning is already complete
    #[serde(default)]
    pub force: bool,
}

#[derive(Debug, Serialize)]
pub struct RefreshResponse {
    pub success: bool,
    pub message: String,
    pub provisioning_status: ProvisioningStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub already_provisioned: Option<bool>,
}

/// Re-attempt provisioning for the calling user.
///
/// The default mode is the post-checkout polling target: it short-circuits
/// once status is `complete` and makes no TradingView calls. `?force=true`
/// always re-attempts, which is the self-healing path for stuck states.
pub async fn refresh_access(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Query(query): Query<RefreshQuery>,
) -> ApiResult<Json<RefreshResponse>> {
    let customer = state
        .customers
        .find_by_email(&auth_user.email)
        .await?
        .ok_or(ApiError::CustomerNotFound)?;

    let subscription = state
        .customers
        .active_subscription(customer.id.as_str())
        .await?
        .ok_or(ApiError::NoActiveSubscription)?;

    let plan = match subscription_price(&subscription) {
        Some(price) => state.plans.by_price_id(price.id.as_str()).await?,
        None => None,
    };

    let reason = if query.force {
        ProvisionReason::ManualRefresh
    } else {
        ProvisionReason::StatusCheck
    };

    let outcome = state
        .provisioner
        .ensure_access(&customer, plan.as_ref(), reason)
        .await?;

    Ok(Json(match outcome {
        ProvisionOutcome::AlreadyProvisioned => RefreshResponse {
            success: true,
            message: "Access already granted".to_string(),
            provisioning_status: ProvisioningStatus::Complete,
            already_provisioned: Some(true),
        },
        ProvisionOutcome::Granted {
            username, duration, ..
        } => RefreshResponse {
            success: true,
            message: format!("Access granted to {} for {}", username, duration),
            provisioning_status: ProvisioningStatus::Complete,
            already_provisioned: None,
        },
        ProvisionOutcome::Failed { status, .. } => RefreshResponse {
            success: false,
            message: "Failed to grant access. Please try again later.".to_string(),
            provisioning_status: status,
            already_provisioned: None,
        },
    }))
}

#[derive(Debug, Serialize)]
pub struct PlanSummary {
    pub id: String,
    pub name: String,
    pub plan_type: String,
    pub price: f64,
    pub currency: String,
    pub interval: String,
}

impl From<&Plan> for PlanSummary {
    fn from(plan: &Plan) -> Self {
        Self {
            id: plan.id.clone(),
            name: plan.name.clone(),
            plan_type: plan.plan_type.clone(),
            price: plan.price,
            currency: plan.currency.clone(),
            interval: plan.interval.clone(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PlansResponse {
    pub plans: Vec<Plan>,
}

/// List the sellable plans (public)
pub async fn list_plans(State(state): State<AppState>) -> ApiResult<Json<PlansResponse>> {
    let plans = state.plans.all().await?;
    Ok(Json(PlansResponse { plans }))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionDetails {
    pub id: String,
    pub status: String,
    pub plan_name: String,
    pub plan_type: String,
    pub price_amount: f64,
    pub currency: String,
    pub interval: String,
    pub current_period_end: String,
    pub cancel_at_period_end: bool,
    pub total_access_months: u32,
    pub bonus_months: u32,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub customer_id: String,
    pub tradingview_username: Option<String>,
    pub has_active_subscription: bool,
    pub subscription: Option<SubscriptionDetails>,
    pub provisioning_status: ProvisioningStatus,
    pub available_plans: Vec<PlanSummary>,
}

/// Current customer snapshot: username, subscription summary, provisioning
/// status, and the plan catalog
pub async fn subscription_status(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<StatusResponse>> {
    let customer = state.customers.get_or_create(&auth_user.email).await?;
    let profile = CustomerProfile::of(&customer);

    let subscription = state
        .customers
        .active_subscription(customer.id.as_str())
        .await?;

    let mut details = None;
    if let Some(sub) = &subscription {
        if let Some(price) = subscription_price(sub) {
            let current_plan = state.plans.by_price_id(price.id.as_str()).await?;

            // Plan metadata from the live catalog, falling back to the
            // snapshot stored on the customer record
            let total_access_months = current_plan
                .as_ref()
                .map(Plan::total_access_months)
                .filter(|&m| m > 0)
                .or_else(|| profile.plan.as_ref().map(|p| p.total_access_months))
                .unwrap_or(pinegate_provisioning::DEFAULT_ACCESS_MONTHS);
            let bonus_months = current_plan
                .as_ref()
                .map(|p| p.bonus_months)
                .or_else(|| profile.plan.as_ref().map(|p| p.bonus_months))
                .unwrap_or(0);
            let plan_type = current_plan
                .as_ref()
                .map(|p| p.plan_type.clone())
                .or_else(|| profile.plan.as_ref().map(|p| p.plan_type.clone()))
                .unwrap_or_else(|| "unknown".to_string());

            details = Some(SubscriptionDetails {
                id: sub.id.to_string(),
                status: subscription_status_label(sub.status).to_string(),
                plan_name: current_plan
                    .as_ref()
                    .map(|p| p.name.clone())
                    .unwrap_or_else(|| "Subscription".to_string()),
                plan_type,
                price_amount: price.unit_amount.map(|a| a as f64 / 100.0).unwrap_or(0.0),
                currency: price
                    .currency
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "usd".to_string()),
                interval: pinegate_provisioning::plans::interval_label(price.recurring.as_ref()),
                current_period_end: format_unix(sub.current_period_end),
                cancel_at_period_end: sub.cancel_at_period_end,
                total_access_months,
                bonus_months,
            });
        }
    }

    let plans = state.plans.all().await?;

    Ok(Json(StatusResponse {
        customer_id: customer.id.to_string(),
        tradingview_username: profile.tradingview_username,
        has_active_subscription: subscription.is_some(),
        subscription: details,
        provisioning_status: profile.provisioning_status,
        available_plans: plans.iter().map(PlanSummary::from).collect(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChangePlanRequest {
    pub price_id: String,
}

#[derive(Debug, Serialize)]
pub struct ChangePlanResponse {
    pub success: bool,
    pub plan_type: String,
    pub provisioning_status: ProvisioningStatus,
}

/// Switch the active subscription to a different plan.
///
/// Proration is delegated to Stripe; the grant extension only ever moves the
/// TradingView expiration forward, so a switch never shortens existing
/// access.
pub async fn change_plan(
    State(state): State<AppState>,
    auth_user: AuthUser,
    Json(req): Json<ChangePlanRequest>,
) -> ApiResult<Json<ChangePlanResponse>> {
    let plan = state
        .plans
        .by_price_id(&req.price_id)
        .await?
        .ok_or_else(|| ApiError::BadRequest(format!("Unknown plan: {}", req.price_id)))?;

    let customer = state
        .customers
        .find_by_email(&auth_user.email)
        .await?
        .ok_or(ApiError::CustomerNotFound)?;

    let subscription = state
        .customers
        .active_subscription(customer.id.as_str())
        .await?
        .ok_or(ApiError::NoActiveSubscription)?;

    let current_price_id = subscription_price(&subscription).map(|p| p.id.to_string());
    if current_price_id.as_deref() == Some(req.price_id.as_str()) {
        return Err(ApiError::Validation("Already on this plan".to_string()));
    }

    let item_id = subscription
        .items
        .data
        .first()
        .map(|item| item.id.to_string())
        .ok_or_else(|| ApiError::Upstream("No subscription items found".to_string()))?;

    let sub_id = parse_subscription_id(subscription.id.as_str())?;
    let params = UpdateSubscription {
        items: Some(vec![UpdateSubscriptionItems {
            id: Some(item_id),
            price: Some(req.price_id.clone()),
            ..Default::default()
        }]),
        ..Default::default()
    };

    Subscription::update(state.stripe.inner(), &sub_id, params)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to update subscription plan");
            ApiError::Upstream(e.to_string())
        })?;

    // Re-snapshot and re-provision with the new duration. The subscription
    // updated webhook fires too, but converges on the same state.
    state
        .customers
        .write_plan_snapshot(customer.id.as_str(), &plan)
        .await?;

    let outcome = state
        .provisioner
        .ensure_access(&customer, Some(&plan), ProvisionReason::PlanChanged)
        .await?;

    tracing::info!(
        customer_id = %customer.id,
        plan_type = %plan.plan_type,
        status = %outcome.status(),
        "Changed subscription plan"
    );

    Ok(Json(ChangePlanResponse {
        success: true,
        plan_type: plan.plan_type,
        provisioning_status: outcome.status(),
    }))
}

#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub success: bool,
    pub cancel_at_period_end: bool,
    pub current_period_end: String,
}

/// Schedule cancellation at period end.
///
/// TradingView access is never revoked here: the grant lapses naturally at
/// its already-set expiration.
pub async fn cancel_subscription(
    State(state): State<AppState>,
    auth_user: AuthUser,
) -> ApiResult<Json<CancelResponse>> {
    let customer = state
        .customers
        .find_by_email(&auth_user.email)
        .await?
        .ok_or(ApiError::CustomerNotFound)?;

    let subscription = state
        .customers
        .active_subscription(customer.id.as_str())
        .await?
        .ok_or(ApiError::NoActiveSubscription)?;

    let sub_id = parse_subscription_id(subscription.id.as_str())?;
    let mut params = UpdateSubscription::new();
    params.cancel_at_period_end = Some(true);

    let updated = Subscription::update(state.stripe.inner(), &sub_id, params)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to cancel subscription");
            ApiError::Upstream(e.to_string())
        })?;

    tracing::info!(
        customer_id = %customer.id,
        subscription_id = %updated.id,
        "Subscription set to cancel at period end - access continues until expiration"
    );

    Ok(Json(CancelResponse {
        success: true,
        cancel_at_period_end: updated.cancel_at_period_end,
        current_period_end: format_unix(updated.current_period_end),
    }))
}

fn subscription_status_label(status: SubscriptionStatus) -> &'static str {
    match status {
        SubscriptionStatus::Active => "active",
        SubscriptionStatus::PastDue => "past_due",
        SubscriptionStatus::Canceled => "canceled",
        SubscriptionStatus::Unpaid => "unpaid",
        SubscriptionStatus::Trialing => "trialing",
        SubscriptionStatus::Incomplete => "incomplete",
        SubscriptionStatus::IncompleteExpired => "incomplete_expired",
        SubscriptionStatus::Paused => "paused",
    }
}

fn format_unix(timestamp: i64) -> String {
    OffsetDateTime::from_unix_timestamp(timestamp)
        .ok()
        .and_then(|dt| dt.format(&Rfc3339).ok())
        .unwrap_or_default()
}

fn parse_subscription_id(subscription_id: &str) -> Result<SubscriptionId, ApiError> {
    subscription_id
        .parse::<SubscriptionId>()
        .map_err(|e| ApiError::Upstream(format!("Invalid subscription ID: {}", e)))
}
