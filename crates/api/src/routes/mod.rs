//! API routes

pub mod admin;
pub mod checkout;
pub mod health;
pub mod subscription;
pub mod tradingview;
pub mod webhook;

use axum::{
    routing::{get, post},
    Router,
};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::state::AppState;

/// Create all API routes
pub fn create_router(state: AppState) -> Router {
    // Health check routes (at root level for infrastructure monitoring)
    let health_routes = Router::new()
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/tv-session", get(health::tv_session));

    // API routes - auth is enforced per-handler via the AuthUser extractor;
    // the webhook and plan listing are public, the webhook verifying its own
    // signature instead
    let api_routes = Router::new()
        .route("/billing/webhook", post(webhook::stripe_webhook))
        .route("/tradingview/validate", post(tradingview::validate_username))
        .route(
            "/subscription/refresh-access",
            post(subscription::refresh_access),
        )
        .route("/subscription/status", get(subscription::subscription_status))
        .route("/subscription/plans", get(subscription::list_plans))
        .route("/subscription/change-plan", post(subscription::change_plan))
        .route("/subscription/cancel", post(subscription::cancel_subscription))
        .route("/checkout/session", post(checkout::create_checkout_session))
        .route("/billing-portal", post(checkout::create_portal_session))
        .route("/admin/retry-access", post(admin::retry_access))
        .route("/admin/access-state", post(admin::access_state))
        .route("/admin/revoke-access", post(admin::revoke_access));

    Router::new()
        .merge(health_routes)
        .nest("/api/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
