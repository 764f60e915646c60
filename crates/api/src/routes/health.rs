//! Health check endpoints

use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;

use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Health check endpoint
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

/// Liveness probe (just returns 200 if the server is running)
pub async fn liveness() -> StatusCode {
    StatusCode::OK
}

#[derive(Serialize)]
pub struct TvSessionResponse {
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// TradingView session credential probe.
///
/// Exercises the stored session cookie against a lightweight authenticated
/// page. A rejected cookie fires the chat-ops notification - this probe is
/// the primary recovery signal for the expiring-session failure mode.
pub async fn tv_session(State(state): State<AppState>) -> (StatusCode, Json<TvSessionResponse>) {
    match state.tradingview.session_healthy().await {
        Ok(true) => (
            StatusCode::OK,
            Json(TvSessionResponse {
                healthy: true,
                message: Some("TradingView session is valid".to_string()),
                error: None,
            }),
        ),
        Ok(false) => {
            tracing::error!("TradingView session credential rejected");
            state.notifier.notify_session_expired().await;
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(TvSessionResponse {
                    healthy: false,
                    message: None,
                    error: Some(
                        "TradingView session expired. Please refresh TV_SESSION_ID.".to_string(),
                    ),
                }),
            )
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to check TradingView session");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(TvSessionResponse {
                    healthy: false,
                    message: None,
                    error: Some("Failed to check session".to_string()),
                }),
            )
        }
    }
}
