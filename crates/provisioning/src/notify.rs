//! Operational notification delivery
//!
//! Sends chat-ops alerts via a Discord or Slack incoming webhook. Used by the
//! session health probe, which is the primary recovery signal for an expired
//! TradingView session credential.

use serde_json::json;

/// Chat-ops webhook notifier
#[derive(Clone)]
pub struct OpsNotifier {
    http: reqwest::Client,
    webhook_url: Option<String>,
}

impl OpsNotifier {
    /// Create a new notifier
    pub fn new(http: reqwest::Client, webhook_url: Option<String>) -> Self {
        Self { http, webhook_url }
    }

    pub fn from_env(http: reqwest::Client) -> Self {
        Self::new(http, std::env::var("NOTIFICATION_WEBHOOK_URL").ok())
    }

    /// Send a message to the configured webhook.
    ///
    /// Payload carries both `content` (Discord) and `text` (Slack) so either
    /// webhook flavor renders it. Failures are logged, never propagated.
    pub async fn send(&self, message: &str) {
        let Some(ref webhook_url) = self.webhook_url else {
            tracing::warn!("Notification webhook URL not configured, skipping notification");
            return;
        };

        let payload = json!({
            "content": message,
            "text": message,
        });

        match self.http.post(webhook_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                tracing::info!("Sent operational notification");
            }
            Ok(response) => {
                tracing::error!(
                    status = %response.status(),
                    "Notification webhook rejected the message"
                );
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to send webhook notification");
            }
        }
    }

    /// Alert operators that the TradingView session credential was rejected
    pub async fn notify_session_expired(&self) {
        let message = "TradingView session expired!\n\n\
            The stored TV_SESSION_ID was rejected. Please:\n\
            1. Log in to TradingView with the grant account\n\
            2. Copy the sessionid cookie from the browser\n\
            3. Update TV_SESSION_ID in the deployment environment\n\
            4. Redeploy the service";
        self.send(message).await;
    }
}
