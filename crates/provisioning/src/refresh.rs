//! Session refresh trigger
//!
//! The TradingView session cookie expires unpredictably and has no refresh
//! protocol, so recovery is an out-of-band action: a GitHub Actions workflow
//! that logs in and rotates the stored credential. The trigger is
//! fire-and-forget with a logged boolean outcome; its failure never changes
//! the provisioning result being reported.

use serde_json::json;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Capability to request an out-of-band session refresh
pub trait SessionRefreshTrigger: Send + Sync {
    /// Fire the refresh action. Returns whether the dispatch was accepted;
    /// callers log the outcome and move on either way.
    fn trigger(
        &self,
        customer_id: &str,
    ) -> impl std::future::Future<Output = bool> + Send;
}

/// Dispatches a `refresh-session` repository_dispatch event to GitHub Actions
#[derive(Clone)]
pub struct GithubWorkflowTrigger {
    http: reqwest::Client,
    token: Option<String>,
    /// `owner/repo`
    repo: Option<String>,
}

impl GithubWorkflowTrigger {
    pub fn new(http: reqwest::Client, token: Option<String>, repo: Option<String>) -> Self {
        Self { http, token, repo }
    }

    pub fn from_env(http: reqwest::Client) -> Self {
        Self::new(
            http,
            std::env::var("GITHUB_TOKEN").ok(),
            std::env::var("GITHUB_REPO").ok(),
        )
    }
}

impl SessionRefreshTrigger for GithubWorkflowTrigger {
    async fn trigger(&self, customer_id: &str) -> bool {
        let (Some(token), Some(repo)) = (&self.token, &self.repo) else {
            tracing::error!("GitHub token or repo not configured, cannot trigger session refresh");
            return false;
        };

        let url = format!("https://api.github.com/repos/{}/dispatches", repo);
        let triggered_at = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_default();
        let payload = json!({
            "event_type": "refresh-session",
            "client_payload": {
                "customer_id": customer_id,
                "triggered_at": triggered_at,
            }
        });

        let result = self
            .http
            .post(&url)
            .header(reqwest::header::ACCEPT, "application/vnd.github.v3+json")
            .header(reqwest::header::USER_AGENT, "pinegate")
            .bearer_auth(token)
            .json(&payload)
            .send()
            .await;

        match result {
            // GitHub answers 204 No Content on accepted dispatches
            Ok(response) if response.status().is_success() => {
                tracing::info!(
                    customer_id = %customer_id,
                    "Triggered session refresh workflow"
                );
                true
            }
            Ok(response) => {
                tracing::error!(
                    customer_id = %customer_id,
                    status = %response.status(),
                    "Failed to trigger session refresh workflow"
                );
                false
            }
            Err(e) => {
                tracing::error!(
                    customer_id = %customer_id,
                    error = %e,
                    "Error triggering session refresh workflow"
                );
                false
            }
        }
    }
}
