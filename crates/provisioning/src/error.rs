//! Provisioning error types

use thiserror::Error;

/// Provisioning-specific errors
#[derive(Debug, Error)]
pub enum ProvisioningError {
    #[error("Stripe API error: {0}")]
    StripeApi(String),

    #[error("Customer not found: {0}")]
    CustomerNotFound(String),

    #[error("No TradingView username on customer record")]
    NeedsOnboarding,

    #[error("Webhook signature verification failed")]
    WebhookSignatureInvalid,

    #[error("Webhook event type not supported: {0}")]
    WebhookEventNotSupported(String),

    #[error("TradingView API error: {0}")]
    ExternalService(String),

    #[error("Invalid access duration: {0}")]
    InvalidDuration(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl ProvisioningError {
    /// True when the error text points at an expired or rejected TradingView
    /// session rather than a per-indicator failure.
    pub fn is_session_error(&self) -> bool {
        is_session_error_message(&self.to_string())
    }
}

/// Session-error heuristic over an error message.
///
/// Matched on text because the upstream surfaces everything as opaque HTTP
/// errors; a hit means the shared session cookie needs a refresh, not that
/// the individual grant was rejected.
pub fn is_session_error_message(message: &str) -> bool {
    let msg = message.to_lowercase();
    msg.contains("session")
        || msg.contains("401")
        || msg.contains("403")
        || msg.contains("unauthorized")
}

impl From<stripe::StripeError> for ProvisioningError {
    fn from(err: stripe::StripeError) -> Self {
        ProvisioningError::StripeApi(err.to_string())
    }
}

impl From<reqwest::Error> for ProvisioningError {
    fn from(err: reqwest::Error) -> Self {
        ProvisioningError::ExternalService(err.to_string())
    }
}

pub type ProvisioningResult<T> = Result<T, ProvisioningError>;
