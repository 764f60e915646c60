//! Stripe client configuration

use stripe::Client;

use crate::error::{ProvisioningError, ProvisioningResult};

/// Configuration for the Stripe side of provisioning
#[derive(Debug, Clone)]
pub struct StripeConfig {
    /// Stripe secret API key
    pub secret_key: String,
    /// Stripe webhook signing secret
    pub webhook_secret: String,
    /// Price IDs of the sellable plans, in display order
    pub plan_price_ids: Vec<String>,
    /// Base URL for checkout success/cancel redirects
    pub app_base_url: String,
}

impl StripeConfig {
    /// Create config from environment variables
    pub fn from_env() -> ProvisioningResult<Self> {
        Ok(Self {
            secret_key: std::env::var("STRIPE_SECRET_KEY")
                .map_err(|_| ProvisioningError::Config("STRIPE_SECRET_KEY not set".to_string()))?,
            webhook_secret: std::env::var("STRIPE_WEBHOOK_SECRET").map_err(|_| {
                ProvisioningError::Config("STRIPE_WEBHOOK_SECRET not set".to_string())
            })?,
            plan_price_ids: std::env::var("STRIPE_PLAN_PRICE_IDS")
                .map_err(|_| {
                    ProvisioningError::Config("STRIPE_PLAN_PRICE_IDS not set".to_string())
                })?
                .split(',')
                .map(|s| s.trim().to_string())
                .filter(|s| !s.is_empty())
                .collect(),
            app_base_url: std::env::var("APP_BASE_URL")
                .unwrap_or_else(|_| "http://localhost:3000".to_string()),
        })
    }
}

/// Stripe gateway shared by the provisioning services
#[derive(Clone)]
pub struct StripeGateway {
    client: Client,
    config: StripeConfig,
}

impl StripeGateway {
    /// Create a new gateway from config
    pub fn new(config: StripeConfig) -> Self {
        let client = Client::new(&config.secret_key);
        Self { client, config }
    }

    /// Create a new gateway from environment variables
    pub fn from_env() -> ProvisioningResult<Self> {
        let config = StripeConfig::from_env()?;
        Ok(Self::new(config))
    }

    /// Create a gateway against an alternate API base (stripe-mock, tests)
    pub fn with_base_url(config: StripeConfig, api_base: &str) -> Self {
        let client = Client::from_url(api_base, &config.secret_key);
        Self { client, config }
    }

    /// Get the inner Stripe client
    pub fn inner(&self) -> &Client {
        &self.client
    }

    /// Get the config
    pub fn config(&self) -> &StripeConfig {
        &self.config
    }
}
