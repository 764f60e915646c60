//! Shared application state

use std::sync::Arc;

use pinegate_provisioning::{
    CustomerService, GithubWorkflowTrigger, OpsNotifier, PlanCache, PlanCatalog,
    ProvisioningService, StripeGateway, TradingViewClient, TradingViewConfig, WebhookHandler,
};

use crate::auth::JwtManager;
use crate::config::Config;

/// The production session-refresh trigger
pub type Trigger = GithubWorkflowTrigger;

/// Shared state handed to every handler
#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub jwt: JwtManager,
    pub stripe: StripeGateway,
    pub customers: CustomerService,
    pub plans: PlanCatalog,
    pub tradingview: TradingViewClient,
    pub provisioner: ProvisioningService<Trigger>,
    pub webhooks: WebhookHandler<Trigger>,
    pub notifier: OpsNotifier,
}

impl AppState {
    /// Wire up all services from the environment
    pub fn from_env(config: Config) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(30))
            .build()?;

        let stripe = StripeGateway::from_env()?;
        let customers = CustomerService::new(stripe.clone());
        let plans = PlanCatalog::new(stripe.clone(), Arc::new(PlanCache::default()));
        let tradingview = TradingViewClient::new(TradingViewConfig::from_env()?)?;

        let trigger = GithubWorkflowTrigger::from_env(http.clone());
        let provisioner = ProvisioningService::new(
            customers.clone(),
            plans.clone(),
            tradingview.clone(),
            trigger,
        );
        let webhooks = WebhookHandler::new(stripe.clone(), provisioner.clone());
        let notifier = OpsNotifier::from_env(http);

        Ok(Self {
            jwt: JwtManager::new(&config.jwt_secret),
            config,
            stripe,
            customers,
            plans,
            tradingview,
            provisioner,
            webhooks,
            notifier,
        })
    }
}
