//! Pinegate provisioning
//!
//! Reconciles Stripe billing lifecycle events into TradingView indicator
//! access grants. The Stripe customer record is the only persistent store;
//! TradingView is write-mostly and only read on demand.

pub mod client;
pub mod customer;
pub mod error;
pub mod notify;
pub mod plans;
pub mod provisioner;
pub mod refresh;
pub mod tradingview;
pub mod webhook;

pub use client::{StripeConfig, StripeGateway};
pub use customer::{CustomerProfile, CustomerService, PlanSnapshot, ProvisioningStatus};
pub use error::{is_session_error_message, ProvisioningError, ProvisioningResult};
pub use notify::OpsNotifier;
pub use plans::{Plan, PlanCache, PlanCatalog, PLAN_CACHE_TTL};
pub use provisioner::{
    resolve_access_months, subscription_price, ProvisionOutcome, ProvisionReason,
    ProvisioningService, DEFAULT_ACCESS_MONTHS,
};
pub use refresh::{GithubWorkflowTrigger, SessionRefreshTrigger};
pub use tradingview::{
    AccessDuration, AccessState, GrantOutcome, GrantStatus, TradingViewClient, TradingViewConfig,
    UsernameValidation,
};
pub use webhook::{verify_signature, WebhookHandler};
