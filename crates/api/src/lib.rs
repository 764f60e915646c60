//! Pinegate API
//!
//! HTTP surface over the provisioning core: Stripe webhook ingestion,
//! user-facing subscription and TradingView endpoints, operator retry, and
//! health probes.

pub mod auth;
pub mod config;
pub mod error;
pub mod routes;
pub mod state;

pub use config::Config;
pub use error::{ApiError, ApiResult};
pub use state::AppState;
