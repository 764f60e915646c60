//! Stripe customer records and the typed metadata boundary
//!
//! The Stripe customer is the only persistent store this service has. All
//! provisioning state lives in the customer's metadata string map; this
//! module is the one place that knows the external key names, so the
//! stringly-typed shape never leaks into the rest of the crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use stripe::{
    CreateCustomer, Customer, CustomerId, ListCustomers, ListSubscriptions, Metadata,
    Subscription, SubscriptionStatus, UpdateCustomer,
};

use crate::client::StripeGateway;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::plans::Plan;

// External metadata keys. These are stable for backward compatibility with
// already-stored customers; do not rename.
const KEY_USERNAME: &str = "tradingview_username";
const KEY_USERNAME_LEGACY: &str = "tradingViewUsername";
const KEY_STATUS: &str = "provisioning_status";
const KEY_LAST_ERROR: &str = "last_error";
const KEY_PLAN_TYPE: &str = "plan_type";
const KEY_DURATION_MONTHS: &str = "access_duration_months";
const KEY_BONUS_MONTHS: &str = "bonus_months";
const KEY_TOTAL_MONTHS: &str = "total_access_months";
const KEY_INTERNAL_PRODUCT: &str = "internal_product_id";

/// Provisioning status stored on the customer record.
///
/// Only the provisioning state machine writes this field; it is never
/// inferred from TradingView, which is treated as write-mostly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStatus {
    None,
    Incomplete,
    Pending,
    Complete,
    Failed,
    RetryPending,
}

impl ProvisioningStatus {
    /// Parse the stored metadata value; absent or unknown values read as `None`.
    pub fn parse(value: Option<&str>) -> Self {
        match value {
            Some("incomplete") => ProvisioningStatus::Incomplete,
            Some("pending") => ProvisioningStatus::Pending,
            Some("complete") => ProvisioningStatus::Complete,
            Some("failed") => ProvisioningStatus::Failed,
            Some("retry_pending") => ProvisioningStatus::RetryPending,
            _ => ProvisioningStatus::None,
        }
    }
}

impl Default for ProvisioningStatus {
    fn default() -> Self {
        ProvisioningStatus::None
    }
}

impl std::fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisioningStatus::None => "none",
            ProvisioningStatus::Incomplete => "incomplete",
            ProvisioningStatus::Pending => "pending",
            ProvisioningStatus::Complete => "complete",
            ProvisioningStatus::Failed => "failed",
            ProvisioningStatus::RetryPending => "retry_pending",
        };
        write!(f, "{}", s)
    }
}

/// Denormalized snapshot of the plan active at the last provisioning event.
///
/// Used for display and as a fallback when the live plan lookup fails.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanSnapshot {
    pub plan_type: String,
    pub access_duration_months: u32,
    pub bonus_months: u32,
    pub total_access_months: u32,
    pub internal_product_id: String,
}

impl PlanSnapshot {
    pub fn from_plan(plan: &Plan) -> Self {
        Self {
            plan_type: plan.plan_type.clone(),
            access_duration_months: plan.access_duration_months,
            bonus_months: plan.bonus_months,
            total_access_months: plan.total_access_months(),
            internal_product_id: plan.internal_product_id.clone(),
        }
    }
}

/// Typed view over a customer's metadata map.
#[derive(Debug, Clone, Default)]
pub struct CustomerProfile {
    pub tradingview_username: Option<String>,
    /// Set when the username was found only under the legacy camelCase key
    /// and should be migrated to the canonical key on the next write.
    pub username_from_legacy_key: bool,
    pub provisioning_status: ProvisioningStatus,
    pub last_error: Option<String>,
    pub plan: Option<PlanSnapshot>,
}

impl CustomerProfile {
    /// Deserialize from the external string map.
    ///
    /// Reads both username spellings; a value present only under the legacy
    /// key is reconciled into `tradingview_username`, never dropped.
    pub fn from_metadata(metadata: &Metadata) -> Self {
        let non_empty = |key: &str| {
            metadata
                .get(key)
                .map(|s| s.trim())
                .filter(|s| !s.is_empty())
                .map(|s| s.to_string())
        };

        let canonical = non_empty(KEY_USERNAME);
        let legacy = non_empty(KEY_USERNAME_LEGACY);
        let username_from_legacy_key = canonical.is_none() && legacy.is_some();
        let tradingview_username = canonical.or(legacy);

        let parse_months = |key: &str| {
            non_empty(key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };

        let plan = non_empty(KEY_PLAN_TYPE).map(|plan_type| PlanSnapshot {
            plan_type,
            access_duration_months: parse_months(KEY_DURATION_MONTHS),
            bonus_months: parse_months(KEY_BONUS_MONTHS),
            total_access_months: parse_months(KEY_TOTAL_MONTHS),
            internal_product_id: non_empty(KEY_INTERNAL_PRODUCT).unwrap_or_default(),
        });

        Self {
            tradingview_username,
            username_from_legacy_key,
            provisioning_status: ProvisioningStatus::parse(
                metadata.get(KEY_STATUS).map(String::as_str),
            ),
            last_error: non_empty(KEY_LAST_ERROR),
            plan,
        }
    }

    /// Read the profile off a customer, tolerating the metadata being absent
    /// (deleted customers come back without one).
    pub fn of(customer: &Customer) -> Self {
        customer
            .metadata
            .as_ref()
            .map(Self::from_metadata)
            .unwrap_or_default()
    }

    /// Serialize to the external string map.
    ///
    /// Only canonical keys are emitted. When the source carried the legacy
    /// username spelling, the legacy key is written as an empty string, which
    /// Stripe treats as a key deletion.
    pub fn to_metadata(&self) -> Metadata {
        let mut metadata = HashMap::new();
        if let Some(username) = &self.tradingview_username {
            metadata.insert(KEY_USERNAME.to_string(), username.clone());
        }
        if self.username_from_legacy_key {
            metadata.insert(KEY_USERNAME_LEGACY.to_string(), String::new());
        }
        metadata.insert(KEY_STATUS.to_string(), self.provisioning_status.to_string());
        metadata.insert(
            KEY_LAST_ERROR.to_string(),
            self.last_error.clone().unwrap_or_default(),
        );
        if let Some(plan) = &self.plan {
            metadata.insert(KEY_PLAN_TYPE.to_string(), plan.plan_type.clone());
            metadata.insert(
                KEY_DURATION_MONTHS.to_string(),
                plan.access_duration_months.to_string(),
            );
            metadata.insert(KEY_BONUS_MONTHS.to_string(), plan.bonus_months.to_string());
            metadata.insert(
                KEY_TOTAL_MONTHS.to_string(),
                plan.total_access_months.to_string(),
            );
            metadata.insert(
                KEY_INTERNAL_PRODUCT.to_string(),
                plan.internal_product_id.clone(),
            );
        }
        metadata
    }
}

/// Customer service over the Stripe customer store
#[derive(Clone)]
pub struct CustomerService {
    stripe: StripeGateway,
}

impl CustomerService {
    pub fn new(stripe: StripeGateway) -> Self {
        Self { stripe }
    }

    /// Find a customer by email
    pub async fn find_by_email(&self, email: &str) -> ProvisioningResult<Option<Customer>> {
        let params = ListCustomers {
            email: Some(email),
            limit: Some(1),
            ..Default::default()
        };
        let customers = Customer::list(self.stripe.inner(), &params).await?;
        Ok(customers.data.into_iter().next())
    }

    /// Find a customer by email, creating one if none exists
    pub async fn get_or_create(&self, email: &str) -> ProvisioningResult<Customer> {
        if let Some(customer) = self.find_by_email(email).await? {
            return Ok(customer);
        }

        let params = CreateCustomer {
            email: Some(email),
            ..Default::default()
        };
        let customer = Customer::create(self.stripe.inner(), params).await?;

        tracing::info!(customer_id = %customer.id, "Created Stripe customer");

        Ok(customer)
    }

    /// Retrieve a customer by id; deleted customers surface as not found
    pub async fn retrieve(&self, customer_id: &str) -> ProvisioningResult<Customer> {
        let id = parse_customer_id(customer_id)?;
        let customer = Customer::retrieve(self.stripe.inner(), &id, &[]).await?;
        if customer.deleted {
            return Err(ProvisioningError::CustomerNotFound(customer_id.to_string()));
        }
        Ok(customer)
    }

    /// Merge metadata keys onto the customer record.
    ///
    /// Stripe merges metadata on update and deletes keys written as empty
    /// strings, so callers only pass the keys they mean to change.
    pub async fn merge_metadata(
        &self,
        customer_id: &str,
        metadata: Metadata,
    ) -> ProvisioningResult<()> {
        let id = parse_customer_id(customer_id)?;
        let params = UpdateCustomer {
            metadata: Some(metadata),
            ..Default::default()
        };
        Customer::update(self.stripe.inner(), &id, params).await?;
        Ok(())
    }

    /// Store a verified TradingView username under the canonical key.
    ///
    /// Also clears the legacy camelCase key when the record still carries it,
    /// so subsequent reads see exactly one spelling.
    pub async fn set_username(
        &self,
        customer: &Customer,
        verified_username: &str,
    ) -> ProvisioningResult<()> {
        let mut metadata = HashMap::new();
        metadata.insert(KEY_USERNAME.to_string(), verified_username.to_string());

        let had_legacy = customer
            .metadata
            .as_ref()
            .and_then(|m| m.get(KEY_USERNAME_LEGACY))
            .is_some_and(|v| !v.is_empty());
        if had_legacy {
            metadata.insert(KEY_USERNAME_LEGACY.to_string(), String::new());
        }

        self.merge_metadata(customer.id.as_str(), metadata).await?;

        tracing::info!(
            customer_id = %customer.id,
            username = %verified_username,
            migrated_legacy_key = had_legacy,
            "Stored TradingView username"
        );

        Ok(())
    }

    /// Write the provisioning status
    pub async fn set_provisioning_status(
        &self,
        customer_id: &str,
        status: ProvisioningStatus,
    ) -> ProvisioningResult<()> {
        let mut metadata = HashMap::new();
        metadata.insert(KEY_STATUS.to_string(), status.to_string());
        self.merge_metadata(customer_id, metadata).await
    }

    /// Mark provisioning complete and clear the last recorded error
    pub async fn record_success(&self, customer_id: &str) -> ProvisioningResult<()> {
        let mut metadata = HashMap::new();
        metadata.insert(
            KEY_STATUS.to_string(),
            ProvisioningStatus::Complete.to_string(),
        );
        metadata.insert(KEY_LAST_ERROR.to_string(), String::new());
        self.merge_metadata(customer_id, metadata).await
    }

    /// Record a provisioning failure with its error message
    pub async fn record_failure(
        &self,
        customer_id: &str,
        status: ProvisioningStatus,
        error: &str,
    ) -> ProvisioningResult<()> {
        let mut metadata = HashMap::new();
        metadata.insert(KEY_STATUS.to_string(), status.to_string());
        // Stripe caps metadata values at 500 characters
        let truncated: String = error.chars().take(480).collect();
        metadata.insert(KEY_LAST_ERROR.to_string(), truncated);
        self.merge_metadata(customer_id, metadata).await
    }

    /// Write the denormalized plan snapshot
    pub async fn write_plan_snapshot(
        &self,
        customer_id: &str,
        plan: &Plan,
    ) -> ProvisioningResult<()> {
        let snapshot = PlanSnapshot::from_plan(plan);
        let mut metadata = HashMap::new();
        metadata.insert(KEY_PLAN_TYPE.to_string(), snapshot.plan_type);
        metadata.insert(
            KEY_DURATION_MONTHS.to_string(),
            snapshot.access_duration_months.to_string(),
        );
        metadata.insert(
            KEY_BONUS_MONTHS.to_string(),
            snapshot.bonus_months.to_string(),
        );
        metadata.insert(
            KEY_TOTAL_MONTHS.to_string(),
            snapshot.total_access_months.to_string(),
        );
        metadata.insert(
            KEY_INTERNAL_PRODUCT.to_string(),
            snapshot.internal_product_id,
        );
        self.merge_metadata(customer_id, metadata).await
    }

    /// Get the customer's active (or trialing) subscription, if any
    pub async fn active_subscription(
        &self,
        customer_id: &str,
    ) -> ProvisioningResult<Option<Subscription>> {
        let id = parse_customer_id(customer_id)?;
        let params = ListSubscriptions {
            customer: Some(id),
            ..Default::default()
        };
        let mut subscriptions = Subscription::list(self.stripe.inner(), &params).await?;

        let active = subscriptions
            .data
            .iter()
            .position(|s| s.status == SubscriptionStatus::Active)
            .or_else(|| {
                subscriptions
                    .data
                    .iter()
                    .position(|s| s.status == SubscriptionStatus::Trialing)
            });

        Ok(active.map(|i| subscriptions.data.swap_remove(i)))
    }
}

fn parse_customer_id(customer_id: &str) -> ProvisioningResult<CustomerId> {
    customer_id
        .parse::<CustomerId>()
        .map_err(|e| ProvisioningError::StripeApi(format!("Invalid customer ID: {}", e)))
}
