//! Provisioning state machine
//!
//! Reconciles billing entitlement into an actual TradingView grant. The
//! status lifecycle persisted on the customer record:
//!
//! `none`/`incomplete` -> `pending` -> `complete` | `failed`, where `failed`
//! is retried (never terminal) and a session-shaped failure additionally
//! lands on `retry_pending` after firing the out-of-band session refresh.
//!
//! The status is written to the customer record BEFORE the TradingView call,
//! so a crash mid-call leaves an observable non-terminal state.

use stripe::{Customer, Recurring, Subscription};

use crate::customer::{CustomerProfile, CustomerService, PlanSnapshot, ProvisioningStatus};
use crate::error::{is_session_error_message, ProvisioningError, ProvisioningResult};
use crate::plans::{months_from_recurring, Plan, PlanCatalog};
use crate::refresh::SessionRefreshTrigger;
use crate::tradingview::{AccessDuration, GrantOutcome, TradingViewClient};

/// Access months used when no plan, price, or interval information resolves
pub const DEFAULT_ACCESS_MONTHS: u32 = 6;

/// Why provisioning is being attempted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProvisionReason {
    /// A subscription-mode checkout just completed
    CheckoutCompleted,
    /// A renewal invoice was paid (`billing_reason = subscription_cycle`)
    RenewalPaid,
    /// The subscription's price changed while active
    PlanChanged,
    /// A user- or operator-forced re-attempt; never short-circuits
    ManualRefresh,
    /// Post-checkout polling; short-circuits when already complete
    StatusCheck,
}

impl std::fmt::Display for ProvisionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ProvisionReason::CheckoutCompleted => "checkout_completed",
            ProvisionReason::RenewalPaid => "renewal_paid",
            ProvisionReason::PlanChanged => "plan_changed",
            ProvisionReason::ManualRefresh => "manual_refresh",
            ProvisionReason::StatusCheck => "status_check",
        };
        write!(f, "{}", s)
    }
}

/// Result of one provisioning pass
#[derive(Debug, Clone)]
pub enum ProvisionOutcome {
    /// Status was already `complete`; no TradingView call was made
    AlreadyProvisioned,
    /// All indicators granted (or lifetime, left untouched)
    Granted {
        username: String,
        duration: AccessDuration,
        outcomes: Vec<GrantOutcome>,
    },
    /// At least one indicator failed; status and error were persisted
    Failed {
        status: ProvisioningStatus,
        error: String,
        outcomes: Vec<GrantOutcome>,
    },
}

impl ProvisionOutcome {
    pub fn status(&self) -> ProvisioningStatus {
        match self {
            ProvisionOutcome::AlreadyProvisioned | ProvisionOutcome::Granted { .. } => {
                ProvisioningStatus::Complete
            }
            ProvisionOutcome::Failed { status, .. } => *status,
        }
    }
}

/// Resolve the applicable access duration in months.
///
/// Order: explicit plan, then the plan resolved from the subscription price,
/// then the price's recurring interval, then the snapshot stored on the
/// customer, then the hardcoded default. Always at least one month.
pub fn resolve_access_months(
    explicit_plan: Option<&Plan>,
    resolved_plan: Option<&Plan>,
    recurring: Option<&Recurring>,
    snapshot: Option<&PlanSnapshot>,
) -> u32 {
    let months = explicit_plan
        .map(Plan::total_access_months)
        .filter(|&m| m > 0)
        .or_else(|| {
            resolved_plan
                .map(Plan::total_access_months)
                .filter(|&m| m > 0)
        })
        .or_else(|| recurring.map(months_from_recurring))
        .or_else(|| {
            snapshot
                .map(|s| s.total_access_months)
                .filter(|&m| m > 0)
        })
        .unwrap_or(DEFAULT_ACCESS_MONTHS);
    months.max(1)
}

/// One line per failed indicator, for `last_error`
pub fn summarize_failures(outcomes: &[GrantOutcome]) -> Option<String> {
    let failures: Vec<String> = outcomes
        .iter()
        .filter(|o| o.failed())
        .map(|o| {
            format!(
                "{}: {}",
                o.pine_id,
                o.error.as_deref().unwrap_or("unknown error")
            )
        })
        .collect();
    if failures.is_empty() {
        None
    } else {
        Some(failures.join("; "))
    }
}

/// The provisioning state machine
#[derive(Clone)]
pub struct ProvisioningService<R> {
    customers: CustomerService,
    plans: PlanCatalog,
    tradingview: TradingViewClient,
    refresh_trigger: R,
}

impl<R: SessionRefreshTrigger> ProvisioningService<R> {
    pub fn new(
        customers: CustomerService,
        plans: PlanCatalog,
        tradingview: TradingViewClient,
        refresh_trigger: R,
    ) -> Self {
        Self {
            customers,
            plans,
            tradingview,
            refresh_trigger,
        }
    }

    pub fn customers(&self) -> &CustomerService {
        &self.customers
    }

    pub fn plans(&self) -> &PlanCatalog {
        &self.plans
    }

    pub fn tradingview(&self) -> &TradingViewClient {
        &self.tradingview
    }

    /// Run one provisioning pass for the customer.
    ///
    /// TradingView failures are recorded into the provisioning status and
    /// returned as `ProvisionOutcome::Failed`, not as errors; `Err` is
    /// reserved for missing onboarding and for faults talking to Stripe.
    pub async fn ensure_access(
        &self,
        customer: &Customer,
        explicit_plan: Option<&Plan>,
        reason: ProvisionReason,
    ) -> ProvisioningResult<ProvisionOutcome> {
        let profile = CustomerProfile::of(customer);
        let customer_id = customer.id.as_str();

        let Some(username) = profile.tradingview_username.clone() else {
            tracing::warn!(
                customer_id = %customer_id,
                reason = %reason,
                "Provisioning requested but no TradingView username stored"
            );
            return Err(ProvisioningError::NeedsOnboarding);
        };

        if reason == ProvisionReason::StatusCheck
            && profile.provisioning_status == ProvisioningStatus::Complete
        {
            tracing::debug!(
                customer_id = %customer_id,
                "Already provisioned, skipping grant"
            );
            return Ok(ProvisionOutcome::AlreadyProvisioned);
        }

        let months = self
            .applicable_months(customer_id, &profile, explicit_plan)
            .await?;

        self.customers
            .set_provisioning_status(customer_id, ProvisioningStatus::Pending)
            .await?;

        let duration = AccessDuration::months(months);
        let grant_result = self.tradingview.grant_access(&username, &duration).await;

        let (outcomes, error) = match grant_result {
            Ok(outcomes) => {
                let error = summarize_failures(&outcomes);
                (outcomes, error)
            }
            Err(e) => (Vec::new(), Some(e.to_string())),
        };

        match error {
            None => {
                self.customers.record_success(customer_id).await?;
                tracing::info!(
                    customer_id = %customer_id,
                    username = %username,
                    duration = %duration,
                    reason = %reason,
                    "Granted TradingView access"
                );
                Ok(ProvisionOutcome::Granted {
                    username,
                    duration,
                    outcomes,
                })
            }
            Some(error) => {
                let session_shaped = is_session_error_message(&error);
                let status = if session_shaped {
                    ProvisioningStatus::RetryPending
                } else {
                    ProvisioningStatus::Failed
                };

                self.customers
                    .record_failure(customer_id, status, &error)
                    .await?;

                tracing::error!(
                    customer_id = %customer_id,
                    username = %username,
                    reason = %reason,
                    session_error = session_shaped,
                    error = %error,
                    "Failed to grant TradingView access"
                );

                if session_shaped {
                    // Best-effort: the trigger's own failure is logged by the
                    // implementation and never changes the reported outcome.
                    let triggered = self.refresh_trigger.trigger(customer_id).await;
                    tracing::info!(
                        customer_id = %customer_id,
                        triggered = triggered,
                        "Session refresh trigger fired"
                    );
                }

                Ok(ProvisionOutcome::Failed {
                    status,
                    error,
                    outcomes,
                })
            }
        }
    }

    /// Resolve the duration for this pass, fetching the active subscription
    /// only when the explicit plan does not already answer the question.
    async fn applicable_months(
        &self,
        customer_id: &str,
        profile: &CustomerProfile,
        explicit_plan: Option<&Plan>,
    ) -> ProvisioningResult<u32> {
        if let Some(months) = explicit_plan
            .map(Plan::total_access_months)
            .filter(|&m| m > 0)
        {
            return Ok(months.max(1));
        }

        let subscription = self.customers.active_subscription(customer_id).await?;
        let price = subscription.as_ref().and_then(subscription_price);

        let resolved_plan = match price {
            Some(price) => self.plans.by_price_id(price.id.as_str()).await?,
            None => None,
        };
        let recurring = price.and_then(|p| p.recurring.as_ref());

        Ok(resolve_access_months(
            explicit_plan,
            resolved_plan.as_ref(),
            recurring,
            profile.plan.as_ref(),
        ))
    }
}

/// First price on the subscription, if any
pub fn subscription_price(subscription: &Subscription) -> Option<&stripe::Price> {
    subscription
        .items
        .data
        .first()
        .and_then(|item| item.price.as_ref())
}
