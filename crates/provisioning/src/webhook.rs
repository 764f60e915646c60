//! Stripe webhook handling
//!
//! Verifies inbound billing events and dispatches them to the provisioning
//! state machine. Verification fails closed: an event is rejected before any
//! side effect when the signature header is absent or wrong.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use stripe::{
    CheckoutSessionMode, Event, EventObject, EventType, Expandable, Invoice,
    InvoiceBillingReason, Subscription, SubscriptionId, SubscriptionStatus, Webhook,
};
use time::OffsetDateTime;

use crate::client::StripeGateway;
use crate::customer::CustomerProfile;
use crate::error::{ProvisioningError, ProvisioningResult};
use crate::plans::Plan;
use crate::provisioner::{subscription_price, ProvisionReason, ProvisioningService};
use crate::refresh::SessionRefreshTrigger;

type HmacSha256 = Hmac<Sha256>;

/// Accepted clock skew between the signature timestamp and now (5 minutes)
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

/// Verify a Stripe signature header (`t=...,v1=...`) against the raw payload.
///
/// This is the manual fallback for API versions newer than what
/// `async-stripe`'s own verifier parses; `now` is passed in so tests control
/// the tolerance window.
pub fn verify_signature(
    payload: &str,
    signature: &str,
    secret: &str,
    now: i64,
) -> ProvisioningResult<()> {
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<String> = None;

    for part in signature.split(',') {
        let kv: Vec<&str> = part.splitn(2, '=').collect();
        if kv.len() == 2 {
            match kv[0] {
                "t" => timestamp = kv[1].parse().ok(),
                "v1" => v1_signature = Some(kv[1].to_string()),
                _ => {}
            }
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        ProvisioningError::WebhookSignatureInvalid
    })?;

    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        ProvisioningError::WebhookSignatureInvalid
    })?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            diff = (now - timestamp).abs(),
            "Webhook timestamp outside tolerance"
        );
        return Err(ProvisioningError::WebhookSignatureInvalid);
    }

    // The secret's "whsec_" prefix is not part of the key material
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{}.{}", timestamp, payload);

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
        tracing::error!("Invalid webhook secret key");
        ProvisioningError::WebhookSignatureInvalid
    })?;
    mac.update(signed_payload.as_bytes());
    let computed = hex::encode(mac.finalize().into_bytes());

    if computed != v1_signature {
        tracing::error!("Webhook signature mismatch");
        return Err(ProvisioningError::WebhookSignatureInvalid);
    }

    Ok(())
}

/// Webhook handler for Stripe billing events
#[derive(Clone)]
pub struct WebhookHandler<R> {
    stripe: StripeGateway,
    provisioner: ProvisioningService<R>,
}

impl<R: SessionRefreshTrigger> WebhookHandler<R> {
    pub fn new(stripe: StripeGateway, provisioner: ProvisioningService<R>) -> Self {
        Self {
            stripe,
            provisioner,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library verifier first, then falls back to manual signature
    /// verification plus a plain serde parse, which tolerates newer Stripe
    /// API versions.
    pub fn verify_event(&self, payload: &str, signature: &str) -> ProvisioningResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::warn!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        let now = OffsetDateTime::now_utc().unix_timestamp();
        verify_signature(payload, signature, webhook_secret, now)?;

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            ProvisioningError::WebhookSignatureInvalid
        })?;

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Manual webhook verification succeeded"
        );

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Provisioning failures are recorded on the customer record inside the
    /// state machine and do NOT bubble up from here; an `Err` means a fault
    /// unrelated to the provisioning outcome (and the event source may
    /// retry it).
    pub async fn handle_event(&self, event: Event) -> ProvisioningResult<()> {
        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        match event.type_ {
            EventType::CheckoutSessionCompleted => self.handle_checkout_completed(event).await,
            EventType::InvoicePaid => self.handle_invoice_paid(event).await,
            EventType::CustomerSubscriptionUpdated => self.handle_subscription_updated(event).await,
            EventType::CustomerSubscriptionDeleted => self.handle_subscription_deleted(event).await,
            _ => {
                // Track which events arrive without a handler; helps spot new
                // event kinds that may need one
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
                Ok(())
            }
        }
    }

    async fn handle_checkout_completed(&self, event: Event) -> ProvisioningResult<()> {
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(ProvisioningError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        if session.mode != CheckoutSessionMode::Subscription {
            tracing::debug!(session_id = %session.id, "Ignoring non-subscription checkout");
            return Ok(());
        }

        let (Some(customer_ref), Some(subscription_ref)) =
            (&session.customer, &session.subscription)
        else {
            tracing::warn!(
                session_id = %session.id,
                "Checkout session completed without customer or subscription"
            );
            return Ok(());
        };

        let customer_id = expandable_id(customer_ref);
        let customer = self.provisioner.customers().retrieve(&customer_id).await?;

        let subscription = self
            .retrieve_subscription(&expandable_id(subscription_ref))
            .await?;
        let plan = self.plan_for_subscription(&subscription).await?;

        if let Some(plan) = &plan {
            self.provisioner
                .customers()
                .write_plan_snapshot(&customer_id, plan)
                .await?;
            tracing::info!(
                customer_id = %customer_id,
                plan_type = %plan.plan_type,
                "Updated customer plan snapshot from checkout"
            );
        }

        self.provision(&customer, plan.as_ref(), ProvisionReason::CheckoutCompleted)
            .await
    }

    async fn handle_invoice_paid(&self, event: Event) -> ProvisioningResult<()> {
        let invoice = self.extract_invoice(event)?;

        // The first invoice is handled by checkout.session.completed; only
        // renewal cycles extend access here.
        let is_renewal = invoice.billing_reason == Some(InvoiceBillingReason::SubscriptionCycle);
        let (Some(customer_ref), Some(_)) = (&invoice.customer, &invoice.subscription) else {
            tracing::debug!(invoice_id = %invoice.id, "Invoice without customer or subscription");
            return Ok(());
        };
        if !is_renewal {
            tracing::debug!(
                invoice_id = %invoice.id,
                billing_reason = ?invoice.billing_reason,
                "Ignoring non-renewal invoice"
            );
            return Ok(());
        }

        let customer_id = expandable_id(customer_ref);
        let customer = self.provisioner.customers().retrieve(&customer_id).await?;

        let subscription_id = invoice
            .subscription
            .as_ref()
            .map(|s| expandable_id(s));
        let plan = match subscription_id {
            Some(subscription_id) => {
                let subscription = self.retrieve_subscription(&subscription_id).await?;
                self.plan_for_subscription(&subscription).await?
            }
            None => None,
        };

        self.provision(&customer, plan.as_ref(), ProvisionReason::RenewalPaid)
            .await
    }

    async fn handle_subscription_updated(&self, event: Event) -> ProvisioningResult<()> {
        let subscription = self.extract_subscription(event)?;
        let customer_id = expandable_id(&subscription.customer);

        if subscription.cancel_at_period_end {
            // Cancellation never revokes: access continues until the granted
            // expiration and lapses on its own.
            tracing::info!(
                subscription_id = %subscription.id,
                customer_id = %customer_id,
                "Subscription set to cancel at period end - access continues until expiration"
            );
        }

        if subscription.status != SubscriptionStatus::Active
            && subscription.status != SubscriptionStatus::Trialing
        {
            tracing::debug!(
                subscription_id = %subscription.id,
                status = ?subscription.status,
                "Ignoring update for inactive subscription"
            );
            return Ok(());
        }

        let Some(plan) = self.plan_for_subscription(&subscription).await? else {
            tracing::debug!(
                subscription_id = %subscription.id,
                "Subscription price does not map to a known plan"
            );
            return Ok(());
        };

        let customer = self.provisioner.customers().retrieve(&customer_id).await?;
        let profile = CustomerProfile::of(&customer);

        let plan_changed = match &profile.plan {
            Some(snapshot) => {
                snapshot.internal_product_id != plan.internal_product_id
                    || snapshot.plan_type != plan.plan_type
            }
            None => true,
        };

        if !plan_changed {
            tracing::debug!(
                customer_id = %customer_id,
                plan_type = %plan.plan_type,
                "Subscription updated without a plan change"
            );
            return Ok(());
        }

        self.provisioner
            .customers()
            .write_plan_snapshot(&customer_id, &plan)
            .await?;
        tracing::info!(
            customer_id = %customer_id,
            plan_type = %plan.plan_type,
            "Updated customer plan snapshot for plan change"
        );

        self.provision(&customer, Some(&plan), ProvisionReason::PlanChanged)
            .await
    }

    async fn handle_subscription_deleted(&self, event: Event) -> ProvisioningResult<()> {
        // Deliberately no revocation: access was granted for the paid period
        // and expires on its own at the granted expiration.
        let subscription = self.extract_subscription(event)?;
        tracing::info!(
            subscription_id = %subscription.id,
            "Subscription deleted - access will expire naturally"
        );
        Ok(())
    }

    /// Run the state machine, tolerating customers that never onboarded
    async fn provision(
        &self,
        customer: &stripe::Customer,
        plan: Option<&Plan>,
        reason: ProvisionReason,
    ) -> ProvisioningResult<()> {
        match self.provisioner.ensure_access(customer, plan, reason).await {
            Ok(outcome) => {
                tracing::info!(
                    customer_id = %customer.id,
                    reason = %reason,
                    status = %outcome.status(),
                    "Provisioning pass finished"
                );
                Ok(())
            }
            Err(ProvisioningError::NeedsOnboarding) => {
                tracing::warn!(
                    customer_id = %customer.id,
                    reason = %reason,
                    "Customer has no TradingView username yet, skipping provisioning"
                );
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    async fn retrieve_subscription(
        &self,
        subscription_id: &str,
    ) -> ProvisioningResult<Subscription> {
        let id = subscription_id.parse::<SubscriptionId>().map_err(|e| {
            ProvisioningError::StripeApi(format!("Invalid subscription ID: {}", e))
        })?;
        Ok(Subscription::retrieve(self.stripe.inner(), &id, &[]).await?)
    }

    async fn plan_for_subscription(
        &self,
        subscription: &Subscription,
    ) -> ProvisioningResult<Option<Plan>> {
        match subscription_price(subscription) {
            Some(price) => self.provisioner.plans().by_price_id(price.id.as_str()).await,
            None => Ok(None),
        }
    }

    fn extract_subscription(&self, event: Event) -> ProvisioningResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(ProvisioningError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    fn extract_invoice(&self, event: Event) -> ProvisioningResult<Invoice> {
        match event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice),
            _ => Err(ProvisioningError::WebhookEventNotSupported(
                "Expected Invoice".to_string(),
            )),
        }
    }
}

/// Extract the id from an expandable reference without fetching it
fn expandable_id<T>(reference: &Expandable<T>) -> String
where
    T: stripe::Object,
    T::Id: std::fmt::Display,
{
    match reference {
        Expandable::Id(id) => id.to_string(),
        Expandable::Object(object) => object.id().to_string(),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret_key_for_unit_tests";

    fn sign(payload: &str, timestamp: i64, secret: &str) -> String {
        let key = secret.strip_prefix("whsec_").unwrap_or(secret);
        let mut mac = HmacSha256::new_from_slice(key.as_bytes()).unwrap();
        mac.update(format!("{}.{}", timestamp, payload).as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_verify_signature_accepts_valid() {
        let payload = r#"{"id":"evt_1","type":"invoice.paid"}"#;
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(payload, now, SECRET));
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }

    #[test]
    fn test_verify_signature_accepts_within_tolerance() {
        let payload = "{}";
        let signed_at = 1_700_000_000;
        let header = format!("t={},v1={}", signed_at, sign(payload, signed_at, SECRET));
        assert!(verify_signature(payload, &header, SECRET, signed_at + 299).is_ok());
    }

    #[test]
    fn test_verify_signature_rejects_stale_timestamp() {
        let payload = "{}";
        let signed_at = 1_700_000_000;
        let header = format!("t={},v1={}", signed_at, sign(payload, signed_at, SECRET));
        assert!(verify_signature(payload, &header, SECRET, signed_at + 301).is_err());
    }

    #[test]
    fn test_verify_signature_rejects_tampered_payload() {
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(r#"{"a":1}"#, now, SECRET));
        assert!(verify_signature(r#"{"a":2}"#, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_verify_signature_rejects_wrong_secret() {
        let payload = "{}";
        let now = 1_700_000_000;
        let header = format!("t={},v1={}", now, sign(payload, now, "whsec_other"));
        assert!(verify_signature(payload, &header, SECRET, now).is_err());
    }

    #[test]
    fn test_verify_signature_rejects_missing_parts() {
        assert!(verify_signature("{}", "v1=abc", SECRET, 0).is_err());
        assert!(verify_signature("{}", "t=123", SECRET, 123).is_err());
        assert!(verify_signature("{}", "", SECRET, 0).is_err());
    }

    #[test]
    fn test_verify_signature_ignores_unknown_scheme_keys() {
        let payload = "{}";
        let now = 1_700_000_000;
        let header = format!(
            "t={},v0=ignored,v1={}",
            now,
            sign(payload, now, SECRET)
        );
        assert!(verify_signature(payload, &header, SECRET, now).is_ok());
    }
}
