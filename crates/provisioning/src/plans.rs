//! Plan catalog
//!
//! Plans are not persisted anywhere: the Stripe price/product catalog is the
//! source of truth, read through a short-lived in-memory snapshot. Product
//! metadata carries the provisioning attributes (`plan_type`,
//! `access_duration_months`, `bonus_months`, `features`,
//! `internal_product_id`).

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use stripe::{Expandable, Price, PriceId, Recurring, RecurringInterval};
use time::{Duration, OffsetDateTime};

use crate::client::StripeGateway;
use crate::error::{ProvisioningError, ProvisioningResult};

/// How long a fetched catalog snapshot stays valid
pub const PLAN_CACHE_TTL: Duration = Duration::minutes(5);

/// A sellable plan, derived from a Stripe price and its product metadata
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    /// Stable plan identifier (`plan_id` product metadata, else the price id)
    pub id: String,
    pub price_id: String,
    pub name: String,
    pub description: String,
    /// Display price in major currency units
    pub price: f64,
    pub currency: String,
    /// Human-readable billing interval ("year", "6 months", ...)
    pub interval: String,
    pub plan_type: String,
    pub access_duration_months: u32,
    pub bonus_months: u32,
    pub internal_product_id: String,
    pub features: Vec<String>,
}

impl Plan {
    pub fn total_access_months(&self) -> u32 {
        self.access_duration_months + self.bonus_months
    }
}

/// Timestamped catalog snapshot with a TTL.
///
/// The clock is passed in by callers rather than read internally, so tests
/// control expiry; the catalog service passes `OffsetDateTime::now_utc()`.
pub struct PlanCache {
    ttl: Duration,
    inner: Mutex<Option<Snapshot>>,
}

struct Snapshot {
    plans: Vec<Plan>,
    fetched_at: OffsetDateTime,
}

impl PlanCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            inner: Mutex::new(None),
        }
    }

    /// The snapshot, if one exists and has not expired at `now`
    pub fn get(&self, now: OffsetDateTime) -> Option<Vec<Plan>> {
        let guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .as_ref()
            .filter(|snapshot| now - snapshot.fetched_at < self.ttl)
            .map(|snapshot| snapshot.plans.clone())
    }

    /// Replace the snapshot
    pub fn store(&self, plans: Vec<Plan>, now: OffsetDateTime) {
        let mut guard = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some(Snapshot {
            plans,
            fetched_at: now,
        });
    }
}

impl Default for PlanCache {
    fn default() -> Self {
        Self::new(PLAN_CACHE_TTL)
    }
}

/// Read-through plan resolver over the Stripe catalog
#[derive(Clone)]
pub struct PlanCatalog {
    stripe: StripeGateway,
    cache: Arc<PlanCache>,
}

impl PlanCatalog {
    pub fn new(stripe: StripeGateway, cache: Arc<PlanCache>) -> Self {
        Self { stripe, cache }
    }

    /// All configured plans, in display order.
    ///
    /// Individual price fetch failures are logged and skipped so one broken
    /// catalog entry does not take the listing down.
    pub async fn all(&self) -> ProvisioningResult<Vec<Plan>> {
        let now = OffsetDateTime::now_utc();
        if let Some(plans) = self.cache.get(now) {
            return Ok(plans);
        }

        let mut plans = Vec::new();
        for price_id in &self.stripe.config().plan_price_ids {
            match self.fetch_plan(price_id).await {
                Ok(plan) => plans.push(plan),
                Err(e) => {
                    tracing::error!(
                        price_id = %price_id,
                        error = %e,
                        "Failed to fetch plan from Stripe"
                    );
                }
            }
        }

        self.cache.store(plans.clone(), OffsetDateTime::now_utc());
        Ok(plans)
    }

    /// Look up a plan by its Stripe price id; unknown ids are `None`
    pub async fn by_price_id(&self, price_id: &str) -> ProvisioningResult<Option<Plan>> {
        let plans = self.all().await?;
        Ok(plans.into_iter().find(|p| p.price_id == price_id))
    }

    /// Look up a plan by its stable plan id; unknown ids are `None`
    pub async fn by_plan_id(&self, plan_id: &str) -> ProvisioningResult<Option<Plan>> {
        let plans = self.all().await?;
        Ok(plans.into_iter().find(|p| p.id == plan_id))
    }

    async fn fetch_plan(&self, price_id: &str) -> ProvisioningResult<Plan> {
        let id = price_id
            .parse::<PriceId>()
            .map_err(|e| ProvisioningError::StripeApi(format!("Invalid price ID: {}", e)))?;

        let price = Price::retrieve(self.stripe.inner(), &id, &["product"]).await?;

        let product = match &price.product {
            Some(Expandable::Object(product)) => Some(product.as_ref()),
            _ => None,
        };
        let metadata = product
            .and_then(|p| p.metadata.clone())
            .unwrap_or_default();

        let parse_months = |key: &str| {
            metadata
                .get(key)
                .and_then(|v| v.parse::<u32>().ok())
                .unwrap_or(0)
        };
        let features = metadata
            .get("features")
            .and_then(|raw| serde_json::from_str::<Vec<String>>(raw).ok())
            .unwrap_or_default();

        Ok(Plan {
            id: metadata
                .get("plan_id")
                .cloned()
                .unwrap_or_else(|| price_id.to_string()),
            price_id: price_id.to_string(),
            name: product
                .and_then(|p| p.name.clone())
                .unwrap_or_else(|| "Plan".to_string()),
            description: product.and_then(|p| p.description.clone()).unwrap_or_default(),
            price: price.unit_amount.map(|a| a as f64 / 100.0).unwrap_or(0.0),
            currency: price
                .currency
                .map(|c| c.to_string())
                .unwrap_or_else(|| "usd".to_string()),
            interval: interval_label(price.recurring.as_ref()),
            plan_type: metadata.get("plan_type").cloned().unwrap_or_default(),
            access_duration_months: parse_months("access_duration_months"),
            bonus_months: parse_months("bonus_months"),
            internal_product_id: metadata
                .get("internal_product_id")
                .cloned()
                .unwrap_or_default(),
            features,
        })
    }
}

/// Display label for a recurring interval
pub fn interval_label(recurring: Option<&Recurring>) -> String {
    match recurring {
        Some(r) if r.interval == RecurringInterval::Year => "year".to_string(),
        Some(r) if r.interval == RecurringInterval::Month && r.interval_count == 6 => {
            "6 months".to_string()
        }
        Some(r) if r.interval == RecurringInterval::Month && r.interval_count > 1 => {
            format!("{} months", r.interval_count)
        }
        Some(r) if r.interval == RecurringInterval::Month => "month".to_string(),
        Some(r) if r.interval == RecurringInterval::Week => "week".to_string(),
        Some(r) if r.interval == RecurringInterval::Day => "day".to_string(),
        _ => "month".to_string(),
    }
}

/// Derive access months from a price's recurring metadata.
///
/// Used when the catalog entry yields zero months; a weekly price still maps
/// to at least one month because grants are extended in whole months.
pub fn months_from_recurring(recurring: &Recurring) -> u32 {
    let count = recurring.interval_count as u32;
    match recurring.interval {
        RecurringInterval::Year => 12 * count.max(1),
        RecurringInterval::Month => count.max(1),
        RecurringInterval::Week => (count / 4).max(1),
        RecurringInterval::Day => 1,
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use time::macros::datetime;

    fn plan(price_id: &str) -> Plan {
        Plan {
            id: format!("plan_{}", price_id),
            price_id: price_id.to_string(),
            name: "Annual".to_string(),
            description: String::new(),
            price: 299.0,
            currency: "usd".to_string(),
            interval: "year".to_string(),
            plan_type: "annual".to_string(),
            access_duration_months: 12,
            bonus_months: 6,
            internal_product_id: "sn_vision".to_string(),
            features: vec!["indicator".to_string()],
        }
    }

    #[test]
    fn test_cache_hit_within_ttl() {
        let cache = PlanCache::new(Duration::minutes(5));
        let t0 = datetime!(2025-06-01 12:00 UTC);
        cache.store(vec![plan("price_a")], t0);

        let hit = cache.get(t0 + Duration::minutes(4)).unwrap();
        assert_eq!(hit.len(), 1);
        assert_eq!(hit[0].price_id, "price_a");
    }

    #[test]
    fn test_cache_expires_after_ttl() {
        let cache = PlanCache::new(Duration::minutes(5));
        let t0 = datetime!(2025-06-01 12:00 UTC);
        cache.store(vec![plan("price_a")], t0);

        assert!(cache.get(t0 + Duration::minutes(5)).is_none());
        assert!(cache.get(t0 + Duration::hours(1)).is_none());
    }

    #[test]
    fn test_cache_starts_empty() {
        let cache = PlanCache::default();
        assert!(cache.get(OffsetDateTime::now_utc()).is_none());
    }

    #[test]
    fn test_total_access_months() {
        assert_eq!(plan("price_a").total_access_months(), 18);
    }

    fn recurring(interval: &str, interval_count: u64) -> Recurring {
        serde_json::from_value(serde_json::json!({
            "interval": interval,
            "interval_count": interval_count,
            "usage_type": "licensed",
        }))
        .unwrap()
    }

    #[test]
    fn test_months_from_recurring() {
        assert_eq!(months_from_recurring(&recurring("year", 1)), 12);
        assert_eq!(months_from_recurring(&recurring("month", 6)), 6);
        assert_eq!(months_from_recurring(&recurring("week", 2)), 1);
        assert_eq!(months_from_recurring(&recurring("day", 30)), 1);
    }

    #[test]
    fn test_interval_label() {
        assert_eq!(interval_label(Some(&recurring("year", 1))), "year");
        assert_eq!(interval_label(Some(&recurring("month", 6))), "6 months");
        assert_eq!(interval_label(Some(&recurring("month", 1))), "month");
        assert_eq!(interval_label(None), "month");
    }
}
