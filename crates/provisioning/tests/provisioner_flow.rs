//! Provisioning state machine tests
//!
//! Drives `ensure_access` against mocked Stripe and TradingView servers and
//! asserts the status transitions persisted on the customer record.

#![allow(clippy::unwrap_used)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use mockito::Matcher;
use pinegate_provisioning::{
    CustomerService, PlanCache, PlanCatalog, ProvisionOutcome, ProvisionReason,
    ProvisioningError, ProvisioningService, ProvisioningStatus, SessionRefreshTrigger,
    StripeConfig, StripeGateway, TradingViewClient, TradingViewConfig,
};
use pinegate_provisioning::plans::Plan;
use serde_json::json;

/// Counts trigger invocations instead of dispatching a workflow
#[derive(Clone, Default)]
struct RecordingTrigger {
    calls: Arc<AtomicUsize>,
}

impl SessionRefreshTrigger for RecordingTrigger {
    async fn trigger(&self, _customer_id: &str) -> bool {
        self.calls.fetch_add(1, Ordering::SeqCst);
        true
    }
}

fn service(
    stripe_url: &str,
    tv_url: &str,
    trigger: RecordingTrigger,
) -> ProvisioningService<RecordingTrigger> {
    let config = StripeConfig {
        secret_key: "sk_test_123".to_string(),
        webhook_secret: "whsec_test".to_string(),
        plan_price_ids: vec!["price_a".to_string()],
        app_base_url: "http://localhost:3000".to_string(),
    };
    let gateway = StripeGateway::with_base_url(config, stripe_url);
    let customers = CustomerService::new(gateway.clone());
    let plans = PlanCatalog::new(gateway, Arc::new(PlanCache::default()));
    let tradingview = TradingViewClient::new(TradingViewConfig {
        base_url: tv_url.to_string(),
        session_id: "sess".to_string(),
        pine_ids: vec!["PUB;aaa".to_string()],
    })
    .unwrap();
    ProvisioningService::new(customers, plans, tradingview, trigger)
}

fn customer(metadata: serde_json::Value) -> stripe::Customer {
    serde_json::from_value(json!({"id": "cus_1", "metadata": metadata})).unwrap()
}

fn plan(total_months: u32) -> Plan {
    Plan {
        id: "plan_annual".to_string(),
        price_id: "price_a".to_string(),
        name: "Annual".to_string(),
        description: String::new(),
        price: 299.0,
        currency: "usd".to_string(),
        interval: "year".to_string(),
        plan_type: "annual".to_string(),
        access_duration_months: total_months,
        bonus_months: 0,
        internal_product_id: "sn_vision".to_string(),
        features: vec![],
    }
}

/// Mock builder for the customer-metadata update call; callers finish with
/// `.create_async().await`
fn update_mock(server: &mut mockito::Server, body: Matcher) -> mockito::Mock {
    server
        .mock("POST", "/v1/customers/cus_1")
        .match_body(body)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"id":"cus_1","metadata":{}}"#)
}

fn status_body(status: &str) -> Matcher {
    Matcher::UrlEncoded("metadata[provisioning_status]".into(), status.into())
}

#[tokio::test]
async fn checkout_grant_walks_pending_then_complete() {
    let mut stripe_server = mockito::Server::new_async().await;
    let mut tv_server = mockito::Server::new_async().await;

    let pending = update_mock(&mut stripe_server, status_body("pending"))
        .create_async()
        .await;
    let complete = update_mock(
        &mut stripe_server,
        Matcher::AllOf(vec![
            status_body("complete"),
            // Success clears the last recorded error
            Matcher::UrlEncoded("metadata[last_error]".into(), "".into()),
        ]),
    )
    .create_async()
    .await;

    tv_server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[]}"#)
        .create_async()
        .await;
    tv_server
        .mock("POST", "/pine_perm/add/")
        .with_status(200)
        .create_async()
        .await;

    let trigger = RecordingTrigger::default();
    let svc = service(&stripe_server.url(), &tv_server.url(), trigger.clone());
    let cust = customer(json!({"tradingview_username": "alice"}));

    let outcome = svc
        .ensure_access(&cust, Some(&plan(18)), ProvisionReason::CheckoutCompleted)
        .await
        .unwrap();

    match outcome {
        ProvisionOutcome::Granted { duration, .. } => assert_eq!(duration.to_string(), "18M"),
        other => panic!("expected Granted, got {:?}", other),
    }
    pending.assert_async().await;
    complete.assert_async().await;
    assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn status_check_short_circuits_when_complete() {
    let mut stripe_server = mockito::Server::new_async().await;
    let mut tv_server = mockito::Server::new_async().await;

    let updates = update_mock(&mut stripe_server, Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let tv = tv_server
        .mock("POST", Matcher::Regex("/pine_perm/.*".to_string()))
        .expect(0)
        .create_async()
        .await;

    let svc = service(
        &stripe_server.url(),
        &tv_server.url(),
        RecordingTrigger::default(),
    );
    let cust = customer(json!({
        "tradingview_username": "alice",
        "provisioning_status": "complete"
    }));

    let outcome = svc
        .ensure_access(&cust, Some(&plan(18)), ProvisionReason::StatusCheck)
        .await
        .unwrap();

    assert!(matches!(outcome, ProvisionOutcome::AlreadyProvisioned));
    updates.assert_async().await;
    tv.assert_async().await;
}

#[tokio::test]
async fn manual_refresh_reattempts_even_when_complete() {
    let mut stripe_server = mockito::Server::new_async().await;
    let mut tv_server = mockito::Server::new_async().await;

    update_mock(&mut stripe_server, Matcher::Any)
        .expect_at_least(2)
        .create_async()
        .await;

    let list = tv_server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[]}"#)
        .create_async()
        .await;
    tv_server
        .mock("POST", "/pine_perm/add/")
        .with_status(200)
        .create_async()
        .await;

    let svc = service(
        &stripe_server.url(),
        &tv_server.url(),
        RecordingTrigger::default(),
    );
    let cust = customer(json!({
        "tradingview_username": "alice",
        "provisioning_status": "complete"
    }));

    let outcome = svc
        .ensure_access(&cust, Some(&plan(6)), ProvisionReason::ManualRefresh)
        .await
        .unwrap();

    assert!(matches!(outcome, ProvisionOutcome::Granted { .. }));
    list.assert_async().await;
}

#[tokio::test]
async fn session_rejection_lands_on_retry_pending_and_fires_trigger_once() {
    let mut stripe_server = mockito::Server::new_async().await;
    let mut tv_server = mockito::Server::new_async().await;

    let pending = update_mock(&mut stripe_server, status_body("pending"))
        .create_async()
        .await;
    let retry_pending = update_mock(
        &mut stripe_server,
        Matcher::AllOf(vec![
            status_body("retry_pending"),
            // last_error carries the status code that tripped the heuristic
            Matcher::Regex("403".to_string()),
        ]),
    )
    .create_async()
    .await;

    tv_server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(403)
        .create_async()
        .await;

    let trigger = RecordingTrigger::default();
    let svc = service(&stripe_server.url(), &tv_server.url(), trigger.clone());
    let cust = customer(json!({"tradingview_username": "alice"}));

    let outcome = svc
        .ensure_access(&cust, Some(&plan(6)), ProvisionReason::RenewalPaid)
        .await
        .unwrap();

    match outcome {
        ProvisionOutcome::Failed { status, error, .. } => {
            assert_eq!(status, ProvisioningStatus::RetryPending);
            assert!(error.contains("403"));
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    pending.assert_async().await;
    retry_pending.assert_async().await;
    assert_eq!(trigger.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn plain_failure_lands_on_failed_without_trigger() {
    let mut stripe_server = mockito::Server::new_async().await;
    let mut tv_server = mockito::Server::new_async().await;

    update_mock(&mut stripe_server, status_body("pending"))
        .create_async()
        .await;
    let failed = update_mock(
        &mut stripe_server,
        Matcher::AllOf(vec![status_body("failed"), Matcher::Regex("500".to_string())]),
    )
    .create_async()
    .await;

    tv_server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[]}"#)
        .create_async()
        .await;
    tv_server
        .mock("POST", "/pine_perm/add/")
        .with_status(500)
        .create_async()
        .await;

    let trigger = RecordingTrigger::default();
    let svc = service(&stripe_server.url(), &tv_server.url(), trigger.clone());
    let cust = customer(json!({"tradingview_username": "alice"}));

    let outcome = svc
        .ensure_access(&cust, Some(&plan(6)), ProvisionReason::ManualRefresh)
        .await
        .unwrap();

    match outcome {
        ProvisionOutcome::Failed { status, .. } => {
            assert_eq!(status, ProvisioningStatus::Failed)
        }
        other => panic!("expected Failed, got {:?}", other),
    }
    failed.assert_async().await;
    assert_eq!(trigger.calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn missing_username_signals_needs_onboarding_without_side_effects() {
    let mut stripe_server = mockito::Server::new_async().await;
    let mut tv_server = mockito::Server::new_async().await;

    let updates = update_mock(&mut stripe_server, Matcher::Any)
        .expect(0)
        .create_async()
        .await;
    let tv = tv_server
        .mock("POST", Matcher::Regex("/pine_perm/.*".to_string()))
        .expect(0)
        .create_async()
        .await;

    let svc = service(
        &stripe_server.url(),
        &tv_server.url(),
        RecordingTrigger::default(),
    );
    let cust = customer(json!({}));

    let err = svc
        .ensure_access(&cust, Some(&plan(6)), ProvisionReason::CheckoutCompleted)
        .await
        .unwrap_err();

    assert!(matches!(err, ProvisioningError::NeedsOnboarding));
    updates.assert_async().await;
    tv.assert_async().await;
}

#[tokio::test]
async fn snapshot_months_used_when_no_subscription_resolves() {
    let mut stripe_server = mockito::Server::new_async().await;
    let mut tv_server = mockito::Server::new_async().await;

    // No explicit plan: the machine asks Stripe for the active subscription
    stripe_server
        .mock("GET", "/v1/subscriptions")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"{"object":"list","data":[],"has_more":false,"url":"/v1/subscriptions"}"#)
        .create_async()
        .await;
    update_mock(&mut stripe_server, Matcher::Any)
        .expect_at_least(2)
        .create_async()
        .await;

    tv_server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[]}"#)
        .create_async()
        .await;
    tv_server
        .mock("POST", "/pine_perm/add/")
        .with_status(200)
        .create_async()
        .await;

    let svc = service(
        &stripe_server.url(),
        &tv_server.url(),
        RecordingTrigger::default(),
    );
    let cust = customer(json!({
        "tradingview_username": "alice",
        "plan_type": "annual",
        "access_duration_months": "12",
        "bonus_months": "6",
        "total_access_months": "18",
        "internal_product_id": "sn_vision"
    }));

    let outcome = svc
        .ensure_access(&cust, None, ProvisionReason::ManualRefresh)
        .await
        .unwrap();

    match outcome {
        ProvisionOutcome::Granted { duration, .. } => assert_eq!(duration.to_string(), "18M"),
        other => panic!("expected Granted, got {:?}", other),
    }
}
