//! TradingView client tests against a mock HTTP server

#![allow(clippy::unwrap_used)]

use mockito::Matcher;
use pinegate_provisioning::tradingview::{
    AccessDuration, GrantStatus, TradingViewClient, TradingViewConfig,
};

fn client_for(server: &mockito::Server, pine_ids: &[&str]) -> TradingViewClient {
    TradingViewClient::new(TradingViewConfig {
        base_url: server.url(),
        session_id: "sess123".to_string(),
        pine_ids: pine_ids.iter().map(|s| s.to_string()).collect(),
    })
    .unwrap()
}

#[tokio::test]
async fn validate_username_matches_case_insensitively() {
    let mut server = mockito::Server::new_async().await;
    let mock = server
        .mock("GET", "/username_hint/")
        .match_query(Matcher::UrlEncoded("s".into(), "FooBar".into()))
        .match_header("cookie", "sessionid=sess123")
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(r#"[{"username":"foobar"},{"username":"foobarista"}]"#)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    let validation = client.validate_username("FooBar").await.unwrap();

    assert!(validation.valid);
    // Canonical casing comes from the platform, not the caller
    assert_eq!(validation.verified_username, "foobar");
    mock.assert_async().await;
}

#[tokio::test]
async fn validate_username_not_found_is_not_an_error() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/username_hint/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"[{"username":"someone_else"}]"#)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    let validation = client.validate_username("ghost").await.unwrap();

    assert!(!validation.valid);
    assert!(validation.verified_username.is_empty());
}

#[tokio::test]
async fn validate_username_surfaces_http_errors() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/username_hint/")
        .match_query(Matcher::Any)
        .with_status(500)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    let err = client.validate_username("foobar").await.unwrap_err();
    assert!(err.to_string().contains("500"));
}

#[tokio::test]
async fn grant_access_adds_new_user() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[]}"#)
        .create_async()
        .await;
    let add = server
        .mock("POST", "/pine_perm/add/")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("pine_id".into(), "PUB;aaa".into()),
            Matcher::UrlEncoded("username_recip".into(), "alice".into()),
        ]))
        .with_status(200)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    let outcomes = client
        .grant_access("alice", &AccessDuration::months(18))
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].status, GrantStatus::Success);
    assert!(outcomes[0].expiration.is_some());
    add.assert_async().await;
}

#[tokio::test]
async fn grant_access_extends_from_current_expiration() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[{"username":"Alice","expiration":"2030-01-15T00:00:00Z"}]}"#)
        .create_async()
        .await;
    // Existing grants are extended via modify, from the stored expiration,
    // never shortened and never re-added
    let modify = server
        .mock("POST", "/pine_perm/modify_user_expiration/")
        .match_body(Matcher::AllOf(vec![
            Matcher::UrlEncoded("pine_id".into(), "PUB;aaa".into()),
            Matcher::UrlEncoded("expiration".into(), "2030-02-15T00:00:00Z".into()),
        ]))
        .with_status(200)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    let outcomes = client
        .grant_access("alice", &AccessDuration::months(1))
        .await
        .unwrap();

    assert_eq!(outcomes[0].status, GrantStatus::Success);
    assert_eq!(
        outcomes[0].expiration.as_deref(),
        Some("2030-02-15T00:00:00Z")
    );
    modify.assert_async().await;
}

#[tokio::test]
async fn grant_access_skips_lifetime_grants() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[{"username":"alice","expiration":null}]}"#)
        .create_async()
        .await;
    let add = server
        .mock("POST", "/pine_perm/add/")
        .expect(0)
        .create_async()
        .await;
    let modify = server
        .mock("POST", "/pine_perm/modify_user_expiration/")
        .expect(0)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    let outcomes = client
        .grant_access("alice", &AccessDuration::months(6))
        .await
        .unwrap();

    assert_eq!(outcomes[0].status, GrantStatus::NotApplicable);
    add.assert_async().await;
    modify.assert_async().await;
}

#[tokio::test]
async fn grant_access_reports_indicators_independently() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body(r#"{"results":[]}"#)
        .expect(2)
        .create_async()
        .await;
    server
        .mock("POST", "/pine_perm/add/")
        .match_body(Matcher::AllOf(vec![Matcher::UrlEncoded(
            "pine_id".into(),
            "PUB;good".into(),
        )]))
        .with_status(200)
        .create_async()
        .await;
    server
        .mock("POST", "/pine_perm/add/")
        .match_body(Matcher::AllOf(vec![Matcher::UrlEncoded(
            "pine_id".into(),
            "PUB;bad".into(),
        )]))
        .with_status(500)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;good", "PUB;bad"]);
    let outcomes = client
        .grant_access("alice", &AccessDuration::months(6))
        .await
        .unwrap();

    // One failing indicator never aborts the others
    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].status, GrantStatus::Success);
    assert_eq!(outcomes[1].status, GrantStatus::Failure);
    assert!(outcomes[1].error.as_deref().unwrap().contains("500"));
}

#[tokio::test]
async fn grant_access_records_session_rejection_verbatim() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("POST", "/pine_perm/list_users/")
        .match_query(Matcher::Any)
        .with_status(403)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    let outcomes = client
        .grant_access("alice", &AccessDuration::months(6))
        .await
        .unwrap();

    assert_eq!(outcomes[0].status, GrantStatus::Failure);
    // The 403 stays in the message so the caller can classify it upstream
    assert!(outcomes[0].error.as_deref().unwrap().contains("403"));
}

#[tokio::test]
async fn revoke_access_removes_each_indicator() {
    let mut server = mockito::Server::new_async().await;
    let remove = server
        .mock("POST", "/pine_perm/remove/")
        .match_body(Matcher::AllOf(vec![Matcher::UrlEncoded(
            "username_recip".into(),
            "alice".into(),
        )]))
        .with_status(200)
        .expect(2)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa", "PUB;bbb"]);
    let outcomes = client.revoke_access("alice").await.unwrap();

    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|o| o.status == GrantStatus::Success));
    remove.assert_async().await;
}

#[tokio::test]
async fn session_probe_reports_health() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/tvcoins/details/")
        .match_header("cookie", "sessionid=sess123")
        .with_status(200)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    assert!(client.session_healthy().await.unwrap());
}

#[tokio::test]
async fn session_probe_detects_rejected_cookie() {
    let mut server = mockito::Server::new_async().await;
    server
        .mock("GET", "/tvcoins/details/")
        .with_status(401)
        .create_async()
        .await;

    let client = client_for(&server, &["PUB;aaa"]);
    assert!(!client.session_healthy().await.unwrap());
}
