//! HTTP API integration tests
//!
//! Requests go through the full router (auth extractor, handlers, error
//! mapping) via `tower::ServiceExt::oneshot`.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{header, Method, Request, StatusCode};
use axum::Router;
use serde_json::{json, Value};
use tower::ServiceExt;

use arb_ledger::api::{create_router, AppState};
use arb_ledger::auth::JwtSessionVerifier;
use arb_ledger::config::AuthConfig;
use arb_ledger::Ledger;

use common::{ledger, ADDRESS};

struct TestApp {
    router: Router,
    ledger: Arc<Ledger>,
    verifier: JwtSessionVerifier,
}

impl TestApp {
    fn new() -> Self {
        let verifier = JwtSessionVerifier::new(&AuthConfig {
            jwt_secret: Some("api-test-secret-long-enough-for-hs256".to_string()),
            ..AuthConfig::default()
        })
        .unwrap();
        let ledger = ledger();
        let router = create_router(AppState::new(ledger.clone(), Arc::new(verifier.clone())));
        Self {
            router,
            ledger,
            verifier,
        }
    }

    fn token(&self, account_id: &str) -> String {
        self.verifier.issue_token(account_id, None, 300).unwrap()
    }

    fn admin_token(&self) -> String {
        self.verifier.issue_token("ops", Some("admin"), 300).unwrap()
    }

    async fn send(
        &self,
        method: Method,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> (StatusCode, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
        }
        let request = match body {
            Some(body) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(body.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, value)
    }
}

#[tokio::test]
async fn test_health_needs_no_token() {
    let app = TestApp::new();
    let (status, body) = app.send(Method::GET, "/health", None, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_or_bad_token_is_unauthorized() {
    let app = TestApp::new();

    let (status, body) = app.send(Method::GET, "/api/balance", None, None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["code"], "unauthorized");

    let (status, _) = app
        .send(Method::GET, "/api/balance", Some("garbage"), None)
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_event_reporting_is_idempotent() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, body) = app
        .send(
            Method::POST,
            "/api/events",
            Some(&token),
            Some(json!({ "event": { "kind": "signup" } })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["duplicate"], false);
    assert_eq!(body["entry"]["delta"], 100);

    let (status, body) = app
        .send(
            Method::POST,
            "/api/events",
            Some(&token),
            Some(json!({ "event": { "kind": "signup" } })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["duplicate"], true);

    let (status, body) = app
        .send(
            Method::POST,
            "/api/events",
            Some(&token),
            Some(json!({
                "event": { "kind": "upload", "qualityScore": 92, "rowCount": 1500, "isFirstUpload": true },
                "referenceId": "dataset-1"
            })),
        )
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(
        body["entry"]["breakdown"],
        json!({ "base": 50, "quality": 100, "largeDataset": 30, "firstUpload": 50 })
    );

    let (_, body) = app.send(Method::GET, "/api/balance", Some(&token), None).await;
    assert_eq!(body, json!({ "accountId": "alice", "balance": 330 }));
}

#[tokio::test]
async fn test_malformed_events_are_bad_requests() {
    let app = TestApp::new();
    let token = app.token("alice");

    let (status, body) = app
        .send(
            Method::POST,
            "/api/events",
            Some(&token),
            Some(json!({ "event": { "kind": "upload", "qualityScore": 140, "rowCount": 10 } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");

    let (status, _) = app
        .send(
            Method::POST,
            "/api/events",
            Some(&token),
            Some(json!({ "event": { "kind": "referral" } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    // Withdrawals have their own endpoint
    let (status, _) = app
        .send(
            Method::POST,
            "/api/events",
            Some(&token),
            Some(json!({ "event": { "kind": "withdrawal", "amount": 10 } })),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_withdrawal_flow() {
    let app = TestApp::new();
    let token = app.token("bob");
    app.ledger
        .append_entry("bob", arb_ledger::RewardEvent::Signup, None)
        .unwrap();

    // No address registered yet
    let (status, _) = app
        .send(Method::POST, "/api/withdrawals", Some(&token), Some(json!({ "amount": 50 })))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, body) = app
        .send(
            Method::PUT,
            "/api/account/address",
            Some(&token),
            Some(json!({ "address": ADDRESS })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["externalAddress"], ADDRESS);

    let (status, body) = app
        .send(Method::POST, "/api/withdrawals", Some(&token), Some(json!({ "amount": 60 })))
        .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["delta"], -60);
    assert_eq!(body["settlement"]["state"], "pending");
    let entry_id = body["entryId"].as_str().unwrap().to_string();

    let (status, body) = app
        .send(Method::POST, "/api/withdrawals", Some(&token), Some(json!({ "amount": 500 })))
        .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["code"], "insufficient_balance");

    // Re-query after a client-side timeout
    let (status, body) = app
        .send(Method::GET, &format!("/api/entries/{}", entry_id), Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["settlement"]["amount"], 60);

    // Other accounts cannot see it
    let other = app.token("mallory");
    let (status, _) = app
        .send(Method::GET, &format!("/api/entries/{}", entry_id), Some(&other), None)
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = app
        .send(Method::GET, "/api/entries?limit=1", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["entries"].as_array().unwrap().len(), 1);
    assert_eq!(body["nextCursor"], 2);

    let (status, body) = app
        .send(
            Method::GET,
            "/api/entries?before=18446744073709551615",
            Some(&token),
            None,
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["code"], "invalid_input");
}

#[tokio::test]
async fn test_admin_routes_require_elevation() {
    let app = TestApp::new();
    let user = app.token("carol");
    let admin = app.admin_token();
    let adjustment = json!({ "accountId": "carol", "delta": 75, "reason": "contest prize" });

    let (status, body) = app
        .send(Method::POST, "/api/admin/adjustments", Some(&user), Some(adjustment.clone()))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["code"], "forbidden");

    let (status, body) = app
        .send(Method::POST, "/api/admin/adjustments", Some(&admin), Some(adjustment))
        .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["entry"]["breakdown"]["contest prize"], 75);
    assert_eq!(app.ledger.get_balance("carol").unwrap(), 75);

    let (status, body) = app
        .send(
            Method::PUT,
            "/api/admin/accounts/carol/status",
            Some(&admin),
            Some(json!({ "status": "suspended" })),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "suspended");

    app.ledger.set_external_address("carol", Some(ADDRESS)).unwrap();
    let (status, _) = app
        .send(Method::POST, "/api/withdrawals", Some(&user), Some(json!({ "amount": 10 })))
        .await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = app
        .send(
            Method::PUT,
            "/api/admin/accounts/nobody/status",
            Some(&admin),
            Some(json!({ "status": "active" })),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_reward_rates_are_published() {
    let app = TestApp::new();
    let token = app.token("dave");
    let (status, body) = app
        .send(Method::GET, "/api/rewards/rates", Some(&token), None)
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["signup_bonus"], 100);
    assert_eq!(body["verification_reward"], 200);
}
