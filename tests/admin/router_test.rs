//! Tests for `src/admin.rs`: authentication, health, account routes.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use courier::accounts::AccountManager;
use courier::admin::{self, AdminState, SECRET_HEADER};
use courier::pipeline::queue::{DeliveryQueue, QueueConfig};
use courier::pipeline::EventPipeline;
use courier::protocol::loopback::LoopbackFactory;
use courier::protocol::{Action, ClientFactory, ProtocolClient};
use courier::registry::Registry;
use courier::types::AccountCredential;

const SECRET: &str = "admin-secret";

struct Fixture {
    state: AdminState,
    manager: Arc<AccountManager>,
    factory: Arc<LoopbackFactory>,
}

fn fixture() -> Fixture {
    let registry = Arc::new(Registry::new());
    let queue = Arc::new(DeliveryQueue::new(QueueConfig::default()));
    let pipeline = Arc::new(EventPipeline::new(
        Arc::clone(&queue),
        Arc::clone(&registry),
        None,
        None,
    ));
    let factory = Arc::new(LoopbackFactory::new());
    let manager = Arc::new(AccountManager::new(
        registry,
        Arc::clone(&factory) as Arc<dyn ClientFactory>,
        pipeline,
        Duration::ZERO,
    ));
    let state = AdminState::new(Arc::clone(&manager), queue, SECRET);
    Fixture {
        state,
        manager,
        factory,
    }
}

fn cred(id: &str) -> AccountCredential {
    AccountCredential {
        account_id: id.to_owned(),
        bot_token: format!("{id}:token"),
        label: Some("support".to_owned()),
    }
}

fn post(uri: &str, secret: Option<&str>, body: Value) -> Request<Body> {
    let mut builder = Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json");
    if let Some(secret) = secret {
        builder = builder.header(SECRET_HEADER, secret);
    }
    builder
        .body(Body::from(body.to_string()))
        .expect("request")
}

async fn call(state: &AdminState, request: Request<Body>) -> (StatusCode, Value) {
    let response = admin::router(state.clone())
        .oneshot(request)
        .await
        .expect("router response");
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), 1 << 20)
        .await
        .expect("body");
    let body = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).expect("json body")
    };
    (status, body)
}

// ---------------------------------------------------------------------------
// Authentication
// ---------------------------------------------------------------------------

#[tokio::test]
async fn protected_routes_require_the_secret() {
    let f = fixture();

    let (status, body) = call(&f.state, post("/reload", None, json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["error"], "unauthorized");

    let (status, _) = call(&f.state, post("/accounts/1/connect", Some("wrong"), json!({}))).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn health_is_public_and_reports_accounts() {
    let f = fixture();
    f.manager.connect(cred("1")).await.expect("connect");
    f.manager.registry().upsert_credential(cred("2"));

    let request = Request::builder()
        .uri("/health")
        .body(Body::empty())
        .expect("request");
    let (status, body) = call(&f.state, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "degraded");
    assert_eq!(body["queue"]["processed"], 0);
    assert_eq!(body["queue"]["inFlight"], 0);
    let accounts = body["accounts"].as_array().expect("accounts array");
    assert_eq!(accounts.len(), 2);
    assert_eq!(accounts[0]["accountId"], "1");
    assert_eq!(accounts[0]["state"], "connected");
    assert_eq!(accounts[0]["label"], "support");
    assert_eq!(accounts[1]["state"], "disconnected");
}

#[tokio::test]
async fn health_is_ok_when_every_enabled_account_is_connected() {
    let f = fixture();
    f.manager.connect(cred("1")).await.expect("connect");

    let report = admin::health_report(&f.state);
    assert_eq!(report.status, "ok");
}

// ---------------------------------------------------------------------------
// Account routes
// ---------------------------------------------------------------------------

#[tokio::test]
async fn connect_and_disconnect_routes() {
    let f = fixture();
    f.manager.registry().upsert_credential(cred("7"));

    let (status, body) = call(&f.state, post("/accounts/7/connect", Some(SECRET), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"accountId": "7", "state": "connected"}));

    let (status, _) = call(&f.state, post("/accounts/7/connect", Some(SECRET), json!({}))).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) =
        call(&f.state, post("/accounts/7/disconnect", Some(SECRET), json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "disconnected");
    assert!(!f.factory.client("7").is_connected());
}

#[tokio::test]
async fn unknown_account_is_not_found() {
    let f = fixture();
    let (status, body) =
        call(&f.state, post("/accounts/999/connect", Some(SECRET), json!({}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().expect("error").contains("999"));
}

#[tokio::test]
async fn send_requires_a_connected_account() {
    let f = fixture();
    f.manager.registry().upsert_credential(cred("3"));

    let request = post(
        "/accounts/3/send",
        Some(SECRET),
        json!({"chatId": "55", "text": "hello"}),
    );
    let (status, _) = call(&f.state, request).await;
    assert_eq!(status, StatusCode::CONFLICT);
}

#[tokio::test]
async fn actions_on_unregistered_accounts_are_not_found() {
    let f = fixture();

    let request = post(
        "/accounts/999/send",
        Some(SECRET),
        json!({"chatId": "55", "text": "hello"}),
    );
    let (status, _) = call(&f.state, request).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn send_edit_and_delete_reach_the_protocol_client() {
    let f = fixture();
    f.manager.connect(cred("3")).await.expect("connect");

    let (status, body) = call(
        &f.state,
        post(
            "/accounts/3/send",
            Some(SECRET),
            json!({"chatId": "55", "text": "hello", "replyTo": "10"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"messageId": "1"}));

    let (status, body) = call(
        &f.state,
        post(
            "/accounts/3/edit",
            Some(SECRET),
            json!({"chatId": "55", "messageId": "1", "text": "hello again"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body, json!({"ok": true}));

    let (status, _) = call(
        &f.state,
        post(
            "/accounts/3/delete",
            Some(SECRET),
            json!({"chatId": "55", "messageId": "1"}),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let actions = f.factory.client("3").actions();
    let names: Vec<&str> = actions.iter().map(Action::name).collect();
    assert_eq!(names, vec!["send_message", "edit_message", "delete_message"]);
}

#[tokio::test]
async fn empty_fields_are_rejected() {
    let f = fixture();
    f.manager.connect(cred("3")).await.expect("connect");

    let (status, body) = call(
        &f.state,
        post("/accounts/3/send", Some(SECRET), json!({"chatId": "55", "text": "  "})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().expect("error").contains("text"));
    assert!(f.factory.client("3").actions().is_empty());
}

#[tokio::test]
async fn reload_without_roster_reports_summary() {
    let f = fixture();
    f.manager.connect(cred("1")).await.expect("connect");

    let (status, body) = call(&f.state, post("/reload", Some(SECRET), json!({}))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["disconnected"], json!(["1"]));
}
