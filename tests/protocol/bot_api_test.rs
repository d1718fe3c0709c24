//! Tests for `src/protocol/bot_api.rs` against a wiremock Bot API.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use courier::protocol::bot_api::{BotApiClient, BotApiConfig, BotApiFactory};
use courier::protocol::{
    Action, ActionResult, ClientFactory, InboundEvent, MediaKind, MediaRef, ProtocolClient,
    ProtocolError,
};
use courier::types::AccountCredential;

const TOKEN: &str = "123:secret";

fn credential() -> AccountCredential {
    AccountCredential {
        account_id: "123".to_owned(),
        bot_token: TOKEN.to_owned(),
        label: None,
    }
}

fn client(server: &MockServer) -> BotApiClient {
    let config = BotApiConfig {
        api_base: format!("{}/", server.uri()),
        poll_timeout_secs: 1,
    };
    BotApiClient::new(reqwest::Client::new(), &config, &credential())
}

fn ok(result: serde_json::Value) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({"ok": true, "result": result}))
}

async fn mount_get_me(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getMe")))
        .respond_with(ok(json!({"id": 123, "is_bot": true, "first_name": "Relay", "username": "relay_bot"})))
        .mount(server)
        .await;
}

/// Idle long-poll: an empty batch after a short hold.
async fn mount_idle_updates(server: &MockServer) {
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getUpdates")))
        .respond_with(ok(json!([])).set_delay(Duration::from_millis(100)))
        .mount(server)
        .await;
}

async fn wait_for<F: Fn() -> bool>(condition: F) -> bool {
    for _ in 0..100 {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test]
async fn connect_polls_and_emits_updates() {
    let server = MockServer::start().await;
    mount_get_me(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getUpdates")))
        .respond_with(ok(json!([{
            "update_id": 500,
            "message": {
                "message_id": 9,
                "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
                "chat": {"id": -100200, "type": "supergroup"},
                "date": 1_700_000_000,
                "caption": "look",
                "photo": [
                    {"file_id": "small", "file_unique_id": "AQADs", "file_size": 100},
                    {"file_id": "large", "file_unique_id": "AQADl", "file_size": 900}
                ]
            }
        }])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_idle_updates(&server).await;

    let client = client(&server);
    let received: Arc<Mutex<Vec<InboundEvent>>> = Arc::default();
    let sink = Arc::clone(&received);
    let _subscription = client.subscribe(Arc::new(move |event| {
        sink.lock().expect("sink lock").push(event);
    }));

    client.connect().await.expect("connect");
    assert!(client.is_connected());
    assert!(wait_for(|| !received.lock().expect("lock").is_empty()).await);

    let event = received.lock().expect("lock")[0].clone();
    assert_eq!(event.message_id, 9);
    assert!(!event.outgoing);
    assert_eq!(event.chat.expect("chat").id, -100_200);
    let media = event.media.expect("photo");
    assert_eq!(media.kind, MediaKind::Photo);
    assert_eq!(media.file_id, "large");
    assert_eq!(media.file_unique_id.as_deref(), Some("AQADl"));

    client.disconnect().await.expect("disconnect");
    assert!(!client.is_connected());
}

#[tokio::test]
async fn outgoing_detection_uses_the_bot_user_id() {
    let server = MockServer::start().await;
    mount_get_me(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getUpdates")))
        .respond_with(ok(json!([
            {
                "update_id": 1,
                "message": {
                    "message_id": 20,
                    "from": {"id": 123, "is_bot": true, "first_name": "Relay"},
                    "chat": {"id": 55, "type": "private"},
                    "date": 1_700_000_000,
                    "text": "from the bot"
                }
            },
            {
                "update_id": 2,
                "message": {
                    "message_id": 21,
                    "from": {"id": 42, "is_bot": false, "first_name": "Ada"},
                    "chat": {"id": 55, "type": "private"},
                    "date": 1_700_000_001,
                    "text": "from a user"
                }
            }
        ])))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    mount_idle_updates(&server).await;

    // Roster accounts may use an id unrelated to the numeric bot id.
    let credential = AccountCredential {
        account_id: "support-desk".to_owned(),
        bot_token: TOKEN.to_owned(),
        label: None,
    };
    let config = BotApiConfig {
        api_base: server.uri(),
        poll_timeout_secs: 1,
    };
    let client = BotApiClient::new(reqwest::Client::new(), &config, &credential);
    let received: Arc<Mutex<Vec<InboundEvent>>> = Arc::default();
    let sink = Arc::clone(&received);
    let _subscription = client.subscribe(Arc::new(move |event| {
        sink.lock().expect("sink lock").push(event);
    }));

    client.connect().await.expect("connect");
    assert!(wait_for(|| received.lock().expect("lock").len() >= 2).await);

    let events = received.lock().expect("lock").clone();
    assert_eq!(events[0].message_id, 20);
    assert!(events[0].outgoing);
    assert_eq!(events[1].message_id, 21);
    assert!(!events[1].outgoing);

    client.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn rejected_token_fails_connect() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getMe")))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "ok": false,
            "error_code": 401,
            "description": "Unauthorized"
        })))
        .mount(&server)
        .await;

    let client = client(&server);
    let err = client.connect().await.expect_err("connect should fail");

    assert!(matches!(err, ProtocolError::Api(ref msg) if msg.starts_with("401:")));
    assert!(!client.is_connected());
}

#[tokio::test]
async fn actions_need_a_connected_session() {
    let server = MockServer::start().await;
    let client = client(&server);

    let err = client
        .invoke(Action::DeleteMessage {
            chat_id: "1".to_owned(),
            message_id: "2".to_owned(),
        })
        .await
        .expect_err("not connected");
    assert!(matches!(err, ProtocolError::NotConnected));
}

#[tokio::test]
async fn send_message_returns_id_and_emits_outgoing_event() {
    let server = MockServer::start().await;
    mount_get_me(&server).await;
    mount_idle_updates(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/sendMessage")))
        .and(body_partial_json(json!({
            "chat_id": "55",
            "text": "hello",
            "reply_parameters": {"message_id": 10}
        })))
        .respond_with(ok(json!({
            "message_id": 77,
            "from": {"id": 123, "is_bot": true, "first_name": "Relay"},
            "chat": {"id": 55, "type": "private"},
            "date": 1_700_000_500,
            "text": "hello"
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    let received: Arc<Mutex<Vec<InboundEvent>>> = Arc::default();
    let sink = Arc::clone(&received);
    let _subscription = client.subscribe(Arc::new(move |event| {
        sink.lock().expect("sink lock").push(event);
    }));
    client.connect().await.expect("connect");

    let result = client
        .invoke(Action::SendMessage {
            chat_id: "55".to_owned(),
            text: "hello".to_owned(),
            reply_to: Some("10".to_owned()),
        })
        .await
        .expect("send");

    assert_eq!(
        result,
        ActionResult::Sent {
            message_id: "77".to_owned()
        }
    );
    let events = received.lock().expect("lock").clone();
    assert_eq!(events.len(), 1);
    assert!(events[0].outgoing);
    assert_eq!(events[0].text.as_deref(), Some("hello"));

    client.disconnect().await.expect("disconnect");
}

#[tokio::test]
async fn download_resolves_file_path_then_fetches_bytes() {
    let server = MockServer::start().await;
    mount_get_me(&server).await;
    mount_idle_updates(&server).await;
    Mock::given(method("POST"))
        .and(path(format!("/bot{TOKEN}/getFile")))
        .and(body_partial_json(json!({"file_id": "large"})))
        .respond_with(ok(json!({"file_id": "large", "file_path": "photos/file_1.jpg"})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(format!("/file/bot{TOKEN}/photos/file_1.jpg")))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0xFF, 0xD8, 0xFF]))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server);
    client.connect().await.expect("connect");

    let media = MediaRef {
        kind: MediaKind::Photo,
        file_id: "large".to_owned(),
        file_unique_id: Some("AQADl".to_owned()),
        mime_type: None,
        file_size: Some(3),
        is_animated: false,
        is_video: false,
    };
    let bytes = client.download_binary(&media).await.expect("download");
    assert_eq!(bytes, vec![0xFF, 0xD8, 0xFF]);

    client.disconnect().await.expect("disconnect");
}

#[test]
fn factory_rejects_malformed_tokens() {
    let factory = BotApiFactory::new(BotApiConfig::default());
    let bad = AccountCredential {
        account_id: "1".to_owned(),
        bot_token: "no-colon".to_owned(),
        label: None,
    };

    let Err(err) = factory.create(&bad) else {
        panic!("malformed token");
    };
    assert!(matches!(err, ProtocolError::InvalidCredential(_)));
    assert!(factory.create(&credential()).is_ok());
}
