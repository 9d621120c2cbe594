//! End-to-end pipeline tests: frames in, responses and events out, with no
//! real socket. The router runs against an in-memory connection handle and
//! the writer half plays the transport.

use bytes::Bytes;
use parley::auth::Handshake;
use parley::router::{ConnectionHandle, ConnectionState, ConnectionWriter, MessageRouter, OutboundMessage};
use parley::Daemon;
use parleyconf::{ApiKeyEntry, AuthMode, ParleyConfig};
use parleyproto::BinaryFrame;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

fn test_config() -> ParleyConfig {
    let mut config = ParleyConfig::default();
    config.auth.jwt_secret = Some("test-secret".to_string());
    config.auth.api_keys.push(ApiKeyEntry {
        key: "pk-tester".to_string(),
        client_id: "tester".to_string(),
        scopes: vec!["session".to_string(), "events".to_string()],
    });
    config
}

fn loopback_handshake() -> Handshake {
    Handshake {
        token: None,
        api_key: None,
        remote_addr: Some("127.0.0.1".parse().unwrap()),
    }
}

fn connect(config: ParleyConfig, handshake: &Handshake) -> (Arc<Daemon>, MessageRouter, ConnectionWriter) {
    let daemon = Daemon::new(config).unwrap();
    let (handle, writer) = ConnectionHandle::channel(4 * 1024 * 1024);
    daemon.connections.register(handle.clone());
    let router = MessageRouter::new(daemon.clone(), handle, handshake);
    (daemon, router, writer)
}

async fn recv_json(writer: &mut ConnectionWriter) -> Value {
    let message = tokio::time::timeout(Duration::from_secs(2), writer.next())
        .await
        .expect("timed out waiting for outbound message")
        .expect("connection closed unexpectedly");
    match message {
        OutboundMessage::Text(text) => serde_json::from_str(&text).unwrap(),
        other => panic!("expected text message, got {:?}", other),
    }
}

#[tokio::test]
async fn loopback_handshake_authenticates_immediately() {
    let (_daemon, router, _writer) = connect(test_config(), &loopback_handshake());
    assert_eq!(router.state(), ConnectionState::Ready);
    let identity = router.identity().unwrap();
    assert_eq!(identity.client_id, "loopback");
    assert_eq!(identity.scopes, vec!["*"]);
}

#[tokio::test]
async fn partial_batch_answers_every_index() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());

    router
        .handle_text(
            r#"[{"type":"req","id":"a","method":"health.ping"},{"type":"garbage"},{"type":"req","id":"b","method":"health.ping"}]"#,
        )
        .await;

    let batch = recv_json(&mut writer).await;
    let responses = batch.as_array().expect("batch in, batch out");
    assert_eq!(responses.len(), 3);

    assert_eq!(responses[0]["id"], "a");
    assert_eq!(responses[0]["ok"], true);
    assert_eq!(responses[0]["payload"]["pong"], true);

    assert_eq!(responses[1]["id"], Value::Null);
    assert_eq!(responses[1]["ok"], false);
    assert_eq!(responses[1]["error"]["code"], "INVALID_REQUEST");
    assert!(responses[1]["error"]["message"]
        .as_str()
        .unwrap()
        .starts_with("batch[1]:"));

    assert_eq!(responses[2]["id"], "b");
    assert_eq!(responses[2]["ok"], true);
}

#[tokio::test]
async fn rate_limited_request_carries_retry_hint() {
    let mut config = test_config();
    config.rate.max_tokens = 5.0;
    config.rate.refill_per_second = 1.0;
    config.rate.method_costs = [("prompt.submit".to_string(), 5.0)].into_iter().collect();

    let (_daemon, mut router, mut writer) = connect(config, &loopback_handshake());
    let request = |id: &str| {
        format!(
            r#"{{"type":"req","id":"{}","method":"prompt.submit","params":{{"session_id":"sess-x","prompt":"hi"}}}}"#,
            id
        )
    };

    // First call drains the bucket (the session does not exist, but rate
    // limiting happens before dispatch).
    router.handle_text(&request("r1")).await;
    let first = recv_json(&mut writer).await;
    assert_eq!(first["error"]["data"]["kind"], "not_found");

    // Second call is denied with the full-cost retry hint.
    router.handle_text(&request("r2")).await;
    let second = recv_json(&mut writer).await;
    assert_eq!(second["ok"], false);
    assert_eq!(second["error"]["code"], "RATE_LIMITED");
    assert_eq!(second["error"]["data"]["retryAfterMs"], 5000);
}

#[tokio::test]
async fn unknown_method_not_found() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());
    router
        .handle_text(r#"{"type":"req","id":"x","method":"no.such.method"}"#)
        .await;
    let response = recv_json(&mut writer).await;
    assert_eq!(response["error"]["code"], "METHOD_NOT_FOUND");
}

#[tokio::test]
async fn auth_connect_upgrades_connection() {
    let mut config = test_config();
    config.auth.allow_loopback = false;

    let (_daemon, mut router, mut writer) = connect(config, &Handshake::default());
    assert_eq!(router.state(), ConnectionState::Connecting);

    // Unauthenticated calls are refused.
    router
        .handle_text(r#"{"type":"req","id":"1","method":"health.ping"}"#)
        .await;
    let refused = recv_json(&mut writer).await;
    assert_eq!(refused["error"]["code"], "AUTH_REQUIRED");

    // auth.connect with a valid API key flips the connection to READY.
    router
        .handle_text(
            r#"{"type":"req","id":"2","method":"auth.connect","params":{"apiKey":"pk-tester"}}"#,
        )
        .await;
    let connected = recv_json(&mut writer).await;
    assert_eq!(connected["ok"], true);
    assert_eq!(connected["payload"]["identity"]["client_id"], "tester");
    assert_eq!(router.state(), ConnectionState::Ready);

    router
        .handle_text(r#"{"type":"req","id":"3","method":"health.ping"}"#)
        .await;
    let pong = recv_json(&mut writer).await;
    assert_eq!(pong["ok"], true);

    // auth.logout clears the identity again.
    router
        .handle_text(r#"{"type":"req","id":"4","method":"auth.logout"}"#)
        .await;
    let out = recv_json(&mut writer).await;
    assert_eq!(out["payload"]["logged_out"], true);
    router
        .handle_text(r#"{"type":"req","id":"5","method":"health.ping"}"#)
        .await;
    let refused = recv_json(&mut writer).await;
    assert_eq!(refused["error"]["code"], "AUTH_REQUIRED");
}

#[tokio::test]
async fn scopes_gate_methods() {
    let mut config = test_config();
    config.auth.allow_loopback = false;
    config.auth.mode = AuthMode::ApiKeyOnly;

    let handshake = Handshake {
        api_key: Some("pk-tester".to_string()),
        ..Handshake::default()
    };
    let (_daemon, mut router, mut writer) = connect(config, &handshake);
    assert_eq!(router.state(), ConnectionState::Ready);

    // "session" scope covers session.create...
    router
        .handle_text(r#"{"type":"req","id":"1","method":"session.create","params":{}}"#)
        .await;
    let created = recv_json(&mut writer).await;
    assert_eq!(created["ok"], true);

    // ...but not memory.query.
    router
        .handle_text(r#"{"type":"req","id":"2","method":"memory.query","params":{}}"#)
        .await;
    let denied = recv_json(&mut writer).await;
    assert_eq!(denied["error"]["code"], "PERMISSION_DENIED");
}

#[tokio::test]
async fn jsonrpc_clients_get_jsonrpc_envelopes() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());
    router
        .handle_text(r#"{"jsonrpc":"2.0","id":7,"method":"health.ping","params":{}}"#)
        .await;
    let response = recv_json(&mut writer).await;
    assert_eq!(response["jsonrpc"], "2.0");
    assert_eq!(response["id"], 7);
    assert_eq!(response["result"]["pong"], true);
    assert!(response.get("type").is_none());
}

#[tokio::test]
async fn legacy_v1_clients_get_v1_envelopes() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());
    router
        .handle_text(r#"{"id":"r1","method":"health.ping"}"#)
        .await;
    let response = recv_json(&mut writer).await;
    assert_eq!(response["success"], true);
    assert_eq!(response["result"]["pong"], true);
}

#[tokio::test]
async fn oversized_message_closes_with_payload_too_large() {
    let mut config = test_config();
    config.limits.max_message_bytes = 128;

    let (_daemon, mut router, mut writer) = connect(config, &loopback_handshake());
    let big = format!(
        r#"{{"type":"req","id":"a","method":"health.ping","params":{{"pad":"{}"}}}}"#,
        "x".repeat(500)
    );
    router.handle_text(&big).await;

    let response = recv_json(&mut writer).await;
    assert_eq!(response["error"]["code"], "PAYLOAD_TOO_LARGE");
    assert_eq!(
        tokio::time::timeout(Duration::from_secs(1), writer.next())
            .await
            .unwrap(),
        Some(OutboundMessage::Close {
            reason: "PAYLOAD_TOO_LARGE".to_string()
        })
    );
}

#[tokio::test]
async fn malformed_json_is_answered_not_fatal() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());
    router.handle_text("{this is not json").await;
    let response = recv_json(&mut writer).await;
    assert_eq!(response["error"]["code"], "PARSE_ERROR");

    // The connection is still usable.
    router
        .handle_text(r#"{"type":"req","id":"after","method":"health.ping"}"#)
        .await;
    let pong = recv_json(&mut writer).await;
    assert_eq!(pong["ok"], true);
}

#[tokio::test]
async fn subscribe_then_receive_matching_events() {
    let (daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());
    router
        .handle_text(
            r#"{"type":"req","id":"s1","method":"subscribe","params":{"pattern":"deploy.*"}}"#,
        )
        .await;
    let subscribed = recv_json(&mut writer).await;
    assert_eq!(subscribed["ok"], true);
    let subscription_id = subscribed["payload"]["subscription_id"].as_str().unwrap().to_string();

    daemon.bus.publish("deploy.started", json!({"build": 42}));
    daemon.bus.publish("unrelated.event", json!({}));

    let event = recv_json(&mut writer).await;
    assert_eq!(event["type"], "event");
    assert_eq!(event["event"], "deploy.started");
    assert_eq!(event["payload"]["build"], 42);
    assert_eq!(event["seq"], 1);

    // Unsubscribe stops delivery.
    router
        .handle_text(&format!(
            r#"{{"type":"req","id":"s2","method":"unsubscribe","params":{{"subscription_id":"{}"}}}}"#,
            subscription_id
        ))
        .await;
    let unsubscribed = recv_json(&mut writer).await;
    assert_eq!(unsubscribed["ok"], true);

    daemon.bus.publish("deploy.started", json!({"build": 43}));
    router
        .handle_text(r#"{"type":"req","id":"s3","method":"health.ping"}"#)
        .await;
    let next = recv_json(&mut writer).await;
    // The ping response arrives; no second deploy event precedes it.
    assert_eq!(next["id"], "s3");
}

#[tokio::test]
async fn binary_upload_claimed_by_memory_store() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());

    let correlation_id: Uuid = "550e8400-e29b-41d4-a716-446655440000".parse().unwrap();
    let frame = BinaryFrame::new(
        correlation_id,
        json!({"method": "file.upload", "name": "sample.bin"}),
        Bytes::from(vec![0xAB; 100_000]),
    );
    router.handle_binary(&frame.encode().unwrap()).await;

    router
        .handle_text(&format!(
            r#"{{"type":"req","id":"m1","method":"memory.store","params":{{"key":"uploads/sample","correlation_id":"{}"}}}}"#,
            correlation_id
        ))
        .await;
    let stored = recv_json(&mut writer).await;
    assert_eq!(stored["ok"], true);
    assert_eq!(stored["payload"]["key"], "uploads/sample");

    router
        .handle_text(
            r#"{"type":"req","id":"m2","method":"memory.query","params":{"prefix":"uploads/"}}"#,
        )
        .await;
    let queried = recv_json(&mut writer).await;
    assert_eq!(queried["payload"]["count"], 1);
    assert_eq!(queried["payload"]["entries"][0]["value"]["bytes"], 100_000);
    assert_eq!(
        queried["payload"]["entries"][0]["value"]["upload"]["name"],
        "sample.bin"
    );
}

#[tokio::test]
async fn unsupported_binary_version_closes() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());
    let frame = BinaryFrame::new(Uuid::new_v4(), json!({}), Bytes::new());
    let mut encoded = frame.encode().unwrap().to_vec();
    encoded[0] = 7;

    router.handle_binary(&encoded).await;
    let response = recv_json(&mut writer).await;
    assert_eq!(response["error"]["code"], "INVALID_REQUEST");
    assert!(matches!(
        tokio::time::timeout(Duration::from_secs(1), writer.next())
            .await
            .unwrap(),
        Some(OutboundMessage::Close { .. })
    ));
}

#[tokio::test]
async fn prompt_streams_chunks_then_completion() {
    let (_daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());

    router
        .handle_text(r#"{"type":"req","id":"c1","method":"session.create","params":{"title":"demo"}}"#)
        .await;
    let created = recv_json(&mut writer).await;
    let session_id = created["payload"]["session"]["session_id"]
        .as_str()
        .unwrap()
        .to_string();

    router
        .handle_text(
            r#"{"type":"req","id":"s1","method":"subscribe","params":{"pattern":"session.output"}}"#,
        )
        .await;
    recv_json(&mut writer).await;
    router
        .handle_text(
            r#"{"type":"req","id":"s2","method":"subscribe","params":{"pattern":"prompt.completed"}}"#,
        )
        .await;
    recv_json(&mut writer).await;

    router
        .handle_text(&format!(
            r#"{{"type":"req","id":"p1","method":"prompt.submit","params":{{"session_id":"{}","prompt":"three word reply"}}}}"#,
            session_id
        ))
        .await;

    let mut chunks = 0;
    let mut submitted = false;
    let mut completed = false;
    while !(submitted && completed) {
        let message = recv_json(&mut writer).await;
        if message["type"] == "res" {
            assert_eq!(message["id"], "p1");
            assert_eq!(message["payload"]["streaming"], true);
            submitted = true;
        } else if message["event"] == "session.output" {
            chunks += 1;
        } else if message["event"] == "prompt.completed" {
            completed = true;
        }
    }
    assert_eq!(chunks, 3);
}

#[tokio::test]
async fn cleanup_drops_everything_the_connection_owned() {
    let (daemon, mut router, mut writer) = connect(test_config(), &loopback_handshake());
    router
        .handle_text(r#"{"type":"req","id":"s1","method":"subscribe","params":{"pattern":"**"}}"#)
        .await;
    recv_json(&mut writer).await;
    assert_eq!(daemon.subscriptions.subscription_count(), 1);
    assert_eq!(daemon.connections.count(), 1);

    router.cleanup();
    assert_eq!(daemon.subscriptions.subscription_count(), 0);
    assert_eq!(daemon.connections.count(), 0);
    assert_eq!(daemon.rate_limiter.bucket_count(), 0);
}
