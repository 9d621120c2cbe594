//! Cluster health, circuit breaking, and failover through the assembled
//! daemon.

use parley::health::{CircuitState, HealthEvent, PlanStatus};
use parley::router::ConnectionHandle;
use parley::{server, Daemon};
use parleyconf::ParleyConfig;
use pretty_assertions::assert_eq;
use serde_json::Value;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

fn daemon_with_peer(node_id: &str) -> std::sync::Arc<Daemon> {
    let mut config = ParleyConfig::default();
    // Nothing listens on port 1; every real probe or call fails fast.
    config
        .health
        .nodes
        .insert(node_id.to_string(), "http://127.0.0.1:1".to_string());
    config.health.probe_timeout_ms = 200;
    Daemon::new(config).unwrap()
}

#[tokio::test]
async fn configured_peers_are_registered_at_startup() {
    let daemon = daemon_with_peer("peer-a");
    assert_eq!(daemon.health.node_ids(), vec!["peer-a".to_string()]);
    assert!(daemon.health.is_node_available("peer-a"));
}

#[tokio::test]
async fn breaker_trip_blocks_delegation_until_reset() {
    let daemon = daemon_with_peer("A");
    let t0 = Instant::now();

    // success, fail, fail, fail, success: error rate 0.6 trips the breaker.
    for success in [true, false, false, false, true] {
        daemon.health.record_outcome_at("A", success, t0);
    }
    assert_eq!(daemon.health.circuit_state("A"), Some(CircuitState::Open));
    assert!(!daemon.health.is_node_available_at("A", t0));

    // A delegation while open is refused without touching the network and
    // surfaces as CANCELLED to the original caller.
    let parent = daemon.tracer.start_trace("test");
    let err = daemon
        .federation
        .call("A", "session.status", serde_json::json!({}), &parent)
        .await
        .unwrap_err();
    assert_eq!(
        err.to_rpc_error().code,
        parleyproto::ErrorCode::Cancelled
    );

    // After the reset timeout the breaker admits trial calls again.
    let probe_time = t0 + Duration::from_millis(30_000);
    assert!(daemon.health.is_node_available_at("A", probe_time));
    assert_eq!(
        daemon.health.circuit_state("A"),
        Some(CircuitState::HalfOpen)
    );
}

#[tokio::test]
async fn dead_node_failover_plan_resolves_failed_on_any_miss() {
    let daemon = daemon_with_peer("N");

    // Six consecutive failing checks: unhealthy at 3, dead at 6.
    for _ in 0..6 {
        daemon.health.apply_check("N", false, Some("refused".into()));
    }
    assert!(daemon.health.active_plan("N").is_some());

    let mut assignments = BTreeMap::new();
    assignments.insert("s1".to_string(), "M".to_string());
    assignments.insert("s2".to_string(), "P".to_string());
    assignments.insert("s3".to_string(), "P".to_string());
    daemon.health.assign_failover("N", assignments);

    assert_eq!(
        daemon.health.report_migration("N", "s1", true),
        Some(PlanStatus::Executing)
    );
    assert_eq!(
        daemon.health.report_migration("N", "s2", true),
        Some(PlanStatus::Executing)
    );
    assert_eq!(
        daemon.health.report_migration("N", "s3", false),
        Some(PlanStatus::Failed)
    );
    assert!(daemon.health.active_plan("N").is_none());
}

#[tokio::test]
async fn node_events_reach_subscribed_clients() {
    let daemon = daemon_with_peer("flaky");

    // One client subscribed to all node events.
    let (handle, mut writer) = ConnectionHandle::channel(64 * 1024);
    let conn = handle.id;
    daemon.connections.register(handle);
    daemon.subscriptions.subscribe(conn, "node.**", None).unwrap();

    let cancel = CancellationToken::new();
    let bridge = server::spawn_health_bridge(daemon.clone(), cancel.clone());

    for _ in 0..3 {
        daemon.health.apply_check("flaky", false, None);
    }

    let message = tokio::time::timeout(Duration::from_secs(2), writer.next())
        .await
        .unwrap()
        .unwrap();
    let parley::router::OutboundMessage::Text(text) = message else {
        panic!("expected event text");
    };
    let event: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(event["event"], "node.unhealthy");
    assert_eq!(event["payload"]["node_id"], "flaky");

    cancel.cancel();
    let _ = bridge.await;
}

#[tokio::test]
async fn monitor_broadcast_matches_event_names() {
    let daemon = daemon_with_peer("x");
    let mut rx = daemon.health.subscribe();

    for _ in 0..6 {
        daemon.health.apply_check("x", false, None);
    }

    let first = rx.try_recv().unwrap();
    assert_eq!(first, HealthEvent::NodeUnhealthy { node_id: "x".into() });
    assert_eq!(first.event_name(), "node.unhealthy");
    let second = rx.try_recv().unwrap();
    assert_eq!(second, HealthEvent::NodeDead { node_id: "x".into() });
}
