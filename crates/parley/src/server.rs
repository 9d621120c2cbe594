//! WebSocket server and HTTP health endpoints.
//!
//! One axum app: `GET /ws` upgrades to the protocol transport, `/healthz`
//! and `/readyz` serve liveness and readiness for load balancers. Each
//! accepted socket gets its own [`MessageRouter`] (reader side) and writer
//! task draining the connection's outbound queues.

use crate::auth::Handshake;
use crate::daemon::Daemon;
use crate::router::{ConnectionHandle, MessageRouter, OutboundMessage};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Policy-violation close code, sent on BACKPRESSURE and size drops.
const CLOSE_POLICY: u16 = 1008;

pub fn router(daemon: Arc<Daemon>) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(daemon)
}

/// Bind and serve until the shutdown token fires.
pub async fn serve(daemon: Arc<Daemon>, shutdown: CancellationToken) -> anyhow::Result<()> {
    let addr = {
        let config = daemon.config.read().unwrap();
        format!("{}:{}", config.bind.host, config.bind.port)
    };
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("parley listening on ws://{}/ws", addr);

    axum::serve(
        listener,
        router(daemon).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown.cancelled_owned())
    .await?;
    Ok(())
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn readyz(State(daemon): State<Arc<Daemon>>) -> impl IntoResponse {
    axum::Json(json!({
        "ready": true,
        "uptime_secs": daemon.uptime_secs(),
        "connections": daemon.connections.count(),
    }))
}

async fn ws_upgrade(
    State(daemon): State<Arc<Daemon>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Query(query): Query<HashMap<String, String>>,
    ws: WebSocketUpgrade,
) -> Response {
    let handshake = handshake_from(&headers, addr, &query);
    ws.on_upgrade(move |socket| handle_socket(daemon, socket, handshake))
}

/// Collect connect-time credentials from headers and URL query.
fn handshake_from(
    headers: &HeaderMap,
    addr: SocketAddr,
    query: &HashMap<String, String>,
) -> Handshake {
    let bearer = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::to_string);
    let header_key = headers
        .get("x-api-key")
        .and_then(|value| value.to_str().ok())
        .map(str::to_string);

    Handshake {
        token: bearer.or_else(|| query.get("token").cloned()),
        api_key: header_key.or_else(|| query.get("api_key").cloned()),
        remote_addr: Some(addr.ip()),
    }
}

async fn handle_socket(daemon: Arc<Daemon>, socket: WebSocket, handshake: Handshake) {
    let max_buffered = daemon
        .config
        .read()
        .map(|config| config.limits.max_buffered_bytes)
        .unwrap_or(4 * 1024 * 1024);

    let (handle, mut writer) = ConnectionHandle::channel(max_buffered);
    daemon.connections.register(handle.clone());
    let mut router = MessageRouter::new(daemon.clone(), handle.clone(), &handshake);
    info!(conn = %handle.id, "connection accepted");

    let (mut sink, mut stream) = socket.split();

    // Writer task: the only task touching the sink.
    let writer_task = tokio::spawn(async move {
        while let Some(message) = writer.next().await {
            let outcome = match message {
                OutboundMessage::Text(text) => sink.send(Message::Text(text.into())).await,
                OutboundMessage::Binary(bytes) => sink.send(Message::Binary(bytes.into())).await,
                OutboundMessage::Close { reason } => {
                    let _ = sink
                        .send(Message::Close(Some(CloseFrame {
                            code: CLOSE_POLICY,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if outcome.is_err() {
                break;
            }
        }
    });

    // Reader loop: the connection's single-writer pipeline.
    while let Some(Ok(message)) = stream.next().await {
        match message {
            Message::Text(text) => router.handle_text(text.as_str()).await,
            Message::Binary(bytes) => router.handle_binary(&bytes).await,
            Message::Ping(_) | Message::Pong(_) => handle.touch(),
            Message::Close(_) => break,
        }
        if handle.is_closed() {
            break;
        }
    }

    debug!(conn = %handle.id, "connection closing");
    router.cleanup();
    let _ = writer_task.await;
    info!(conn = %handle.id, "connection closed");
}

/// Forward health-monitor broadcasts onto the event bus so subscribed
/// clients see node state changes.
pub fn spawn_health_bridge(daemon: Arc<Daemon>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let mut events = daemon.health.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => {
                        daemon.bus.publish(
                            event.event_name(),
                            json!({ "node_id": event.node_id() }),
                        );
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "health bridge lagged");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
                _ = cancel.cancelled() => break,
            }
        }
    })
}

/// Periodically expire overdue active spans.
pub fn spawn_span_sweeper(daemon: Arc<Daemon>, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
    let interval_ms = daemon
        .config
        .read()
        .map(|config| config.trace.sweep_interval_ms)
        .unwrap_or(30_000);
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(std::time::Duration::from_millis(interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let expired = daemon.tracer.sweep_expired();
                    if expired > 0 {
                        debug!(expired, "expired stale spans");
                    }
                }
                _ = cancel.cancelled() => break,
            }
        }
    })
}
