//! Per-connection state and the flat connection table.
//!
//! The router owns its connections through a [`ConnectionRegistry`] indexed
//! by [`ConnectionId`]. Other components (notably the subscription manager)
//! hold connection ids, never pointers, and resolve them here at dispatch
//! time; dropping the registry entry on disconnect is the whole cleanup.
//!
//! Outbound traffic takes two paths with one writer task per connection:
//! responses and control frames go through an unbounded priority channel,
//! events through a byte-capped queue that drops its oldest entry on
//! overflow (the `seq` gap left behind is the drop marker).

use parleyproto::compat::{self, Dialect};
use parleyproto::Frame;
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Opaque connection identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0.simple())
    }
}

/// Connection lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Accepted but not yet authenticated.
    Connecting,
    /// Authenticated; frames flow.
    Ready,
    /// Close requested; draining.
    Closing,
    Closed,
}

/// One message handed to the connection's writer task.
#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Text(String),
    Binary(Vec<u8>),
    Close { reason: String },
}

impl OutboundMessage {
    fn byte_len(&self) -> usize {
        match self {
            OutboundMessage::Text(s) => s.len(),
            OutboundMessage::Binary(b) => b.len(),
            // Close frames bypass buffer accounting so they always drain.
            OutboundMessage::Close { .. } => 0,
        }
    }
}

struct QueuedEvent {
    message: OutboundMessage,
    bytes: usize,
}

/// Shared per-connection handle stored in the registry.
pub struct ConnectionHandle {
    pub id: ConnectionId,
    /// Cancelled when the connection goes away; in-flight handlers observe it.
    pub cancel: CancellationToken,
    priority_tx: mpsc::UnboundedSender<OutboundMessage>,
    events: Mutex<VecDeque<QueuedEvent>>,
    event_notify: Notify,
    buffered_bytes: AtomicUsize,
    max_buffered_bytes: usize,
    closed: AtomicBool,
    dialect: Mutex<Dialect>,
    last_activity: Mutex<Instant>,
}

impl ConnectionHandle {
    /// Create a handle plus the writer half that drains it.
    pub fn channel(max_buffered_bytes: usize) -> (Arc<Self>, ConnectionWriter) {
        let (priority_tx, priority_rx) = mpsc::unbounded_channel();
        let handle = Arc::new(Self {
            id: ConnectionId::new(),
            cancel: CancellationToken::new(),
            priority_tx,
            events: Mutex::new(VecDeque::new()),
            event_notify: Notify::new(),
            buffered_bytes: AtomicUsize::new(0),
            max_buffered_bytes,
            closed: AtomicBool::new(false),
            dialect: Mutex::new(Dialect::V2),
            last_activity: Mutex::new(Instant::now()),
        });
        let writer = ConnectionWriter {
            handle: handle.clone(),
            priority_rx,
        };
        (handle, writer)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn buffered_bytes(&self) -> usize {
        self.buffered_bytes.load(Ordering::Acquire)
    }

    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock().unwrap()
    }

    /// Remember the dialect of the last inbound message so pushed events
    /// speak the client's language.
    pub fn set_dialect(&self, dialect: Dialect) {
        *self.dialect.lock().unwrap() = dialect;
    }

    pub fn dialect(&self) -> Dialect {
        *self.dialect.lock().unwrap()
    }

    /// Queue a response or control message.
    ///
    /// Returns false when the connection is closed or the outbound buffer
    /// blew past the cap (in which case the connection is dropped with
    /// reason BACKPRESSURE).
    pub fn send(&self, message: OutboundMessage) -> bool {
        if self.is_closed() {
            return false;
        }
        let bytes = message.byte_len();
        let buffered = self.buffered_bytes.fetch_add(bytes, Ordering::AcqRel) + bytes;
        if buffered > self.max_buffered_bytes {
            warn!(conn = %self.id, buffered, "outbound buffer overflow, dropping connection");
            self.buffered_bytes.fetch_sub(bytes, Ordering::AcqRel);
            self.close("BACKPRESSURE");
            return false;
        }
        if self.priority_tx.send(message).is_err() {
            self.buffered_bytes.fetch_sub(bytes, Ordering::AcqRel);
            return false;
        }
        true
    }

    /// Queue an event frame, rendered in the connection's dialect.
    ///
    /// Events are droppable: when the event queue exceeds the buffer cap the
    /// oldest queued event is discarded and its `seq` never reaches the
    /// client.
    pub fn send_event(&self, frame: &Frame) -> bool {
        if self.is_closed() {
            return false;
        }
        let rendered = compat::render_event(self.dialect(), frame);
        let text = match serde_json::to_string(&rendered) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = %self.id, error = %e, "failed to serialize event");
                return false;
            }
        };
        let bytes = text.len();

        let mut events = self.events.lock().unwrap();
        events.push_back(QueuedEvent {
            message: OutboundMessage::Text(text),
            bytes,
        });
        self.buffered_bytes.fetch_add(bytes, Ordering::AcqRel);

        while self.buffered_bytes.load(Ordering::Acquire) > self.max_buffered_bytes {
            match events.pop_front() {
                Some(dropped) => {
                    self.buffered_bytes.fetch_sub(dropped.bytes, Ordering::AcqRel);
                    debug!(conn = %self.id, "event queue overflow, dropped oldest event");
                }
                None => break,
            }
        }
        drop(events);

        self.event_notify.notify_one();
        true
    }

    /// Queue a response frame in the connection's current dialect.
    pub fn send_response(&self, dialect: Dialect, frame: &Frame) -> bool {
        let rendered = compat::render_response(dialect, frame);
        match serde_json::to_string(&rendered) {
            Ok(text) => self.send(OutboundMessage::Text(text)),
            Err(e) => {
                warn!(conn = %self.id, error = %e, "failed to serialize response");
                false
            }
        }
    }

    /// Queue a pre-rendered batch of response values.
    pub fn send_rendered_batch(&self, rendered: Vec<Value>) -> bool {
        let text = match serde_json::to_string(&Value::Array(rendered)) {
            Ok(text) => text,
            Err(e) => {
                warn!(conn = %self.id, error = %e, "failed to serialize batch");
                return false;
            }
        };
        self.send(OutboundMessage::Text(text))
    }

    /// Close the connection: emit a close frame, cancel in-flight handlers,
    /// and wake the writer so it can drain out.
    pub fn close(&self, reason: &str) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.priority_tx.send(OutboundMessage::Close {
            reason: reason.to_string(),
        });
        self.cancel.cancel();
        self.event_notify.notify_one();
    }

    fn pop_event(&self) -> Option<OutboundMessage> {
        let mut events = self.events.lock().unwrap();
        events.pop_front().map(|queued| {
            self.buffered_bytes.fetch_sub(queued.bytes, Ordering::AcqRel);
            queued.message
        })
    }
}

/// The writer half: drains responses first, then events.
pub struct ConnectionWriter {
    handle: Arc<ConnectionHandle>,
    priority_rx: mpsc::UnboundedReceiver<OutboundMessage>,
}

impl ConnectionWriter {
    /// Next message to put on the wire, or None when the connection is done.
    ///
    /// Responses and control frames always win over queued events.
    pub async fn next(&mut self) -> Option<OutboundMessage> {
        loop {
            match self.priority_rx.try_recv() {
                Ok(message) => {
                    let bytes = message.byte_len();
                    self.handle.buffered_bytes.fetch_sub(bytes, Ordering::AcqRel);
                    return Some(message);
                }
                Err(mpsc::error::TryRecvError::Disconnected) => return None,
                Err(mpsc::error::TryRecvError::Empty) => {}
            }

            if let Some(message) = self.handle.pop_event() {
                return Some(message);
            }

            if self.handle.is_closed() {
                // Closed and both queues drained above; one final look at the
                // priority channel picks up the close frame.
                match self.priority_rx.try_recv() {
                    Ok(message) => return Some(message),
                    Err(_) => return None,
                }
            }

            tokio::select! {
                message = self.priority_rx.recv() => {
                    match message {
                        Some(message) => {
                            let bytes = message.byte_len();
                            self.handle.buffered_bytes.fetch_sub(bytes, Ordering::AcqRel);
                            return Some(message);
                        }
                        None => return None,
                    }
                }
                _ = self.handle.event_notify.notified() => {}
            }
        }
    }
}

/// Flat table of live connections, indexed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: dashmap::DashMap<ConnectionId, Arc<ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<ConnectionHandle>) {
        self.connections.insert(handle.id, handle);
    }

    pub fn remove(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.remove(&id).map(|(_, handle)| handle)
    }

    pub fn get(&self, id: ConnectionId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(&id).map(|entry| entry.clone())
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    pub fn ids(&self) -> Vec<ConnectionId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parleyproto::RpcError;

    #[tokio::test]
    async fn responses_flow_through_writer() {
        let (handle, mut writer) = ConnectionHandle::channel(1024);
        assert!(handle.send(OutboundMessage::Text("one".into())));
        assert!(handle.send(OutboundMessage::Text("two".into())));

        assert_eq!(writer.next().await, Some(OutboundMessage::Text("one".into())));
        assert_eq!(writer.next().await, Some(OutboundMessage::Text("two".into())));
        assert_eq!(handle.buffered_bytes(), 0);
    }

    #[tokio::test]
    async fn responses_win_over_events() {
        let (handle, mut writer) = ConnectionHandle::channel(4096);
        handle.send_event(&Frame::event("e", serde_json::json!({}), Some(1)));
        handle.send(OutboundMessage::Text("response".into()));

        assert_eq!(
            writer.next().await,
            Some(OutboundMessage::Text("response".into()))
        );
        assert!(matches!(writer.next().await, Some(OutboundMessage::Text(_))));
    }

    #[tokio::test]
    async fn event_overflow_drops_oldest() {
        let (handle, mut writer) = ConnectionHandle::channel(200);
        for seq in 1..=20u64 {
            handle.send_event(&Frame::event(
                "session.output",
                serde_json::json!({"chunk": "x".repeat(20)}),
                Some(seq),
            ));
        }

        // The first event out should no longer be seq 1.
        let Some(OutboundMessage::Text(text)) = writer.next().await else {
            panic!("expected an event");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert!(value["seq"].as_u64().unwrap() > 1, "oldest events were kept");
        assert!(!handle.is_closed(), "event overflow must not close the connection");
    }

    #[tokio::test]
    async fn response_overflow_closes_connection() {
        let (handle, mut writer) = ConnectionHandle::channel(64);
        assert!(handle.send(OutboundMessage::Text("x".repeat(40))));
        // Second response blows the cap.
        assert!(!handle.send(OutboundMessage::Text("y".repeat(40))));
        assert!(handle.is_closed());
        assert!(handle.cancel.is_cancelled());

        // The first message and the close frame still drain.
        assert!(matches!(writer.next().await, Some(OutboundMessage::Text(_))));
        assert_eq!(
            writer.next().await,
            Some(OutboundMessage::Close { reason: "BACKPRESSURE".into() })
        );
        assert_eq!(writer.next().await, None);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_cancels() {
        let (handle, mut writer) = ConnectionHandle::channel(1024);
        handle.close("shutdown");
        handle.close("shutdown");

        assert_eq!(
            writer.next().await,
            Some(OutboundMessage::Close { reason: "shutdown".into() })
        );
        assert_eq!(writer.next().await, None);
        assert!(!handle.send(OutboundMessage::Text("late".into())));
    }

    #[tokio::test]
    async fn events_render_in_connection_dialect() {
        let (handle, mut writer) = ConnectionHandle::channel(4096);
        handle.set_dialect(Dialect::JsonRpc2);
        handle.send_event(&Frame::event("node.dead", serde_json::json!({"nodeId": "a"}), None));

        let Some(OutboundMessage::Text(text)) = writer.next().await else {
            panic!("expected an event");
        };
        let value: serde_json::Value = serde_json::from_str(&text).unwrap();
        assert_eq!(value["jsonrpc"], "2.0");
        assert_eq!(value["method"], "node.dead");
    }

    #[test]
    fn registry_resolves_and_cleans_up() {
        let registry = ConnectionRegistry::new();
        let (handle, _writer) = ConnectionHandle::channel(1024);
        let id = handle.id;

        registry.register(handle);
        assert_eq!(registry.count(), 1);
        assert!(registry.get(id).is_some());

        registry.remove(id);
        assert_eq!(registry.count(), 0);
        assert!(registry.get(id).is_none());
    }

    #[test]
    fn error_response_renders() {
        let (handle, _writer) = ConnectionHandle::channel(1024);
        let frame = Frame::err(serde_json::json!("r1"), RpcError::internal("boom"));
        assert!(handle.send_response(Dialect::V2, &frame));
    }
}
