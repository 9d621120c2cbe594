//! Glob-matched event subscriptions.
//!
//! A subscription is a `(connection, pattern)` pair with an optional
//! equality filter over payload fields. Patterns use dot-separated segments
//! where `*` matches one segment and `**` matches any number
//! (`session.*.output`, `node.**`). Patterns compile once at subscribe time.
//!
//! Dispatch resolves connection ids through the registry and hands each
//! match an Event frame with a per-(connection, subscription) monotonic
//! `seq`. Delivery is best-effort: a subscriber whose send queue overflows
//! loses its oldest queued event and the `seq` gap marks the loss.

use crate::router::{ConnectionId, ConnectionRegistry};
use dashmap::DashMap;
use globset::{GlobBuilder, GlobMatcher};
use parleyproto::Frame;
use serde_json::Value;
use std::sync::{Arc, Mutex};
use tracing::debug;
use uuid::Uuid;

/// Subscription identifier handed back to the client.
pub type SubscriptionId = Uuid;

/// Errors from subscribe/unsubscribe.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("Invalid pattern {pattern:?}: {message}")]
    InvalidPattern { pattern: String, message: String },
    #[error("Unknown subscription {0}")]
    UnknownSubscription(SubscriptionId),
}

struct Subscription {
    connection_id: ConnectionId,
    subscription_id: SubscriptionId,
    pattern: String,
    matcher: GlobMatcher,
    filter: Option<serde_json::Map<String, Value>>,
    /// Monotonic per-(connection, subscription) sequence. Held while the
    /// event is enqueued so seq order matches queue order.
    seq: Mutex<u64>,
}

impl Subscription {
    fn matches(&self, event: &str, payload: &Value) -> bool {
        if !self.matcher.is_match(segments_as_path(event)) {
            return false;
        }
        match &self.filter {
            None => true,
            Some(filter) => filter
                .iter()
                .all(|(key, expected)| payload.get(key) == Some(expected)),
        }
    }
}

/// Maintains subscriptions and fans events out to interested connections.
pub struct SubscriptionManager {
    subscriptions: DashMap<SubscriptionId, Arc<Subscription>>,
}

impl Default for SubscriptionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SubscriptionManager {
    pub fn new() -> Self {
        Self {
            subscriptions: DashMap::new(),
        }
    }

    /// Subscribe a connection to an event pattern.
    ///
    /// A duplicate `(connection, pattern)` collapses to the existing
    /// subscription id rather than double-delivering.
    pub fn subscribe(
        &self,
        connection_id: ConnectionId,
        pattern: &str,
        filter: Option<serde_json::Map<String, Value>>,
    ) -> Result<SubscriptionId, SubscribeError> {
        if let Some(existing) = self.subscriptions.iter().find(|entry| {
            entry.connection_id == connection_id
                && entry.pattern == pattern
                && entry.filter == filter
        }) {
            return Ok(existing.subscription_id);
        }

        let matcher = compile_pattern(pattern)?;
        let subscription_id = Uuid::new_v4();
        self.subscriptions.insert(
            subscription_id,
            Arc::new(Subscription {
                connection_id,
                subscription_id,
                pattern: pattern.to_string(),
                matcher,
                filter,
                seq: Mutex::new(0),
            }),
        );
        debug!(conn = %connection_id, pattern, %subscription_id, "subscribed");
        Ok(subscription_id)
    }

    /// Remove one subscription; the caller must own it.
    pub fn unsubscribe(
        &self,
        connection_id: ConnectionId,
        subscription_id: SubscriptionId,
    ) -> Result<(), SubscribeError> {
        let owned = self
            .subscriptions
            .get(&subscription_id)
            .is_some_and(|entry| entry.connection_id == connection_id);
        if !owned {
            return Err(SubscribeError::UnknownSubscription(subscription_id));
        }
        self.subscriptions.remove(&subscription_id);
        Ok(())
    }

    /// Drop every subscription a connection owns. Called on disconnect.
    pub fn remove_connection(&self, connection_id: ConnectionId) -> usize {
        let before = self.subscriptions.len();
        self.subscriptions
            .retain(|_, subscription| subscription.connection_id != connection_id);
        before - self.subscriptions.len()
    }

    /// Deliver an event to every matching subscription.
    ///
    /// Returns the number of queued deliveries.
    pub fn dispatch(&self, event: &str, payload: &Value, registry: &ConnectionRegistry) -> usize {
        let matches: Vec<Arc<Subscription>> = self
            .subscriptions
            .iter()
            .filter(|entry| entry.matches(event, payload))
            .map(|entry| entry.clone())
            .collect();

        let mut delivered = 0;
        for subscription in matches {
            let Some(handle) = registry.get(subscription.connection_id) else {
                continue;
            };
            let mut seq = subscription.seq.lock().unwrap();
            *seq += 1;
            let frame = Frame::event(event, payload.clone(), Some(*seq));
            if handle.send_event(&frame) {
                delivered += 1;
            }
        }
        delivered
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Patterns a connection currently holds, for `health.status` output.
    pub fn patterns_for(&self, connection_id: ConnectionId) -> Vec<(SubscriptionId, String)> {
        self.subscriptions
            .iter()
            .filter(|entry| entry.connection_id == connection_id)
            .map(|entry| (entry.subscription_id, entry.pattern.clone()))
            .collect()
    }
}

/// Publisher handle combining the subscription table with the connection
/// registry, so producers (sessions, health bridge, handlers) can fan an
/// event out without holding either piece directly.
#[derive(Clone)]
pub struct EventBus {
    subscriptions: Arc<SubscriptionManager>,
    registry: Arc<ConnectionRegistry>,
}

impl EventBus {
    pub fn new(subscriptions: Arc<SubscriptionManager>, registry: Arc<ConnectionRegistry>) -> Self {
        Self {
            subscriptions,
            registry,
        }
    }

    /// Deliver an event to every matching subscription.
    pub fn publish(&self, event: &str, payload: Value) -> usize {
        self.subscriptions.dispatch(event, &payload, &self.registry)
    }
}

/// Compile a dot-separated glob to a matcher.
///
/// Globset treats `/` as the segment separator, so patterns and event names
/// are translated dot-to-slash before matching; `*` then stays within one
/// segment and `**` spans any number.
fn compile_pattern(pattern: &str) -> Result<GlobMatcher, SubscribeError> {
    GlobBuilder::new(&segments_as_path(pattern))
        .literal_separator(true)
        .build()
        .map(|glob| glob.compile_matcher())
        .map_err(|e| SubscribeError::InvalidPattern {
            pattern: pattern.to_string(),
            message: e.to_string(),
        })
}

fn segments_as_path(name: &str) -> String {
    name.replace('.', "/")
}
