//! Outbound delegation to federated peer daemons.
//!
//! Delegations are gated by the health monitor (`is_node_available` covers
//! node health and the circuit breaker) and every call carries the W3C
//! `traceparent` header plus trace ids in the payload. Cluster failures
//! never leak raw: callers map them to CANCELLED or INTERNAL_ERROR before
//! anything reaches the original client.

use crate::health::HealthMonitor;
use crate::trace::{SpanStatus, TraceContext, Tracer};
use parleyproto::{ErrorCode, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Why a delegation failed.
#[derive(Debug, thiserror::Error)]
pub enum FederationError {
    #[error("node {0} is unavailable")]
    NodeUnavailable(String),
    #[error("node {0} is not registered")]
    UnknownNode(String),
    #[error("transport error talking to {node}: {message}")]
    Transport { node: String, message: String },
    #[error("peer {node} answered {status}")]
    PeerStatus { node: String, status: u16 },
}

impl FederationError {
    /// The sanitized error surfaced to the original caller.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            FederationError::NodeUnavailable(_) | FederationError::UnknownNode(_) => {
                RpcError::new(ErrorCode::Cancelled, "peer delegation unavailable")
            }
            FederationError::Transport { .. } | FederationError::PeerStatus { .. } => {
                RpcError::new(ErrorCode::InternalError, "peer delegation failed")
            }
        }
    }
}

/// Thin outbound client for peer daemons.
pub struct FederationClient {
    client: reqwest::Client,
    health: Arc<HealthMonitor>,
    tracer: Arc<Tracer>,
}

impl FederationClient {
    pub fn new(health: Arc<HealthMonitor>, tracer: Arc<Tracer>, timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self {
            client,
            health,
            tracer,
        }
    }

    /// Delegate one call to a peer, recording the outcome in its breaker.
    pub async fn call(
        &self,
        node_id: &str,
        method: &str,
        params: Value,
        parent: &TraceContext,
    ) -> Result<Value, FederationError> {
        if !self.health.is_node_available(node_id) {
            debug!(node_id, method, "delegation refused, node unavailable");
            return Err(FederationError::NodeUnavailable(node_id.to_string()));
        }
        let base_url = self
            .health
            .node_url(node_id)
            .ok_or_else(|| FederationError::UnknownNode(node_id.to_string()))?;

        let span = self.tracer.start_span("federation.call", parent);
        self.tracer
            .set_attr(&span, "peer", Value::String(node_id.to_string()));
        self.tracer
            .set_attr(&span, "method", Value::String(method.to_string()));

        let mut payload = json!({ "method": method, "params": params });
        Tracer::inject_payload(&span, &mut payload);

        let url = format!("{}/rpc", base_url.trim_end_matches('/'));
        let result = self
            .client
            .post(&url)
            .header("traceparent", span.traceparent())
            .json(&payload)
            .send()
            .await;

        let outcome = match result {
            Ok(response) if response.status().is_success() => {
                match response.json::<Value>().await {
                    Ok(body) => Ok(body),
                    Err(e) => Err(FederationError::Transport {
                        node: node_id.to_string(),
                        message: e.to_string(),
                    }),
                }
            }
            Ok(response) => Err(FederationError::PeerStatus {
                node: node_id.to_string(),
                status: response.status().as_u16(),
            }),
            Err(e) => Err(FederationError::Transport {
                node: node_id.to_string(),
                message: e.to_string(),
            }),
        };

        self.health.record_outcome(node_id, outcome.is_ok());
        match &outcome {
            Ok(_) => self.tracer.end_span(&span, SpanStatus::Ok),
            Err(e) => {
                warn!(node_id, method, error = %e, "delegation failed");
                self.tracer.end_span(&span, SpanStatus::Error);
            }
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parleyconf::{HealthConfig, TraceConfig};

    #[tokio::test]
    async fn unknown_node_refused_before_any_io() {
        let health = Arc::new(HealthMonitor::new(HealthConfig::default()));
        let tracer = Arc::new(Tracer::new(TraceConfig::default()));
        let client = FederationClient::new(health, tracer.clone(), Duration::from_millis(100));

        let parent = tracer.start_trace("test");
        let err = client
            .call("ghost", "session.status", json!({}), &parent)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::NodeUnavailable(_)));
        assert_eq!(err.to_rpc_error().code, ErrorCode::Cancelled);
    }

    #[tokio::test]
    async fn transport_failure_feeds_the_breaker() {
        let health = Arc::new(HealthMonitor::new(HealthConfig::default()));
        // Nothing listens on this port.
        health.register_node("p", "http://127.0.0.1:1");
        let tracer = Arc::new(Tracer::new(TraceConfig::default()));
        let client =
            FederationClient::new(health.clone(), tracer.clone(), Duration::from_millis(200));

        let parent = tracer.start_trace("test");
        for _ in 0..5 {
            let err = client
                .call("p", "health.ping", json!({}), &parent)
                .await
                .unwrap_err();
            assert_eq!(err.to_rpc_error().code, ErrorCode::InternalError);
        }

        // Five straight failures tripped the breaker; further calls are
        // refused without touching the network.
        assert!(!health.is_node_available("p"));
        let err = client
            .call("p", "health.ping", json!({}), &parent)
            .await
            .unwrap_err();
        assert!(matches!(err, FederationError::NodeUnavailable(_)));
    }
}
