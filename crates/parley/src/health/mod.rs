//! Cluster health monitoring and failover.
//!
//! The monitor periodically probes every registered peer node, tracks
//! consecutive results, drives a per-node circuit breaker, and opens a
//! failover plan when a node is declared dead. Listeners subscribe to an
//! opaque broadcast handle; there is no inheritance anywhere, only a
//! listener table.
//!
//! State transitions are serialized per node: every mutation goes through
//! the node's map entry, so no observer sees interleaved flips for the same
//! node.

pub mod circuit;
pub mod failover;

pub use circuit::{CircuitBreaker, CircuitState};
pub use failover::{FailoverPlan, Migration, PlanStatus};

use async_trait::async_trait;
use dashmap::DashMap;
use parleyconf::HealthConfig;
use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Health-state change notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HealthEvent {
    NodeHealthy { node_id: String },
    NodeUnhealthy { node_id: String },
    NodeRecovered { node_id: String },
    NodeDead { node_id: String },
}

impl HealthEvent {
    /// The subscription-manager event name for this notification.
    pub fn event_name(&self) -> &'static str {
        match self {
            HealthEvent::NodeHealthy { .. } => "node.healthy",
            HealthEvent::NodeUnhealthy { .. } => "node.unhealthy",
            HealthEvent::NodeRecovered { .. } => "node.recovered",
            HealthEvent::NodeDead { .. } => "node.dead",
        }
    }

    pub fn node_id(&self) -> &str {
        match self {
            HealthEvent::NodeHealthy { node_id }
            | HealthEvent::NodeUnhealthy { node_id }
            | HealthEvent::NodeRecovered { node_id }
            | HealthEvent::NodeDead { node_id } => node_id,
        }
    }
}

/// Probe flavors, in the kubernetes sense.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeKind {
    Liveness,
    Readiness,
    Startup,
}

/// A registered peer node.
#[derive(Debug, Clone, Serialize)]
pub struct NodeInfo {
    pub node_id: String,
    pub base_url: String,
}

/// Checks one node. The default implementation speaks HTTP; tests plug in
/// scripted probes.
#[async_trait]
pub trait NodeProbe: Send + Sync {
    async fn check(&self, node: &NodeInfo, kind: ProbeKind) -> Result<(), String>;
}

/// HTTP probe hitting the conventional endpoints on each node.
pub struct HttpProbe {
    client: reqwest::Client,
}

impl HttpProbe {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_default();
        Self { client }
    }

    fn path(kind: ProbeKind) -> &'static str {
        match kind {
            ProbeKind::Liveness => "/healthz",
            ProbeKind::Readiness => "/readyz",
            ProbeKind::Startup => "/startupz",
        }
    }
}

#[async_trait]
impl NodeProbe for HttpProbe {
    async fn check(&self, node: &NodeInfo, kind: ProbeKind) -> Result<(), String> {
        let url = format!("{}{}", node.base_url.trim_end_matches('/'), Self::path(kind));
        let response = self.client.get(&url).send().await.map_err(|e| e.to_string())?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(format!("{} returned {}", url, response.status()))
        }
    }
}

/// Snapshot of one node's health, as reported by `health.status`.
#[derive(Debug, Clone, Serialize)]
pub struct NodeHealth {
    pub node_id: String,
    pub healthy: bool,
    pub dead: bool,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub circuit_state: CircuitState,
    pub last_error: Option<String>,
    /// Startup probe has passed at least once.
    pub started: bool,
}

struct NodeEntry {
    info: NodeInfo,
    healthy: bool,
    dead: bool,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_error: Option<String>,
    started: bool,
    breaker: CircuitBreaker,
}

/// Monitors registered nodes and gates federated delegation.
pub struct HealthMonitor {
    config: HealthConfig,
    nodes: DashMap<String, NodeEntry>,
    plans: DashMap<String, FailoverPlan>,
    events: broadcast::Sender<HealthEvent>,
}

impl HealthMonitor {
    pub fn new(config: HealthConfig) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            config,
            nodes: DashMap::new(),
            plans: DashMap::new(),
            events,
        }
    }

    /// Subscribe to health-state change events.
    pub fn subscribe(&self) -> broadcast::Receiver<HealthEvent> {
        self.events.subscribe()
    }

    /// Register a node; replaces any previous registration under the id.
    pub fn register_node(&self, node_id: &str, base_url: &str) {
        info!(node_id, base_url, "node registered");
        self.nodes.insert(
            node_id.to_string(),
            NodeEntry {
                info: NodeInfo {
                    node_id: node_id.to_string(),
                    base_url: base_url.to_string(),
                },
                healthy: true,
                dead: false,
                consecutive_failures: 0,
                consecutive_successes: 0,
                last_error: None,
                started: false,
                breaker: CircuitBreaker::new(self.config.circuit.clone()),
            },
        );
    }

    pub fn unregister_node(&self, node_id: &str) {
        self.nodes.remove(node_id);
        self.plans.remove(node_id);
    }

    pub fn node_ids(&self) -> Vec<String> {
        self.nodes.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn node_url(&self, node_id: &str) -> Option<String> {
        self.nodes.get(node_id).map(|entry| entry.info.base_url.clone())
    }

    /// Apply one aggregated check result for a node.
    ///
    /// Returns the events the transition produced (already broadcast).
    pub fn apply_check(&self, node_id: &str, success: bool, error: Option<String>) -> Vec<HealthEvent> {
        let mut emitted = Vec::new();
        {
            let Some(mut entry) = self.nodes.get_mut(node_id) else {
                return emitted;
            };

            if success {
                entry.consecutive_successes += 1;
                entry.consecutive_failures = 0;
                entry.last_error = None;

                if !entry.healthy && entry.consecutive_successes >= self.config.success_threshold {
                    entry.healthy = true;
                    let was_dead = std::mem::replace(&mut entry.dead, false);
                    info!(node_id, "node healthy again");
                    if was_dead {
                        emitted.push(HealthEvent::NodeRecovered {
                            node_id: node_id.to_string(),
                        });
                    }
                    emitted.push(HealthEvent::NodeHealthy {
                        node_id: node_id.to_string(),
                    });
                }
            } else {
                entry.consecutive_failures += 1;
                entry.consecutive_successes = 0;
                entry.last_error = error;

                if entry.healthy && entry.consecutive_failures >= self.config.failure_threshold {
                    entry.healthy = false;
                    warn!(
                        node_id,
                        failures = entry.consecutive_failures,
                        "node unhealthy"
                    );
                    emitted.push(HealthEvent::NodeUnhealthy {
                        node_id: node_id.to_string(),
                    });
                }

                // Continued failure past the unhealthy flip escalates to dead.
                if !entry.dead
                    && entry.consecutive_failures >= self.config.failure_threshold * 2
                {
                    entry.dead = true;
                    warn!(node_id, "node declared dead");
                    emitted.push(HealthEvent::NodeDead {
                        node_id: node_id.to_string(),
                    });
                }
            }
        }

        for event in &emitted {
            if matches!(event, HealthEvent::NodeDead { .. }) && self.config.failover.enabled {
                self.open_failover_plan(event.node_id());
            }
            let _ = self.events.send(event.clone());
        }
        emitted
    }

    /// Record the outcome of an outbound RPC to a node, feeding its breaker.
    pub fn record_outcome(&self, node_id: &str, success: bool) {
        self.record_outcome_at(node_id, success, Instant::now());
    }

    pub fn record_outcome_at(&self, node_id: &str, success: bool, now: Instant) {
        if let Some(mut entry) = self.nodes.get_mut(node_id) {
            entry.breaker.record(success, now);
        }
    }

    /// May the router delegate to this node right now?
    ///
    /// False for unknown or unhealthy nodes and while the breaker refuses.
    pub fn is_node_available(&self, node_id: &str) -> bool {
        self.is_node_available_at(node_id, Instant::now())
    }

    pub fn is_node_available_at(&self, node_id: &str, now: Instant) -> bool {
        let Some(mut entry) = self.nodes.get_mut(node_id) else {
            return false;
        };
        if !entry.healthy {
            return false;
        }
        if !self.config.circuit.enabled {
            return true;
        }
        entry.breaker.allow_request(now)
    }

    pub fn circuit_state(&self, node_id: &str) -> Option<CircuitState> {
        self.nodes.get(node_id).map(|entry| entry.breaker.state())
    }

    /// Open an empty failover plan for a dead node; the caller fills it via
    /// [`HealthMonitor::assign_failover`]. At most one active plan per node.
    pub fn open_failover_plan(&self, node_id: &str) {
        if self.plans.contains_key(node_id) {
            return;
        }
        info!(node_id, "failover plan opened");
        self.plans.insert(
            node_id.to_string(),
            FailoverPlan::new(node_id, BTreeMap::new(), Instant::now()),
        );
    }

    /// Fill a plan's session-to-target assignments.
    pub fn assign_failover(
        &self,
        node_id: &str,
        assignments: BTreeMap<String, String>,
    ) -> Option<PlanStatus> {
        let mut plan = self.plans.get_mut(node_id)?;
        if plan.status != PlanStatus::Planned || !plan.migrations.is_empty() {
            return Some(plan.status);
        }
        *plan = FailoverPlan::new(node_id, assignments, Instant::now());
        Some(plan.status)
    }

    /// Report one migration outcome; terminal plans are cleared.
    pub fn report_migration(&self, node_id: &str, session_id: &str, success: bool) -> Option<PlanStatus> {
        let status = {
            let mut plan = self.plans.get_mut(node_id)?;
            plan.report(session_id, success)
        };
        if status.is_terminal() {
            info!(node_id, ?status, "failover plan resolved");
            self.plans.remove(node_id);
        }
        Some(status)
    }

    pub fn active_plan(&self, node_id: &str) -> Option<FailoverPlan> {
        self.plans.get(node_id).map(|plan| plan.clone())
    }

    /// Expire plans that sat unresolved past the migration deadline.
    pub fn sweep_plans(&self) -> Vec<String> {
        self.sweep_plans_at(Instant::now())
    }

    pub fn sweep_plans_at(&self, now: Instant) -> Vec<String> {
        let deadline = Duration::from_millis(self.config.failover.migration_timeout_ms);
        let timed_out: Vec<String> = self
            .plans
            .iter_mut()
            .filter_map(|mut plan| {
                let node_id = plan.node_id.clone();
                (plan.check_timeout(now, deadline) == PlanStatus::Timeout).then_some(node_id)
            })
            .collect();

        for node_id in &timed_out {
            warn!(node_id, "failover plan timed out");
            self.plans.remove(node_id);
        }
        timed_out
    }

    /// Per-node snapshots for `health.status`.
    pub fn snapshot(&self) -> Vec<NodeHealth> {
        let mut nodes: Vec<NodeHealth> = self
            .nodes
            .iter()
            .map(|entry| NodeHealth {
                node_id: entry.info.node_id.clone(),
                healthy: entry.healthy,
                dead: entry.dead,
                consecutive_failures: entry.consecutive_failures,
                consecutive_successes: entry.consecutive_successes,
                circuit_state: entry.breaker.state(),
                last_error: entry.last_error.clone(),
                started: entry.started,
            })
            .collect();
        nodes.sort_by(|a, b| a.node_id.cmp(&b.node_id));
        nodes
    }

    /// Run the probe loop until cancelled.
    pub async fn run(&self, probe: std::sync::Arc<dyn NodeProbe>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(Duration::from_millis(self.config.interval_ms));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        info!(interval_ms = self.config.interval_ms, "health monitor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.run_checks(probe.as_ref()).await;
                    self.sweep_plans();
                }
                _ = cancel.cancelled() => {
                    info!("health monitor shutting down");
                    break;
                }
            }
        }
    }

    /// One round of probes against every registered node.
    pub async fn run_checks(&self, probe: &dyn NodeProbe) {
        let timeout = Duration::from_millis(self.config.probe_timeout_ms);

        for node_id in self.node_ids() {
            let Some((info, started)) = self
                .nodes
                .get(&node_id)
                .map(|entry| (entry.info.clone(), entry.started))
            else {
                continue;
            };

            let mut kinds = Vec::new();
            if self.config.probes.liveness {
                kinds.push(ProbeKind::Liveness);
            }
            if self.config.probes.readiness {
                kinds.push(ProbeKind::Readiness);
            }
            if self.config.probes.startup && !started {
                kinds.push(ProbeKind::Startup);
            }

            let mut failure: Option<String> = None;
            for kind in kinds {
                let result = tokio::time::timeout(timeout, probe.check(&info, kind)).await;
                match result {
                    Ok(Ok(())) => {
                        if kind == ProbeKind::Startup {
                            if let Some(mut entry) = self.nodes.get_mut(&node_id) {
                                entry.started = true;
                            }
                        }
                    }
                    Ok(Err(message)) => {
                        failure = Some(format!("{:?} probe failed: {}", kind, message));
                        break;
                    }
                    Err(_) => {
                        // A timed-out probe counts as a failure.
                        failure = Some(format!("{:?} probe timed out", kind));
                        break;
                    }
                }
            }

            debug!(node_id = %node_id, ok = failure.is_none(), "probe round");
            self.apply_check(&node_id, failure.is_none(), failure);
        }
    }
}
