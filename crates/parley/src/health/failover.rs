//! Session-migration failover plans.
//!
//! When a node is declared dead, the monitor opens one plan for it. The
//! caller fills in the sessions to move and their target nodes; each
//! migration reports back success or failure. The plan resolves to
//! `completed` when every migration succeeds, `failed` on any miss, or
//! `timeout` when it sits unresolved past the migration deadline.

use serde::Serialize;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

/// Terminal and non-terminal plan states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanStatus {
    Planned,
    Executing,
    Completed,
    Failed,
    Timeout,
}

impl PlanStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, PlanStatus::Completed | PlanStatus::Failed | PlanStatus::Timeout)
    }
}

/// One session's migration assignment and outcome.
#[derive(Debug, Clone, Serialize)]
pub struct Migration {
    pub session_id: String,
    pub target_node: String,
    pub outcome: Option<bool>,
}

/// A one-shot record tracking migration of sessions off a failed node.
#[derive(Debug, Clone, Serialize)]
pub struct FailoverPlan {
    pub node_id: String,
    pub status: PlanStatus,
    /// Deterministic ascending session-id order.
    pub migrations: Vec<Migration>,
    pub completed: usize,
    pub failed: usize,
    #[serde(skip)]
    opened_at: Instant,
}

impl FailoverPlan {
    /// Open a plan with target assignments. Sessions migrate in ascending
    /// session-id order regardless of map iteration order.
    pub fn new(node_id: &str, assignments: BTreeMap<String, String>, opened_at: Instant) -> Self {
        let migrations = assignments
            .into_iter()
            .map(|(session_id, target_node)| Migration {
                session_id,
                target_node,
                outcome: None,
            })
            .collect();
        Self {
            node_id: node_id.to_string(),
            status: PlanStatus::Planned,
            migrations,
            completed: 0,
            failed: 0,
            opened_at,
        }
    }

    /// Record one migration's outcome.
    ///
    /// Returns the plan status afterwards. Unknown sessions and duplicate
    /// reports are ignored; a terminal plan never changes again.
    pub fn report(&mut self, session_id: &str, success: bool) -> PlanStatus {
        if self.status.is_terminal() {
            return self.status;
        }

        let Some(migration) = self
            .migrations
            .iter_mut()
            .find(|m| m.session_id == session_id && m.outcome.is_none())
        else {
            return self.status;
        };

        migration.outcome = Some(success);
        if success {
            self.completed += 1;
        } else {
            self.failed += 1;
        }
        self.status = PlanStatus::Executing;

        if self.completed + self.failed == self.migrations.len() {
            self.status = if self.failed == 0 {
                PlanStatus::Completed
            } else {
                PlanStatus::Failed
            };
        }
        self.status
    }

    /// Transition to `timeout` if the deadline has passed.
    pub fn check_timeout(&mut self, now: Instant, deadline: Duration) -> PlanStatus {
        if !self.status.is_terminal() && now.duration_since(self.opened_at) >= deadline {
            self.status = PlanStatus::Timeout;
        }
        self.status
    }
}
