//! Session manager - volatile lifecycle of agent sessions, prompts,
//! spawned agents, and pending tool approvals.
//!
//! All state lives in memory and dies with the daemon. Streamed output
//! reaches clients through the event bus as `session.output` events; the
//! subscription manager handles fan-out and ordering.

use super::backend::{AgentBackend, AgentEvent};
use super::types::{
    AgentInfo, AgentStatus, PendingTool, PromptId, SessionId, SessionInfo, SessionStatus,
};
use crate::subscriptions::EventBus;
use chrono::Utc;
use dashmap::DashMap;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use uuid::Uuid;

/// Session/prompt/agent operation failures, mapped by the rpc layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),
    #[error("session {0} is stopped")]
    SessionStopped(SessionId),
    #[error("session {0} is already working a prompt")]
    SessionBusy(SessionId),
    #[error("no prompt in flight for session {0}")]
    NoActivePrompt(SessionId),
    #[error("agent not found: {0}")]
    AgentNotFound(String),
    #[error("no pending tool call: {0}")]
    ToolCallNotFound(String),
}

struct SessionRecord {
    info: SessionInfo,
    active_prompt: Option<(PromptId, CancellationToken)>,
}

struct AgentRecord {
    info: AgentInfo,
    cancel: CancellationToken,
}

/// Owns all volatile session state.
pub struct SessionManager {
    backend: Arc<dyn AgentBackend>,
    bus: EventBus,
    sessions: DashMap<SessionId, SessionRecord>,
    agents: DashMap<String, AgentRecord>,
    pending_tools: DashMap<String, PendingTool>,
}

impl SessionManager {
    pub fn new(backend: Arc<dyn AgentBackend>, bus: EventBus) -> Self {
        Self {
            backend,
            bus,
            sessions: DashMap::new(),
            agents: DashMap::new(),
            pending_tools: DashMap::new(),
        }
    }

    /// Create a new session owned by `owner`.
    pub fn create(
        &self,
        owner: &str,
        title: Option<String>,
        model: Option<String>,
    ) -> SessionInfo {
        let now = Utc::now();
        let info = SessionInfo {
            session_id: SessionId::generate(),
            title,
            model,
            owner: owner.to_string(),
            status: SessionStatus::Active,
            created_at: now,
            updated_at: now,
            prompt_count: 0,
        };
        info!(session = %info.session_id, owner, "session created");
        self.sessions.insert(
            info.session_id.clone(),
            SessionRecord {
                info: info.clone(),
                active_prompt: None,
            },
        );
        self.bus.publish(
            "session.created",
            json!({ "session_id": info.session_id, "owner": owner }),
        );
        info
    }

    /// Reactivate a stopped session.
    pub fn resume(&self, session_id: &SessionId) -> Result<SessionInfo, SessionError> {
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        record.info.status = SessionStatus::Active;
        record.info.updated_at = Utc::now();
        Ok(record.info.clone())
    }

    /// Stop a session, cancelling any in-flight prompt.
    pub fn stop(&self, session_id: &SessionId) -> Result<SessionInfo, SessionError> {
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        if let Some((prompt_id, cancel)) = record.active_prompt.take() {
            debug!(session = %session_id, prompt = %prompt_id, "cancelling prompt on stop");
            cancel.cancel();
        }
        record.info.status = SessionStatus::Stopped;
        record.info.updated_at = Utc::now();
        let info = record.info.clone();
        drop(record);

        self.bus
            .publish("session.stopped", json!({ "session_id": session_id }));
        Ok(info)
    }

    pub fn list(&self, owner: Option<&str>) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self
            .sessions
            .iter()
            .map(|record| record.info.clone())
            .filter(|info| owner.map_or(true, |o| info.owner == o))
            .collect();
        sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        sessions
    }

    pub fn status(&self, session_id: &SessionId) -> Result<SessionInfo, SessionError> {
        self.sessions
            .get(session_id)
            .map(|record| record.info.clone())
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))
    }

    /// Submit a prompt; streaming starts in the background and the prompt id
    /// returns immediately.
    ///
    /// Output arrives as `session.output` events, terminated by a
    /// `prompt.completed` event. `parent_cancel` ties the work to the
    /// owning connection.
    pub fn submit_prompt(
        self: &Arc<Self>,
        session_id: &SessionId,
        prompt: String,
        parent_cancel: &CancellationToken,
    ) -> Result<PromptId, SessionError> {
        let prompt_id = {
            let mut record = self
                .sessions
                .get_mut(session_id)
                .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
            match record.info.status {
                SessionStatus::Stopped => {
                    return Err(SessionError::SessionStopped(session_id.clone()))
                }
                SessionStatus::Busy => {
                    return Err(SessionError::SessionBusy(session_id.clone()))
                }
                SessionStatus::Active => {}
            }

            let prompt_id = PromptId::generate();
            let cancel = parent_cancel.child_token();
            record.active_prompt = Some((prompt_id.clone(), cancel.clone()));
            record.info.status = SessionStatus::Busy;
            record.info.prompt_count += 1;
            record.info.updated_at = Utc::now();
            prompt_id
        };

        let manager = Arc::clone(self);
        let session = session_id.clone();
        let id = prompt_id.clone();
        tokio::spawn(async move {
            manager.drive_prompt(session, id, prompt).await;
        });

        Ok(prompt_id)
    }

    /// Cancel the in-flight prompt of a session.
    pub fn cancel_prompt(&self, session_id: &SessionId) -> Result<PromptId, SessionError> {
        let mut record = self
            .sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::SessionNotFound(session_id.clone()))?;
        let (prompt_id, cancel) = record
            .active_prompt
            .take()
            .ok_or_else(|| SessionError::NoActivePrompt(session_id.clone()))?;
        cancel.cancel();
        record.info.status = SessionStatus::Active;
        record.info.updated_at = Utc::now();
        Ok(prompt_id)
    }

    async fn drive_prompt(self: Arc<Self>, session_id: SessionId, prompt_id: PromptId, prompt: String) {
        let Some(cancel) = self
            .sessions
            .get(&session_id)
            .and_then(|record| record.active_prompt.as_ref().map(|(_, c)| c.clone()))
        else {
            return;
        };

        let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
        let backend = self.backend.clone();
        let backend_cancel = cancel.clone();
        let prompt_text = prompt.clone();
        let worker = tokio::spawn(async move {
            backend.run_prompt(&prompt_text, tx, backend_cancel).await;
        });

        let mut seq_chunks: u64 = 0;
        let mut outcome = json!({ "reason": "cancelled" });
        loop {
            tokio::select! {
                event = rx.recv() => {
                    match event {
                        Some(AgentEvent::Chunk { text }) => {
                            seq_chunks += 1;
                            self.bus.publish(
                                "session.output",
                                json!({
                                    "session_id": session_id,
                                    "prompt_id": prompt_id,
                                    "chunk": text,
                                    "index": seq_chunks,
                                }),
                            );
                        }
                        Some(AgentEvent::ToolRequest { tool, args }) => {
                            self.raise_tool_request(&session_id, &tool, args);
                        }
                        Some(AgentEvent::Completed { reason }) => {
                            outcome = json!({ "reason": reason, "chunks": seq_chunks });
                        }
                        Some(AgentEvent::Failed { error }) => {
                            outcome = json!({ "reason": "failed", "error": error });
                        }
                        None => break,
                    }
                }
                _ = cancel.cancelled() => {
                    break;
                }
            }
        }
        worker.abort();

        // Prompt finished one way or another; free the session.
        if let Some(mut record) = self.sessions.get_mut(&session_id) {
            if record
                .active_prompt
                .as_ref()
                .is_some_and(|(id, _)| *id == prompt_id)
            {
                record.active_prompt = None;
                if record.info.status == SessionStatus::Busy {
                    record.info.status = SessionStatus::Active;
                }
                record.info.updated_at = Utc::now();
            }
        }

        let mut payload = json!({ "session_id": session_id, "prompt_id": prompt_id });
        if let (Some(map), Some(extra)) = (payload.as_object_mut(), outcome.as_object()) {
            for (key, value) in extra {
                map.insert(key.clone(), value.clone());
            }
        }
        self.bus.publish("prompt.completed", payload);
    }

    fn raise_tool_request(&self, session_id: &SessionId, tool: &str, args: serde_json::Value) {
        let pending = PendingTool {
            tool_call_id: format!("tool-{}", Uuid::new_v4().simple()),
            session_id: session_id.clone(),
            tool: tool.to_string(),
            args,
            requested_at: Utc::now(),
        };
        self.bus.publish(
            "tool.requested",
            json!({
                "tool_call_id": pending.tool_call_id,
                "session_id": session_id,
                "tool": pending.tool,
                "args": pending.args,
            }),
        );
        self.pending_tools
            .insert(pending.tool_call_id.clone(), pending);
    }

    /// Approve or deny a pending tool call.
    pub fn decide_tool(&self, tool_call_id: &str, approve: bool) -> Result<PendingTool, SessionError> {
        let (_, pending) = self
            .pending_tools
            .remove(tool_call_id)
            .ok_or_else(|| SessionError::ToolCallNotFound(tool_call_id.to_string()))?;
        self.bus.publish(
            if approve { "tool.approved" } else { "tool.denied" },
            json!({
                "tool_call_id": pending.tool_call_id,
                "session_id": pending.session_id,
                "tool": pending.tool,
            }),
        );
        Ok(pending)
    }

    pub fn pending_tools(&self) -> Vec<PendingTool> {
        self.pending_tools
            .iter()
            .map(|entry| entry.clone())
            .collect()
    }

    /// Spawn a background agent working on `task`.
    pub fn spawn_agent(
        self: &Arc<Self>,
        task: String,
        session_id: Option<SessionId>,
        parent_cancel: &CancellationToken,
    ) -> AgentInfo {
        let info = AgentInfo {
            agent_id: format!("agent-{}", Uuid::new_v4().simple()),
            session_id,
            task: task.clone(),
            status: AgentStatus::Running,
            spawned_at: Utc::now(),
        };
        let cancel = parent_cancel.child_token();
        self.agents.insert(
            info.agent_id.clone(),
            AgentRecord {
                info: info.clone(),
                cancel: cancel.clone(),
            },
        );

        let manager = Arc::clone(self);
        let agent_id = info.agent_id.clone();
        tokio::spawn(async move {
            let (tx, mut rx) = mpsc::channel::<AgentEvent>(64);
            let backend = manager.backend.clone();
            let backend_cancel = cancel.clone();
            let worker_task = task.clone();
            let worker = tokio::spawn(async move {
                backend.run_prompt(&worker_task, tx, backend_cancel).await;
            });

            let mut status = AgentStatus::Stopped;
            loop {
                tokio::select! {
                    event = rx.recv() => match event {
                        Some(AgentEvent::Completed { .. }) => status = AgentStatus::Completed,
                        Some(AgentEvent::Failed { .. }) => status = AgentStatus::Failed,
                        Some(_) => {}
                        None => break,
                    },
                    _ = cancel.cancelled() => break,
                }
            }
            worker.abort();

            if let Some(mut record) = manager.agents.get_mut(&agent_id) {
                record.info.status = status;
            }
            manager.bus.publish(
                "agent.status",
                json!({ "agent_id": agent_id, "status": status }),
            );
        });

        info
    }

    pub fn agent_status(&self, agent_id: &str) -> Result<AgentInfo, SessionError> {
        self.agents
            .get(agent_id)
            .map(|record| record.info.clone())
            .ok_or_else(|| SessionError::AgentNotFound(agent_id.to_string()))
    }

    /// Stop a running agent.
    pub fn stop_agent(&self, agent_id: &str) -> Result<AgentInfo, SessionError> {
        let mut record = self
            .agents
            .get_mut(agent_id)
            .ok_or_else(|| SessionError::AgentNotFound(agent_id.to_string()))?;
        record.cancel.cancel();
        if record.info.status == AgentStatus::Running {
            record.info.status = AgentStatus::Stopped;
        }
        Ok(record.info.clone())
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Session ids owned by sessions currently on this daemon; used to fill
    /// failover plans.
    pub fn session_ids(&self) -> Vec<SessionId> {
        let mut ids: Vec<SessionId> = self.sessions.iter().map(|r| r.info.session_id.clone()).collect();
        ids.sort();
        ids
    }
}
