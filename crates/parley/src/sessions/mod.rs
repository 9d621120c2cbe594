//! Agent sessions: lifecycle, prompt streaming, spawned agents, and tool
//! approvals.

pub mod backend;
pub mod manager;
pub mod types;

pub use backend::{AgentBackend, AgentEvent, LocalBackend};
pub use manager::{SessionError, SessionManager};
pub use types::{
    AgentInfo, AgentStatus, PendingTool, PromptId, SessionId, SessionInfo, SessionStatus,
};
