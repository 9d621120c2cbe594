//! The agent backend seam.
//!
//! LLM provider clients live outside this daemon; the core only consumes
//! already-normalized stream events through [`AgentBackend`]. The local
//! backend here is deterministic and exists for tests and offline
//! development.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Normalized stream events a backend emits while working a prompt.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    /// A chunk of streamed output.
    Chunk { text: String },
    /// The agent wants to run a tool and needs approval.
    ToolRequest { tool: String, args: Value },
    /// The prompt finished.
    Completed { reason: String },
    /// The prompt failed.
    Failed { error: String },
}

/// Drives one prompt to completion, pushing events into the sink.
///
/// Implementations must resolve quickly once `cancel` fires; the router
/// reports such prompts as CANCELLED.
#[async_trait]
pub trait AgentBackend: Send + Sync {
    async fn run_prompt(
        &self,
        prompt: &str,
        sink: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    );
}

/// Deterministic in-process backend.
///
/// Streams the prompt back word by word. A prompt containing
/// `!tool <name>` raises a tool request first, and `!fail <reason>` fails.
pub struct LocalBackend;

#[async_trait]
impl AgentBackend for LocalBackend {
    async fn run_prompt(
        &self,
        prompt: &str,
        sink: mpsc::Sender<AgentEvent>,
        cancel: CancellationToken,
    ) {
        if let Some(reason) = prompt.strip_prefix("!fail ") {
            let _ = sink
                .send(AgentEvent::Failed {
                    error: reason.to_string(),
                })
                .await;
            return;
        }

        if let Some(tool) = prompt.strip_prefix("!tool ") {
            let _ = sink
                .send(AgentEvent::ToolRequest {
                    tool: tool.split_whitespace().next().unwrap_or("unknown").to_string(),
                    args: serde_json::json!({ "prompt": prompt }),
                })
                .await;
        }

        for word in prompt.split_whitespace() {
            if cancel.is_cancelled() {
                return;
            }
            if sink
                .send(AgentEvent::Chunk {
                    text: format!("{} ", word),
                })
                .await
                .is_err()
            {
                return;
            }
        }

        let _ = sink
            .send(AgentEvent::Completed {
                reason: "end_of_output".to_string(),
            })
            .await;
    }
}
