//! Typed request parameters for every method.
//!
//! Each struct derives both `Deserialize` (validation happens by
//! deserializing into it) and `JsonSchema` (the registry advertises the
//! schema through `rpc.discover`).

use schemars::JsonSchema;
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AuthConnectParams {
    /// JWT bearer token.
    pub token: Option<String>,
    /// Pre-shared API key.
    pub api_key: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionCreateParams {
    pub title: Option<String>,
    pub model: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionIdParams {
    pub session_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SessionListParams {
    /// Restrict to sessions owned by the calling client.
    #[serde(default)]
    pub mine: bool,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct PromptSubmitParams {
    pub session_id: String,
    pub prompt: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ToolDecisionParams {
    pub tool_call_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AgentSpawnParams {
    pub task: String,
    pub session_id: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct AgentIdParams {
    pub agent_id: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryQueryParams {
    /// Key prefix filter.
    pub prefix: Option<String>,
    /// Tag filter; conjunctive with `prefix`.
    pub tag: Option<String>,
    pub limit: Option<usize>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryStoreParams {
    /// Omitted keys are generated.
    pub key: Option<String>,
    pub value: Option<Value>,
    #[serde(default)]
    pub tags: Vec<String>,
    /// Claim the payload of a completed binary upload instead of `value`.
    pub correlation_id: Option<Uuid>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct MemoryDeleteParams {
    pub key: String,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConfigGetParams {
    /// Top-level section name; omit for the whole (sanitized) config.
    pub section: Option<String>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct ConfigSetParams {
    /// Dot path, e.g. `rate.max_tokens`.
    pub key: String,
    pub value: Value,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct SubscribeParams {
    /// Event pattern: `*` matches one segment, `**` any number.
    pub pattern: String,
    /// Payload fields that must match exactly.
    pub filter: Option<serde_json::Map<String, Value>>,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct UnsubscribeParams {
    pub subscription_id: Uuid,
}

#[derive(Debug, Deserialize, JsonSchema)]
pub struct RpcDescribeParams {
    pub method: String,
}

/// Methods that take no parameters.
#[derive(Debug, Default, Deserialize, JsonSchema)]
pub struct NoParams {}
