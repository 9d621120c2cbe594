//! Method registry - the typed method catalog.
//!
//! One [`Method`] variant per callable method; adding a method is adding a
//! variant plus its row in the tables below. The registry powers
//! `rpc.discover` / `rpc.describe` and gives the dispatcher a typed sum to
//! match on instead of a string-keyed switch.

use crate::api::schema::*;
use parleyproto::{EventInfo, MethodInfo};
use schemars::JsonSchema;
use serde_json::Value;

/// Helper to generate JSON schema for a type
fn schema_for<T: JsonSchema>() -> Value {
    let settings = schemars::generate::SchemaSettings::draft07().with(|s| {
        s.inline_subschemas = true;
    });
    let gen = settings.into_generator();
    let schema = gen.into_root_schema_for::<T>();
    serde_json::to_value(schema).unwrap_or_default()
}

/// The full method catalog as a typed sum.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    AuthConnect,
    AuthRefresh,
    AuthLogout,
    SessionCreate,
    SessionResume,
    SessionStop,
    SessionList,
    SessionStatus,
    PromptSubmit,
    PromptCancel,
    ToolApprove,
    ToolDeny,
    AgentSpawn,
    AgentStatus,
    AgentStop,
    MemoryQuery,
    MemoryStore,
    MemoryDelete,
    ConfigGet,
    ConfigSet,
    HealthPing,
    HealthStatus,
    Subscribe,
    Unsubscribe,
    RpcDiscover,
    RpcDescribe,
}

/// Every method, in catalog order.
pub const ALL_METHODS: &[Method] = &[
    Method::AuthConnect,
    Method::AuthRefresh,
    Method::AuthLogout,
    Method::SessionCreate,
    Method::SessionResume,
    Method::SessionStop,
    Method::SessionList,
    Method::SessionStatus,
    Method::PromptSubmit,
    Method::PromptCancel,
    Method::ToolApprove,
    Method::ToolDeny,
    Method::AgentSpawn,
    Method::AgentStatus,
    Method::AgentStop,
    Method::MemoryQuery,
    Method::MemoryStore,
    Method::MemoryDelete,
    Method::ConfigGet,
    Method::ConfigSet,
    Method::HealthPing,
    Method::HealthStatus,
    Method::Subscribe,
    Method::Unsubscribe,
    Method::RpcDiscover,
    Method::RpcDescribe,
];

impl Method {
    pub fn from_name(name: &str) -> Option<Self> {
        ALL_METHODS.iter().copied().find(|m| m.name() == name)
    }

    pub fn name(self) -> &'static str {
        match self {
            Method::AuthConnect => "auth.connect",
            Method::AuthRefresh => "auth.refresh",
            Method::AuthLogout => "auth.logout",
            Method::SessionCreate => "session.create",
            Method::SessionResume => "session.resume",
            Method::SessionStop => "session.stop",
            Method::SessionList => "session.list",
            Method::SessionStatus => "session.status",
            Method::PromptSubmit => "prompt.submit",
            Method::PromptCancel => "prompt.cancel",
            Method::ToolApprove => "tool.approve",
            Method::ToolDeny => "tool.deny",
            Method::AgentSpawn => "agent.spawn",
            Method::AgentStatus => "agent.status",
            Method::AgentStop => "agent.stop",
            Method::MemoryQuery => "memory.query",
            Method::MemoryStore => "memory.store",
            Method::MemoryDelete => "memory.delete",
            Method::ConfigGet => "config.get",
            Method::ConfigSet => "config.set",
            Method::HealthPing => "health.ping",
            Method::HealthStatus => "health.status",
            Method::Subscribe => "subscribe",
            Method::Unsubscribe => "unsubscribe",
            Method::RpcDiscover => "rpc.discover",
            Method::RpcDescribe => "rpc.describe",
        }
    }

    pub fn description(self) -> &'static str {
        match self {
            Method::AuthConnect => "Authenticate this connection",
            Method::AuthRefresh => "Replace the connection identity with fresh credentials",
            Method::AuthLogout => "Clear the connection identity",
            Method::SessionCreate => "Create an agent session",
            Method::SessionResume => "Reactivate a stopped session",
            Method::SessionStop => "Stop a session and cancel in-flight work",
            Method::SessionList => "List sessions",
            Method::SessionStatus => "Get one session's status",
            Method::PromptSubmit => "Submit a prompt; output streams as session.output events",
            Method::PromptCancel => "Cancel the in-flight prompt of a session",
            Method::ToolApprove => "Approve a pending tool call",
            Method::ToolDeny => "Deny a pending tool call",
            Method::AgentSpawn => "Spawn a background agent",
            Method::AgentStatus => "Get a spawned agent's status",
            Method::AgentStop => "Stop a spawned agent",
            Method::MemoryQuery => "Query the volatile memory store",
            Method::MemoryStore => "Store a value in the memory store",
            Method::MemoryDelete => "Delete a memory entry",
            Method::ConfigGet => "Read the (sanitized) daemon configuration",
            Method::ConfigSet => "Update one configuration value",
            Method::HealthPing => "Liveness ping",
            Method::HealthStatus => "Daemon and cluster health snapshot",
            Method::Subscribe => "Subscribe to events by glob pattern",
            Method::Unsubscribe => "Drop a subscription",
            Method::RpcDiscover => "List every method and event",
            Method::RpcDescribe => "Describe one method",
        }
    }

    /// Scopes a caller must hold. Hierarchical: granting `session` covers
    /// every `session.*` method.
    pub fn required_scopes(self) -> &'static [&'static str] {
        match self {
            Method::AuthConnect
            | Method::AuthRefresh
            | Method::AuthLogout
            | Method::HealthPing
            | Method::RpcDiscover
            | Method::RpcDescribe => &[],
            Method::SessionCreate => &["session.create"],
            Method::SessionResume => &["session.resume"],
            Method::SessionStop => &["session.stop"],
            Method::SessionList => &["session.list"],
            Method::SessionStatus => &["session.status"],
            Method::PromptSubmit => &["prompt.submit"],
            Method::PromptCancel => &["prompt.cancel"],
            Method::ToolApprove => &["tool.approve"],
            Method::ToolDeny => &["tool.deny"],
            Method::AgentSpawn => &["agent.spawn"],
            Method::AgentStatus => &["agent.status"],
            Method::AgentStop => &["agent.stop"],
            Method::MemoryQuery => &["memory.query"],
            Method::MemoryStore => &["memory.store"],
            Method::MemoryDelete => &["memory.delete"],
            Method::ConfigGet => &["config.get"],
            Method::ConfigSet => &["config.set"],
            Method::HealthStatus => &["health.status"],
            Method::Subscribe => &["events.subscribe"],
            Method::Unsubscribe => &["events.unsubscribe"],
        }
    }

    pub fn param_schema(self) -> Value {
        match self {
            Method::AuthConnect | Method::AuthRefresh => schema_for::<AuthConnectParams>(),
            Method::AuthLogout => schema_for::<NoParams>(),
            Method::SessionCreate => schema_for::<SessionCreateParams>(),
            Method::SessionResume | Method::SessionStop | Method::SessionStatus => {
                schema_for::<SessionIdParams>()
            }
            Method::SessionList => schema_for::<SessionListParams>(),
            Method::PromptSubmit => schema_for::<PromptSubmitParams>(),
            Method::PromptCancel => schema_for::<SessionIdParams>(),
            Method::ToolApprove | Method::ToolDeny => schema_for::<ToolDecisionParams>(),
            Method::AgentSpawn => schema_for::<AgentSpawnParams>(),
            Method::AgentStatus | Method::AgentStop => schema_for::<AgentIdParams>(),
            Method::MemoryQuery => schema_for::<MemoryQueryParams>(),
            Method::MemoryStore => schema_for::<MemoryStoreParams>(),
            Method::MemoryDelete => schema_for::<MemoryDeleteParams>(),
            Method::ConfigGet => schema_for::<ConfigGetParams>(),
            Method::ConfigSet => schema_for::<ConfigSetParams>(),
            Method::HealthPing | Method::HealthStatus => schema_for::<NoParams>(),
            Method::Subscribe => schema_for::<SubscribeParams>(),
            Method::Unsubscribe => schema_for::<UnsubscribeParams>(),
            Method::RpcDiscover => schema_for::<NoParams>(),
            Method::RpcDescribe => schema_for::<RpcDescribeParams>(),
        }
    }

    /// Methods the router resolves against connection state instead of the
    /// dispatcher.
    pub fn is_connection_level(self) -> bool {
        matches!(
            self,
            Method::AuthConnect | Method::AuthRefresh | Method::AuthLogout
        )
    }

}

/// Events clients can subscribe to.
pub fn event_catalog() -> Vec<EventInfo> {
    let describe = |name: &str, description: &str| EventInfo {
        name: name.to_string(),
        description: description.to_string(),
    };
    vec![
        describe("session.created", "A session was created"),
        describe("session.stopped", "A session was stopped"),
        describe("session.output", "A streamed output chunk from a prompt"),
        describe("prompt.completed", "A prompt finished, failed, or was cancelled"),
        describe("tool.requested", "An agent wants to run a tool"),
        describe("tool.approved", "A pending tool call was approved"),
        describe("tool.denied", "A pending tool call was denied"),
        describe("agent.status", "A spawned agent changed state"),
        describe("config.changed", "A configuration value was updated"),
        describe("node.healthy", "A cluster node became healthy"),
        describe("node.unhealthy", "A cluster node became unhealthy"),
        describe("node.recovered", "A dead cluster node recovered"),
        describe("node.dead", "A cluster node was declared dead"),
    ]
}

/// Materialized catalog served by `rpc.discover`.
pub struct MethodRegistry {
    methods: Vec<MethodInfo>,
    events: Vec<EventInfo>,
}

impl Default for MethodRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MethodRegistry {
    pub fn new() -> Self {
        let methods = ALL_METHODS
            .iter()
            .map(|method| MethodInfo {
                name: method.name().to_string(),
                description: method.description().to_string(),
                required_scopes: method
                    .required_scopes()
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
                param_schema: method.param_schema(),
            })
            .collect();
        Self {
            methods,
            events: event_catalog(),
        }
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    pub fn events(&self) -> &[EventInfo] {
        &self.events
    }

    pub fn describe(&self, name: &str) -> Option<&MethodInfo> {
        self.methods.iter().find(|info| info.name == name)
    }

    /// The universe of scopes methods require, for scope expansion.
    pub fn known_scopes(&self) -> Vec<&str> {
        let mut scopes: Vec<&str> = self
            .methods
            .iter()
            .flat_map(|info| info.required_scopes.iter().map(String::as_str))
            .collect();
        scopes.sort_unstable();
        scopes.dedup();
        scopes
    }
}
