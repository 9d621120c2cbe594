//! Rpc dispatch: scope check, param validation, handler invocation.
//!
//! The router hands every authenticated request frame here. Dispatch is a
//! match over the typed [`Method`] sum; handlers get a [`HandlerContext`]
//! and return plain JSON payloads or an [`RpcError`] with a stable code.

use crate::api::handlers;
use crate::api::registry::Method;
use crate::auth::Identity;
use crate::daemon::Daemon;
use crate::router::streams::StreamTable;
use crate::router::ConnectionId;
use crate::sessions::SessionError;
use crate::trace::TraceContext;
use parleyproto::{ErrorCode, RpcError};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Everything a handler may touch besides the daemon itself.
#[derive(Clone)]
pub struct HandlerContext {
    pub identity: Identity,
    pub connection_id: ConnectionId,
    pub trace: TraceContext,
    /// Fires when the owning connection closes.
    pub cancel: CancellationToken,
    /// The connection's binary upload streams.
    pub streams: Arc<StreamTable>,
}

/// Dispatch one request to its handler.
///
/// The method name has already been resolved; unknown names never get here.
/// Scope misses and bad params short-circuit before the handler runs.
pub async fn dispatch(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    method: Method,
    params: Option<Value>,
) -> Result<Value, RpcError> {
    if !parleyproto::scopes::has_required_scopes(&ctx.identity.scopes, method.required_scopes()) {
        return Err(RpcError::new(
            ErrorCode::PermissionDenied,
            format!("{} requires scopes {:?}", method.name(), method.required_scopes()),
        ));
    }

    match method {
        // Connection-level methods are resolved by the router against the
        // connection's own state; reaching dispatch is a wiring bug.
        Method::AuthConnect | Method::AuthRefresh | Method::AuthLogout => Err(RpcError::internal(
            "connection-level method routed to dispatcher",
        )),

        Method::SessionCreate => {
            handlers::sessions::create(daemon, ctx, parse_params(method, params)?).await
        }
        Method::SessionResume => {
            handlers::sessions::resume(daemon, parse_params(method, params)?).await
        }
        Method::SessionStop => {
            handlers::sessions::stop(daemon, parse_params(method, params)?).await
        }
        Method::SessionList => {
            handlers::sessions::list(daemon, ctx, parse_params(method, params)?).await
        }
        Method::SessionStatus => {
            handlers::sessions::status(daemon, parse_params(method, params)?).await
        }
        Method::PromptSubmit => {
            handlers::sessions::prompt_submit(daemon, ctx, parse_params(method, params)?).await
        }
        Method::PromptCancel => {
            handlers::sessions::prompt_cancel(daemon, parse_params(method, params)?).await
        }
        Method::ToolApprove => {
            handlers::sessions::tool_decide(daemon, parse_params(method, params)?, true).await
        }
        Method::ToolDeny => {
            handlers::sessions::tool_decide(daemon, parse_params(method, params)?, false).await
        }
        Method::AgentSpawn => {
            handlers::sessions::agent_spawn(daemon, ctx, parse_params(method, params)?).await
        }
        Method::AgentStatus => {
            handlers::sessions::agent_status(daemon, parse_params(method, params)?).await
        }
        Method::AgentStop => {
            handlers::sessions::agent_stop(daemon, parse_params(method, params)?).await
        }

        Method::MemoryQuery => {
            handlers::memory::query(daemon, parse_params(method, params)?).await
        }
        Method::MemoryStore => {
            handlers::memory::store(daemon, ctx, parse_params(method, params)?).await
        }
        Method::MemoryDelete => {
            handlers::memory::delete(daemon, parse_params(method, params)?).await
        }

        Method::ConfigGet => handlers::admin::config_get(daemon, parse_params(method, params)?).await,
        Method::ConfigSet => handlers::admin::config_set(daemon, parse_params(method, params)?).await,
        Method::HealthPing => handlers::admin::health_ping(daemon).await,
        Method::HealthStatus => handlers::admin::health_status(daemon).await,

        Method::Subscribe => {
            handlers::pubsub::subscribe(daemon, ctx, parse_params(method, params)?).await
        }
        Method::Unsubscribe => {
            handlers::pubsub::unsubscribe(daemon, ctx, parse_params(method, params)?).await
        }
        Method::RpcDiscover => handlers::pubsub::discover(daemon).await,
        Method::RpcDescribe => {
            handlers::pubsub::describe(daemon, ctx, parse_params(method, params)?).await
        }
    }
}

/// Deserialize params into the method's typed struct.
///
/// Missing required fields are collected into per-field diagnostics before
/// serde runs, so `data.errors[]` names every absent field instead of just
/// the first.
fn parse_params<T: DeserializeOwned>(method: Method, params: Option<Value>) -> Result<T, RpcError> {
    let value = params.unwrap_or_else(|| Value::Object(Default::default()));

    let schema = method.param_schema();
    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<String> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|field| value.get(field).is_none())
            .map(|field| format!("missing required field `{}`", field))
            .collect();
        if !missing.is_empty() {
            return Err(RpcError::invalid_params(missing));
        }
    }

    serde_json::from_value(value).map_err(|e| RpcError::invalid_params(vec![e.to_string()]))
}

impl From<SessionError> for RpcError {
    fn from(e: SessionError) -> Self {
        match &e {
            SessionError::SessionNotFound(_)
            | SessionError::AgentNotFound(_)
            | SessionError::ToolCallNotFound(_) => {
                RpcError::new(ErrorCode::InvalidParams, e.to_string())
                    .with_data(serde_json::json!({ "kind": "not_found" }))
            }
            SessionError::SessionStopped(_)
            | SessionError::SessionBusy(_)
            | SessionError::NoActivePrompt(_) => {
                RpcError::new(ErrorCode::InvalidRequest, e.to_string())
            }
        }
    }
}
