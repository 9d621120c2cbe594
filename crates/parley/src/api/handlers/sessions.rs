//! Session, prompt, tool, and agent handlers.

use crate::api::dispatch::HandlerContext;
use crate::api::schema::*;
use crate::daemon::Daemon;
use crate::sessions::SessionId;
use parleyproto::RpcError;
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn create(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: SessionCreateParams,
) -> Result<Value, RpcError> {
    let info = daemon
        .sessions
        .create(&ctx.identity.client_id, params.title, params.model);
    Ok(json!({ "session": info }))
}

pub async fn resume(daemon: &Arc<Daemon>, params: SessionIdParams) -> Result<Value, RpcError> {
    let info = daemon
        .sessions
        .resume(&SessionId::new(params.session_id))?;
    Ok(json!({ "session": info }))
}

pub async fn stop(daemon: &Arc<Daemon>, params: SessionIdParams) -> Result<Value, RpcError> {
    let info = daemon.sessions.stop(&SessionId::new(params.session_id))?;
    Ok(json!({ "session": info }))
}

pub async fn list(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: SessionListParams,
) -> Result<Value, RpcError> {
    let owner = params.mine.then_some(ctx.identity.client_id.as_str());
    Ok(json!({ "sessions": daemon.sessions.list(owner) }))
}

pub async fn status(daemon: &Arc<Daemon>, params: SessionIdParams) -> Result<Value, RpcError> {
    let info = daemon.sessions.status(&SessionId::new(params.session_id))?;
    Ok(json!({ "session": info }))
}

pub async fn prompt_submit(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: PromptSubmitParams,
) -> Result<Value, RpcError> {
    let prompt_id = daemon.sessions.submit_prompt(
        &SessionId::new(params.session_id.clone()),
        params.prompt,
        &ctx.cancel,
    )?;
    Ok(json!({
        "prompt_id": prompt_id,
        "session_id": params.session_id,
        "streaming": true,
    }))
}

pub async fn prompt_cancel(daemon: &Arc<Daemon>, params: SessionIdParams) -> Result<Value, RpcError> {
    let prompt_id = daemon
        .sessions
        .cancel_prompt(&SessionId::new(params.session_id))?;
    Ok(json!({ "prompt_id": prompt_id, "cancelled": true }))
}

pub async fn tool_decide(
    daemon: &Arc<Daemon>,
    params: ToolDecisionParams,
    approve: bool,
) -> Result<Value, RpcError> {
    let pending = daemon.sessions.decide_tool(&params.tool_call_id, approve)?;
    Ok(json!({
        "tool_call_id": pending.tool_call_id,
        "tool": pending.tool,
        "approved": approve,
    }))
}

pub async fn agent_spawn(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: AgentSpawnParams,
) -> Result<Value, RpcError> {
    let info = daemon.sessions.spawn_agent(
        params.task,
        params.session_id.map(SessionId::new),
        &ctx.cancel,
    );
    Ok(json!({ "agent": info }))
}

pub async fn agent_status(daemon: &Arc<Daemon>, params: AgentIdParams) -> Result<Value, RpcError> {
    let info = daemon.sessions.agent_status(&params.agent_id)?;
    Ok(json!({ "agent": info }))
}

pub async fn agent_stop(daemon: &Arc<Daemon>, params: AgentIdParams) -> Result<Value, RpcError> {
    let info = daemon.sessions.stop_agent(&params.agent_id)?;
    Ok(json!({ "agent": info }))
}
