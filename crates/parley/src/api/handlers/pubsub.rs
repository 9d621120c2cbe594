//! Subscription and discovery handlers.

use crate::api::dispatch::HandlerContext;
use crate::api::schema::*;
use crate::daemon::Daemon;
use crate::subscriptions::SubscribeError;
use parleyproto::{ErrorCode, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;

pub async fn subscribe(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: SubscribeParams,
) -> Result<Value, RpcError> {
    let subscription_id = daemon
        .subscriptions
        .subscribe(ctx.connection_id, &params.pattern, params.filter)
        .map_err(subscribe_error)?;
    Ok(json!({
        "subscription_id": subscription_id,
        "pattern": params.pattern,
    }))
}

pub async fn unsubscribe(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: UnsubscribeParams,
) -> Result<Value, RpcError> {
    daemon
        .subscriptions
        .unsubscribe(ctx.connection_id, params.subscription_id)
        .map_err(subscribe_error)?;
    Ok(json!({ "unsubscribed": params.subscription_id }))
}

pub async fn discover(daemon: &Arc<Daemon>) -> Result<Value, RpcError> {
    Ok(json!({
        "methods": daemon.methods.methods(),
        "events": daemon.methods.events(),
    }))
}

pub async fn describe(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: RpcDescribeParams,
) -> Result<Value, RpcError> {
    let info = daemon
        .methods
        .describe(&params.method)
        .ok_or_else(|| RpcError::method_not_found(&params.method))?;

    // Tell the caller whether their scopes reach this method, with the
    // expansion that decided it.
    let expanded = parleyproto::scopes::expand_scopes(
        &ctx.identity.scopes,
        daemon.methods.known_scopes(),
    );
    let callable =
        parleyproto::scopes::has_required_scopes(&ctx.identity.scopes, &info.required_scopes);

    Ok(json!({
        "method": info,
        "callable": callable,
        "granted_scopes": expanded,
    }))
}

fn subscribe_error(e: SubscribeError) -> RpcError {
    match e {
        SubscribeError::InvalidPattern { .. } => {
            RpcError::invalid_params(vec![e.to_string()])
        }
        SubscribeError::UnknownSubscription(_) => {
            RpcError::new(ErrorCode::InvalidParams, e.to_string())
                .with_data(json!({ "kind": "unknown_subscription" }))
        }
    }
}
