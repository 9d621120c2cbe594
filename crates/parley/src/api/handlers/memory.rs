//! Memory store handlers.

use crate::api::dispatch::HandlerContext;
use crate::api::schema::*;
use crate::daemon::Daemon;
use parleyproto::{ErrorCode, RpcError};
use serde_json::{json, Value};
use std::sync::Arc;

const DEFAULT_QUERY_LIMIT: usize = 100;

pub async fn query(daemon: &Arc<Daemon>, params: MemoryQueryParams) -> Result<Value, RpcError> {
    let entries = daemon.memory.query(
        params.prefix.as_deref(),
        params.tag.as_deref(),
        params.limit.unwrap_or(DEFAULT_QUERY_LIMIT),
    );
    let count = entries.len();
    Ok(json!({ "entries": entries, "count": count }))
}

pub async fn store(
    daemon: &Arc<Daemon>,
    ctx: &HandlerContext,
    params: MemoryStoreParams,
) -> Result<Value, RpcError> {
    // The value comes inline or from a completed binary upload, not both.
    let value = match (params.value, params.correlation_id) {
        (Some(value), None) => value,
        (None, Some(correlation_id)) => {
            let (metadata, payload) = ctx.streams.take_completed(correlation_id).ok_or_else(|| {
                RpcError::new(
                    ErrorCode::InvalidParams,
                    format!("no completed upload for correlation id {}", correlation_id),
                )
            })?;
            // Binary payloads are stored as metadata + length; the bytes
            // themselves stay opaque.
            json!({
                "upload": metadata,
                "bytes": payload.len(),
            })
        }
        (Some(_), Some(_)) => {
            return Err(RpcError::invalid_params(vec![
                "provide either `value` or `correlation_id`, not both".to_string(),
            ]))
        }
        (None, None) => {
            return Err(RpcError::invalid_params(vec![
                "one of `value` or `correlation_id` is required".to_string(),
            ]))
        }
    };

    let key = daemon
        .memory
        .store(params.key, value, params.tags, &ctx.identity.client_id);
    Ok(json!({ "key": key }))
}

pub async fn delete(daemon: &Arc<Daemon>, params: MemoryDeleteParams) -> Result<Value, RpcError> {
    let deleted = daemon.memory.delete(&params.key);
    Ok(json!({ "deleted": deleted }))
}
