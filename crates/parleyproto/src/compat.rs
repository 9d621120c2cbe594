//! Wire dialect compatibility layer.
//!
//! Parley speaks three inbound dialects and answers each client in kind:
//!
//! - **Native v2**: `{"type":"req", ...}` — the envelope in [`crate::Frame`].
//! - **JSON-RPC 2.0**: `{"jsonrpc":"2.0", "id", "method", "params"}`,
//!   answered as `{"jsonrpc":"2.0", "id", "result"|"error"}`. Events go out
//!   as notifications (`method` = event name, no `id`).
//! - **Legacy v1**: bare `{"id", "method", "params"?}` objects from
//!   first-generation clients, answered as `{"id", "success", "result"|"error"}`.
//!
//! Detection is per message element, so the router never guesses from
//! connection state. Internal handlers only ever see the native [`Frame`].

use crate::codec::{BatchDiag, CodecError, TextCodec};
use crate::{ErrorCode, Frame, RpcError};
use serde_json::{json, Value};

/// The wire dialect a message arrived in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Dialect {
    /// Legacy v1: untagged `{id, method, params}` objects.
    V1,
    /// JSON-RPC 2.0.
    JsonRpc2,
    /// Native Protocol v2.
    #[default]
    V2,
}

/// A normalized inbound frame together with the dialect it arrived in.
#[derive(Debug, Clone, PartialEq)]
pub struct InboundMessage {
    pub dialect: Dialect,
    pub frame: Frame,
}

/// Result of decoding one transport message across all dialects.
#[derive(Debug)]
pub struct InboundOutcome {
    pub messages: Vec<InboundMessage>,
    pub errors: Vec<BatchDiag>,
    pub is_batch: bool,
}

/// Classify a single message element.
pub fn detect(value: &Value) -> Dialect {
    match value.as_object() {
        Some(obj) if obj.get("jsonrpc").and_then(Value::as_str) == Some("2.0") => Dialect::JsonRpc2,
        Some(obj) if obj.get("type").is_some_and(Value::is_string) => Dialect::V2,
        _ => Dialect::V1,
    }
}

/// Normalize one element of any dialect into a native frame.
pub fn normalize(value: Value) -> Result<InboundMessage, String> {
    let dialect = detect(&value);
    let frame = match dialect {
        Dialect::V2 => serde_json::from_value::<Frame>(value).map_err(|e| e.to_string())?,
        Dialect::JsonRpc2 => {
            let obj = value.as_object().ok_or("expected a JSON object")?;
            let method = obj
                .get("method")
                .and_then(Value::as_str)
                .ok_or("missing method")?
                .to_string();
            Frame::Request {
                id: obj.get("id").cloned().unwrap_or(Value::Null),
                method,
                params: obj.get("params").cloned(),
                auth: None,
            }
        }
        Dialect::V1 => {
            let obj = value.as_object().ok_or("expected a JSON object")?;
            let method = obj
                .get("method")
                .and_then(Value::as_str)
                .ok_or("missing method")?
                .to_string();
            Frame::Request {
                id: obj.get("id").cloned().unwrap_or(Value::Null),
                method,
                params: obj.get("params").cloned(),
                auth: None,
            }
        }
    };
    Ok(InboundMessage { dialect, frame })
}

/// Decode a text message accepting every dialect, best-effort per element.
///
/// Size, parse, and batch-cap enforcement match [`TextCodec::decode`].
pub fn decode_any(codec: &TextCodec, text: &str) -> Result<InboundOutcome, CodecError> {
    if !codec.is_within_size_limit(text.len()) {
        return Err(CodecError::ExceedsSizeLimit {
            size: text.len(),
            limit: codec.message_size_limit(),
        });
    }

    let value: Value = serde_json::from_str(text).map_err(CodecError::Parse)?;

    match value {
        Value::Array(elements) => {
            if elements.is_empty() {
                return Err(CodecError::EmptyBatch);
            }
            if elements.len() > codec.max_batch() {
                return Err(CodecError::BatchTooLarge {
                    len: elements.len(),
                    max: codec.max_batch(),
                });
            }

            let mut messages = Vec::with_capacity(elements.len());
            let mut errors = Vec::new();
            for (index, element) in elements.into_iter().enumerate() {
                match normalize(element) {
                    Ok(message) => messages.push(message),
                    Err(reason) => errors.push(BatchDiag { index, reason }),
                }
            }
            Ok(InboundOutcome {
                messages,
                errors,
                is_batch: true,
            })
        }
        other => {
            let message = normalize(other).map_err(|reason| {
                CodecError::Parse(serde_json::Error::io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    reason,
                )))
            })?;
            Ok(InboundOutcome {
                messages: vec![message],
                errors: Vec::new(),
                is_batch: false,
            })
        }
    }
}

/// Render a native response frame in the given dialect.
pub fn render_response(dialect: Dialect, frame: &Frame) -> Value {
    let Frame::Response { id, ok, payload, error } = frame else {
        return serde_json::to_value(frame).unwrap_or(Value::Null);
    };

    match dialect {
        Dialect::V2 => serde_json::to_value(frame).unwrap_or(Value::Null),
        Dialect::JsonRpc2 => {
            if *ok {
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": payload.clone().unwrap_or(Value::Null),
                })
            } else {
                let err = error
                    .clone()
                    .unwrap_or_else(|| RpcError::internal("missing error"));
                let mut data = err.data.clone().unwrap_or_else(|| json!({}));
                if let Value::Object(ref mut map) = data {
                    map.insert("code".into(), Value::String(err.code.as_str().into()));
                }
                json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "error": {
                        "code": err.code.jsonrpc_code(),
                        "message": err.message,
                        "data": data,
                    },
                })
            }
        }
        Dialect::V1 => {
            if *ok {
                json!({
                    "id": id,
                    "success": true,
                    "result": payload.clone().unwrap_or(Value::Null),
                })
            } else {
                let err = error
                    .clone()
                    .unwrap_or_else(|| RpcError::internal("missing error"));
                json!({
                    "id": id,
                    "success": false,
                    "error": {
                        "code": err.code.as_str(),
                        "message": err.message,
                        "data": err.data,
                    },
                })
            }
        }
    }
}

/// Render a native event frame in the given dialect.
pub fn render_event(dialect: Dialect, frame: &Frame) -> Value {
    let Frame::Event { event, payload, seq } = frame else {
        return serde_json::to_value(frame).unwrap_or(Value::Null);
    };

    match dialect {
        Dialect::V2 => serde_json::to_value(frame).unwrap_or(Value::Null),
        Dialect::JsonRpc2 => json!({
            "jsonrpc": "2.0",
            "method": event,
            "params": { "payload": payload, "seq": seq },
        }),
        Dialect::V1 => json!({
            "event": event,
            "data": payload,
            "seq": seq,
        }),
    }
}

/// Convenience: an error response for a request that never parsed, rendered
/// in the dialect the element appeared to be.
pub fn parse_failure_response(dialect: Dialect, reason: &str) -> Value {
    let frame = Frame::err(
        Value::Null,
        RpcError::new(ErrorCode::InvalidRequest, reason),
    );
    render_response(dialect, &frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::CodecConfig;
    use pretty_assertions::assert_eq;

    #[test]
    fn detects_dialects() {
        assert_eq!(
            detect(&json!({"jsonrpc": "2.0", "id": 1, "method": "m"})),
            Dialect::JsonRpc2
        );
        assert_eq!(
            detect(&json!({"type": "req", "id": "a", "method": "m"})),
            Dialect::V2
        );
        assert_eq!(detect(&json!({"id": "a", "method": "m"})), Dialect::V1);
    }

    #[test]
    fn jsonrpc_request_normalizes() {
        let message = normalize(json!({
            "jsonrpc": "2.0",
            "id": 7,
            "method": "health.ping",
            "params": {"x": 1},
        }))
        .unwrap();
        assert_eq!(message.dialect, Dialect::JsonRpc2);
        match message.frame {
            Frame::Request { id, method, params, .. } => {
                assert_eq!(id, json!(7));
                assert_eq!(method, "health.ping");
                assert_eq!(params, Some(json!({"x": 1})));
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn v1_request_normalizes() {
        let message = normalize(json!({"id": "r1", "method": "session.list"})).unwrap();
        assert_eq!(message.dialect, Dialect::V1);
        assert!(message.frame.is_request());
    }

    #[test]
    fn missing_method_is_an_error() {
        assert!(normalize(json!({"jsonrpc": "2.0", "id": 1})).is_err());
        assert!(normalize(json!({"id": 1})).is_err());
    }

    #[test]
    fn jsonrpc_success_envelope() {
        let frame = Frame::ok(json!(7), Some(json!({"pong": true})));
        let rendered = render_response(Dialect::JsonRpc2, &frame);
        assert_eq!(rendered["jsonrpc"], "2.0");
        assert_eq!(rendered["id"], 7);
        assert_eq!(rendered["result"]["pong"], true);
        assert!(rendered.get("error").is_none());
    }

    #[test]
    fn jsonrpc_error_envelope_keeps_stable_code() {
        let frame = Frame::err(json!(7), RpcError::rate_limited(5000));
        let rendered = render_response(Dialect::JsonRpc2, &frame);
        assert_eq!(rendered["error"]["code"], -32003);
        assert_eq!(rendered["error"]["data"]["code"], "RATE_LIMITED");
        assert_eq!(rendered["error"]["data"]["retryAfterMs"], 5000);
    }

    #[test]
    fn v1_response_envelope() {
        let frame = Frame::ok(json!("r1"), Some(json!(42)));
        let rendered = render_response(Dialect::V1, &frame);
        assert_eq!(rendered, json!({"id": "r1", "success": true, "result": 42}));
    }

    #[test]
    fn event_rendering_per_dialect() {
        let frame = Frame::event("session.output", json!({"chunk": "hi"}), Some(3));

        let v2 = render_event(Dialect::V2, &frame);
        assert_eq!(v2["type"], "event");

        let jsonrpc = render_event(Dialect::JsonRpc2, &frame);
        assert_eq!(jsonrpc["method"], "session.output");
        assert_eq!(jsonrpc["params"]["seq"], 3);
        assert!(jsonrpc.get("id").is_none());

        let v1 = render_event(Dialect::V1, &frame);
        assert_eq!(v1["data"]["chunk"], "hi");
    }

    #[test]
    fn decode_any_mixed_batch() {
        let codec = TextCodec::new(CodecConfig::default());
        let text = r#"[
            {"type":"req","id":"a","method":"health.ping"},
            {"jsonrpc":"2.0","id":2,"method":"health.ping"},
            {"id":"c","method":"health.ping"}
        ]"#;
        let outcome = decode_any(&codec, text).unwrap();
        assert!(outcome.is_batch);
        assert_eq!(outcome.messages.len(), 3);
        assert_eq!(outcome.messages[0].dialect, Dialect::V2);
        assert_eq!(outcome.messages[1].dialect, Dialect::JsonRpc2);
        assert_eq!(outcome.messages[2].dialect, Dialect::V1);
    }
}
