//! parleyproto - Wire protocol types for the Parley daemon
//!
//! This crate defines the Protocol v2 envelope exchanged between Parley and
//! its clients over WebSocket, together with the codecs that move it on and
//! off the wire:
//!
//! - [`Frame`]: the native v2 envelope (request / response / event)
//! - [`codec`]: text JSON codec with batching and size enforcement
//! - [`binary`]: length-prefixed binary frames for opaque payloads
//! - [`compress`]: gzip/deflate payload compression
//! - [`compat`]: JSON-RPC 2.0 and legacy v1 compatibility layer
//! - [`scopes`]: hierarchical capability scopes
//! - [`methods`]: method/event descriptors for discovery

pub mod binary;
pub mod codec;
pub mod compat;
pub mod compress;
pub mod methods;
pub mod scopes;

pub use binary::{BinaryError, BinaryFlags, BinaryFrame};
pub use codec::{BatchDiag, CodecConfig, CodecError, DecodeOutcome, TextCodec};
pub use compat::{Dialect, InboundMessage};
pub use compress::{compress, decompress, CompressError, Compression};
pub use methods::{EventInfo, MethodInfo};

use serde::{Deserialize, Serialize};

/// One wire-level protocol message in the native v2 envelope.
///
/// On the wire a frame is a JSON object tagged by `type`:
///
/// ```text
/// {"type":"req",   "id":..., "method":..., "params"?:...}
/// {"type":"res",   "id":..., "ok":true,  "payload"?:...}
/// {"type":"res",   "id":..., "ok":false, "error":{"code","message","data"?}}
/// {"type":"event", "event":..., "payload":..., "seq"?:...}
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Frame {
    /// A client call. The `id` must be unique among the connection's
    /// outstanding requests; string and numeric ids are both accepted.
    #[serde(rename = "req")]
    Request {
        id: serde_json::Value,
        method: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        params: Option<serde_json::Value>,
        /// Inline credentials for per-message (re-)authentication.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        auth: Option<InlineCredentials>,
    },

    /// The reply to a request, matched by `id`. Exactly one of `payload`
    /// (when `ok`) or `error` (when `!ok`) is present.
    #[serde(rename = "res")]
    Response {
        id: serde_json::Value,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        payload: Option<serde_json::Value>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<RpcError>,
    },

    /// A server-push event delivered to matching subscriptions. `seq` is
    /// monotonic within a single (connection, subscription) stream.
    #[serde(rename = "event")]
    Event {
        event: String,
        payload: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        seq: Option<u64>,
    },
}

impl Frame {
    /// Create a request frame.
    pub fn request(id: impl Into<serde_json::Value>, method: impl Into<String>) -> Self {
        Frame::Request {
            id: id.into(),
            method: method.into(),
            params: None,
            auth: None,
        }
    }

    /// Create a request frame with params.
    pub fn request_with_params(
        id: impl Into<serde_json::Value>,
        method: impl Into<String>,
        params: serde_json::Value,
    ) -> Self {
        Frame::Request {
            id: id.into(),
            method: method.into(),
            params: Some(params),
            auth: None,
        }
    }

    /// Create a success response.
    pub fn ok(id: serde_json::Value, payload: Option<serde_json::Value>) -> Self {
        Frame::Response {
            id,
            ok: true,
            payload,
            error: None,
        }
    }

    /// Create an error response.
    pub fn err(id: serde_json::Value, error: RpcError) -> Self {
        Frame::Response {
            id,
            ok: false,
            payload: None,
            error: Some(error),
        }
    }

    /// Create an event frame.
    pub fn event(event: impl Into<String>, payload: serde_json::Value, seq: Option<u64>) -> Self {
        Frame::Event {
            event: event.into(),
            payload,
            seq,
        }
    }

    /// The request/response correlation id, if this frame carries one.
    pub fn id(&self) -> Option<&serde_json::Value> {
        match self {
            Frame::Request { id, .. } | Frame::Response { id, .. } => Some(id),
            Frame::Event { .. } => None,
        }
    }

    pub fn is_request(&self) -> bool {
        matches!(self, Frame::Request { .. })
    }
}

/// Inline credentials carried on a request for per-message authentication.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineCredentials {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,
}

impl InlineCredentials {
    pub fn is_empty(&self) -> bool {
        self.token.is_none() && self.api_key.is_none()
    }
}

/// Stable protocol error codes.
///
/// These identifiers are part of the wire contract; clients switch on them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    ParseError,
    InvalidRequest,
    InvalidParams,
    MethodNotFound,
    AuthRequired,
    AuthInvalid,
    PermissionDenied,
    RateLimited,
    PayloadTooLarge,
    Backpressure,
    Cancelled,
    InternalError,
}

impl ErrorCode {
    /// The wire identifier for this code.
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::ParseError => "PARSE_ERROR",
            ErrorCode::InvalidRequest => "INVALID_REQUEST",
            ErrorCode::InvalidParams => "INVALID_PARAMS",
            ErrorCode::MethodNotFound => "METHOD_NOT_FOUND",
            ErrorCode::AuthRequired => "AUTH_REQUIRED",
            ErrorCode::AuthInvalid => "AUTH_INVALID",
            ErrorCode::PermissionDenied => "PERMISSION_DENIED",
            ErrorCode::RateLimited => "RATE_LIMITED",
            ErrorCode::PayloadTooLarge => "PAYLOAD_TOO_LARGE",
            ErrorCode::Backpressure => "BACKPRESSURE",
            ErrorCode::Cancelled => "CANCELLED",
            ErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }

    /// The numeric code used in the JSON-RPC 2.0 compatibility envelope.
    ///
    /// The five standard JSON-RPC codes map directly; the rest use the
    /// implementation-defined -32000..-32099 server error range.
    pub fn jsonrpc_code(self) -> i64 {
        match self {
            ErrorCode::ParseError => -32700,
            ErrorCode::InvalidRequest => -32600,
            ErrorCode::MethodNotFound => -32601,
            ErrorCode::InvalidParams => -32602,
            ErrorCode::InternalError => -32603,
            ErrorCode::AuthRequired => -32000,
            ErrorCode::AuthInvalid => -32001,
            ErrorCode::PermissionDenied => -32002,
            ErrorCode::RateLimited => -32003,
            ErrorCode::PayloadTooLarge => -32004,
            ErrorCode::Backpressure => -32005,
            ErrorCode::Cancelled => -32006,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A protocol-level error attached to a response frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

impl RpcError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = Some(data);
        self
    }

    /// A rate-limit denial with the retry hint clients back off on.
    pub fn rate_limited(retry_after_ms: u64) -> Self {
        Self::new(ErrorCode::RateLimited, "rate limit exceeded")
            .with_data(serde_json::json!({ "retryAfterMs": retry_after_ms }))
    }

    /// An invalid-params error carrying per-field diagnostics.
    pub fn invalid_params(errors: Vec<String>) -> Self {
        Self::new(ErrorCode::InvalidParams, "invalid params")
            .with_data(serde_json::json!({ "errors": errors }))
    }

    pub fn method_not_found(method: &str) -> Self {
        Self::new(
            ErrorCode::MethodNotFound,
            format!("unknown method: {}", method),
        )
    }

    pub fn cancelled(reason: impl Into<String>) -> Self {
        Self::new(ErrorCode::Cancelled, reason)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }
}

impl std::fmt::Display for RpcError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.code, self.message)
    }
}

impl std::error::Error for RpcError {}
