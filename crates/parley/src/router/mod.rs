//! The message router - one instance per connection.
//!
//! Owns the connection's lifecycle and drives the inbound pipeline:
//! size cap → codec → rate limit → auth → trace → dispatch. Streaming and
//! subscription traffic fans back through the connection's send path.
//!
//! ```text
//! CONNECTING ─auth ok──► READY ─frame──► READY
//!      │                   │
//!      │                   └─close─► CLOSING ─drained─► CLOSED
//!      └─auth fail─► CLOSING (error frame then close)
//! ```
//!
//! The pipeline is serialized per connection; handlers spawn their own work
//! (prompt streaming) so later frames are not blocked. Responses are
//! produced exactly once per request frame.

pub mod connection;
pub mod streams;

pub use connection::{
    ConnectionHandle, ConnectionId, ConnectionRegistry, ConnectionState, ConnectionWriter,
    OutboundMessage,
};
pub use streams::{StreamError, StreamTable};

use crate::api::{self, HandlerContext, Method};
use crate::auth::{AuthError, Handshake, Identity};
use crate::daemon::Daemon;
use crate::trace::SpanStatus;
use parleyproto::codec::CodecError;
use parleyproto::compat::{self, Dialect, InboundMessage};
use parleyproto::{BinaryError, BinaryFrame, Compression, ErrorCode, Frame, InlineCredentials, RpcError};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// Per-connection router.
pub struct MessageRouter {
    daemon: Arc<Daemon>,
    handle: Arc<ConnectionHandle>,
    streams: Arc<StreamTable>,
    identity: Option<Identity>,
    state: ConnectionState,
}

impl MessageRouter {
    /// Build a router for a freshly accepted connection and run connect-time
    /// authentication from the transport handshake.
    ///
    /// Handshake credentials that fail to verify close the transport; a
    /// handshake with no credentials leaves the connection in CONNECTING
    /// until `auth.connect` arrives.
    pub fn new(daemon: Arc<Daemon>, handle: Arc<ConnectionHandle>, handshake: &Handshake) -> Self {
        let limits = daemon
            .config
            .read()
            .map(|c| (c.limits.max_message_bytes, c.limits.compression.clone()))
            .unwrap_or((1024 * 1024, "none".to_string()));
        let compression = limits.1.parse().unwrap_or(Compression::None);
        let streams = Arc::new(StreamTable::new(limits.0, compression));

        let mut router = Self {
            daemon,
            handle,
            streams,
            identity: None,
            state: ConnectionState::Connecting,
        };

        match router.daemon.authenticator.authenticate_connect(handshake) {
            Ok(identity) => {
                debug!(conn = %router.handle.id, client = %identity.client_id, "connection authenticated");
                router.identity = Some(identity);
                router.state = ConnectionState::Ready;
            }
            Err(AuthError::CredentialsMissing) => {
                // No credentials presented; wait for auth.connect.
            }
            Err(e) => {
                warn!(conn = %router.handle.id, error = %e, "connect-time auth failed");
                let frame = Frame::err(Value::Null, auth_error(&e));
                router.handle.send_response(Dialect::V2, &frame);
                router.handle.close(auth_error(&e).code.as_str());
                router.state = ConnectionState::Closing;
            }
        }

        router
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.handle.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn identity(&self) -> Option<&Identity> {
        self.identity.as_ref()
    }

    /// Handle one inbound text message.
    pub async fn handle_text(&mut self, text: &str) {
        self.handle.touch();

        if !self.daemon.codec.is_within_size_limit(text.len()) {
            self.refuse_oversized(text.len());
            return;
        }

        match compat::decode_any(&self.daemon.codec, text) {
            Ok(outcome) => self.process_outcome(outcome).await,
            Err(e) => self.refuse_message(e),
        }
    }

    /// Handle one inbound binary message: either a binary frame or a
    /// compressed text message.
    pub async fn handle_binary(&mut self, bytes: &[u8]) {
        self.handle.touch();

        if bytes.first() == Some(&parleyproto::binary::BINARY_VERSION) {
            self.handle_binary_frame(bytes);
            return;
        }

        // Not a binary frame: a compressed text message. The algorithm is
        // sniffed from the stream magic.
        let algorithm = match bytes.first() {
            Some(0x1f) => Compression::Gzip,
            Some(0x78) => Compression::Deflate,
            _ => {
                let frame = Frame::err(
                    Value::Null,
                    RpcError::new(ErrorCode::InvalidRequest, "unrecognized binary message"),
                );
                self.handle.send_response(self.handle.dialect(), &frame);
                return;
            }
        };

        match self.daemon.codec.decode_compressed(bytes, algorithm) {
            Ok(outcome) => {
                let messages = outcome
                    .frames
                    .into_iter()
                    .map(|frame| InboundMessage {
                        dialect: Dialect::V2,
                        frame,
                    })
                    .collect();
                self.process_outcome(compat::InboundOutcome {
                    messages,
                    errors: outcome.errors,
                    is_batch: outcome.is_batch,
                })
                .await
            }
            Err(e) => self.refuse_message(e),
        }
    }

    fn handle_binary_frame(&mut self, bytes: &[u8]) {
        let frame = match BinaryFrame::decode(bytes) {
            Ok(frame) => frame,
            Err(e @ BinaryError::UnsupportedVersion(_)) => {
                // Version violations close the connection.
                let response = Frame::err(
                    Value::Null,
                    RpcError::new(ErrorCode::InvalidRequest, e.to_string()),
                );
                self.handle.send_response(self.handle.dialect(), &response);
                self.close(ErrorCode::InvalidRequest.as_str());
                return;
            }
            Err(e) => {
                let response = Frame::err(
                    Value::Null,
                    RpcError::new(ErrorCode::InvalidRequest, e.to_string()),
                );
                self.handle.send_response(self.handle.dialect(), &response);
                return;
            }
        };

        let correlation = Value::String(frame.correlation_id.to_string());
        match self.streams.append(&frame) {
            Ok(progress) => {
                debug!(
                    conn = %self.handle.id,
                    correlation_id = %frame.correlation_id,
                    chunks = progress.chunks,
                    bytes = progress.total_bytes,
                    completed = progress.completed,
                    "binary chunk accepted"
                );
            }
            Err(e @ StreamError::Overflow(_)) => {
                // Size violations close the connection.
                let response = Frame::err(
                    correlation,
                    RpcError::new(ErrorCode::PayloadTooLarge, e.to_string()),
                );
                self.handle.send_response(self.handle.dialect(), &response);
                self.close(ErrorCode::PayloadTooLarge.as_str());
            }
            Err(e) => {
                let response = Frame::err(
                    correlation,
                    RpcError::new(ErrorCode::InvalidRequest, e.to_string()),
                );
                self.handle.send_response(self.handle.dialect(), &response);
            }
        }
    }

    /// Process a decoded message: requests through the pipeline, responses
    /// and events from clients ignored.
    async fn process_outcome(&mut self, outcome: compat::InboundOutcome) {
        if let Some(first) = outcome.messages.first() {
            self.handle.set_dialect(first.dialect);
        }

        if !outcome.is_batch {
            let mut responses = Vec::new();
            for message in outcome.messages {
                if let Some(rendered) = self.process_message(message).await {
                    responses.push(rendered);
                }
            }
            for rendered in responses {
                self.send_rendered(rendered);
            }
            return;
        }

        // Batch: every element answers at its own index; invalid elements
        // get INVALID_REQUEST with a per-index diagnostic.
        let total = outcome.messages.len() + outcome.errors.len();
        let mut rendered: Vec<Value> = Vec::with_capacity(total);
        let mut messages = outcome.messages.into_iter();
        let mut errors = outcome.errors.iter().peekable();

        for index in 0..total {
            if let Some(diag) = errors.next_if(|diag| diag.index == index) {
                rendered.push(compat::parse_failure_response(
                    Dialect::V2,
                    &diag.to_string(),
                ));
                continue;
            }
            let Some(message) = messages.next() else { break };
            if let Some(response) = self.process_message(message).await {
                rendered.push(response);
            }
        }

        if !rendered.is_empty() {
            self.handle.send_rendered_batch(rendered);
        }
    }

    /// Run one frame through the pipeline. Requests yield exactly one
    /// rendered response; events/responses from the client yield none.
    async fn process_message(&mut self, message: InboundMessage) -> Option<Value> {
        let dialect = message.dialect;
        let Frame::Request { id, method, params, auth } = message.frame else {
            debug!(conn = %self.handle.id, "ignoring non-request frame from client");
            return None;
        };

        let response = self
            .process_request(id.clone(), &method, params, auth)
            .await;
        Some(compat::render_response(dialect, &response))
    }

    async fn process_request(
        &mut self,
        id: Value,
        method_name: &str,
        params: Option<Value>,
        inline_auth: Option<InlineCredentials>,
    ) -> Frame {
        // 1. Method lookup.
        let Some(method) = Method::from_name(method_name) else {
            return Frame::err(id, RpcError::method_not_found(method_name));
        };

        // 2. Rate limit.
        let decision = self.daemon.rate_limiter.consume(self.handle.id, method_name);
        if let crate::ratelimit::RateDecision::Denied { retry_after_ms } = decision {
            debug!(conn = %self.handle.id, method = method_name, retry_after_ms, "rate limited");
            return Frame::err(id, RpcError::rate_limited(retry_after_ms));
        }

        // 3. Connection-level auth methods.
        if method.is_connection_level() {
            return self.handle_auth_method(id, method, params);
        }

        // 4. (Re-)authentication: required when the identity is absent or
        //    expired, and applied whenever inline credentials are present.
        if let Some(credentials) = inline_auth.filter(|c| !c.is_empty()) {
            match self.daemon.authenticator.authenticate_message(&credentials) {
                Ok(identity) => self.identity = Some(identity),
                Err(e) => return Frame::err(id, auth_error(&e)),
            }
        }

        if self.identity.as_ref().is_some_and(Identity::is_expired) {
            self.identity = None;
            return Frame::err(
                id,
                RpcError::new(ErrorCode::AuthRequired, "identity expired"),
            );
        }
        let Some(identity) = self.identity.clone() else {
            return Frame::err(
                id,
                RpcError::new(ErrorCode::AuthRequired, "authenticate first"),
            );
        };

        // 5. Tracing span, child of any propagated context.
        let parent = params
            .as_ref()
            .and_then(|p| self.daemon.tracer.extract_payload(p));
        let span = match &parent {
            Some(parent) => self.daemon.tracer.start_span(method_name, parent),
            None => self.daemon.tracer.start_trace(method_name),
        };
        self.daemon.tracer.set_attr(
            &span,
            "client_id",
            Value::String(identity.client_id.clone()),
        );

        // 6. Dispatch.
        let ctx = HandlerContext {
            identity,
            connection_id: self.handle.id,
            trace: span.clone(),
            cancel: self.handle.cancel.child_token(),
            streams: self.streams.clone(),
        };

        let result = api::dispatch(&self.daemon, &ctx, method, params).await;
        match result {
            Ok(payload) => {
                self.daemon.tracer.end_span(&span, SpanStatus::Ok);
                Frame::ok(id, Some(payload))
            }
            Err(mut error) => {
                self.daemon
                    .tracer
                    .set_attr(&span, "error_code", Value::String(error.code.to_string()));
                self.daemon.tracer.end_span(&span, SpanStatus::Error);

                // Sanitize internal errors outside development mode.
                if error.code == ErrorCode::InternalError && !self.daemon.expose_internal_errors() {
                    error = RpcError::new(ErrorCode::InternalError, "internal error");
                }
                Frame::err(id, error)
            }
        }
    }

    fn handle_auth_method(&mut self, id: Value, method: Method, params: Option<Value>) -> Frame {
        match method {
            Method::AuthConnect | Method::AuthRefresh => {
                let credentials = params
                    .and_then(|p| serde_json::from_value::<InlineCredentials>(p).ok())
                    .unwrap_or(InlineCredentials {
                        token: None,
                        api_key: None,
                    });

                match self.daemon.authenticator.authenticate_message(&credentials) {
                    Ok(identity) => {
                        debug!(conn = %self.handle.id, client = %identity.client_id, "authenticated");
                        let payload = serde_json::json!({ "identity": identity });
                        self.identity = Some(identity);
                        self.state = ConnectionState::Ready;
                        Frame::ok(id, Some(payload))
                    }
                    Err(e) => Frame::err(id, auth_error(&e)),
                }
            }
            Method::AuthLogout => {
                self.identity = None;
                self.state = ConnectionState::Connecting;
                Frame::ok(id, Some(serde_json::json!({ "logged_out": true })))
            }
            _ => Frame::err(id, RpcError::internal("not a connection-level method")),
        }
    }

    fn refuse_oversized(&mut self, size: usize) {
        warn!(conn = %self.handle.id, size, "message exceeds size limit");
        let frame = Frame::err(
            Value::Null,
            RpcError::new(
                ErrorCode::PayloadTooLarge,
                format!(
                    "message of {} bytes exceeds limit of {}",
                    size,
                    self.daemon.codec.message_size_limit()
                ),
            ),
        );
        self.handle.send_response(self.handle.dialect(), &frame);
        self.close(ErrorCode::PayloadTooLarge.as_str());
    }

    fn refuse_message(&mut self, error: CodecError) {
        let code = match &error {
            CodecError::ExceedsSizeLimit { size, .. } => {
                self.refuse_oversized(*size);
                return;
            }
            CodecError::Parse(_) => ErrorCode::ParseError,
            _ => ErrorCode::InvalidRequest,
        };
        let frame = Frame::err(Value::Null, RpcError::new(code, error.to_string()));
        self.handle.send_response(self.handle.dialect(), &frame);
    }

    fn send_rendered(&self, rendered: Value) {
        match serde_json::to_string(&rendered) {
            Ok(text) => {
                self.handle.send(OutboundMessage::Text(text));
            }
            Err(e) => warn!(conn = %self.handle.id, error = %e, "failed to serialize response"),
        }
    }

    fn close(&mut self, reason: &str) {
        self.state = ConnectionState::Closing;
        self.handle.close(reason);
    }

    /// Tear down everything this connection owned. Called after the
    /// transport goes away; in-flight handlers observe the cancellation.
    pub fn cleanup(&mut self) {
        self.state = ConnectionState::Closed;
        self.handle.close("connection closed");
        self.daemon.connections.remove(self.handle.id);
        self.daemon.rate_limiter.remove(self.handle.id);
        let dropped = self.daemon.subscriptions.remove_connection(self.handle.id);
        debug!(conn = %self.handle.id, dropped_subscriptions = dropped, "connection cleaned up");
    }
}

fn auth_error(e: &AuthError) -> RpcError {
    let code = if e.is_missing() {
        ErrorCode::AuthRequired
    } else {
        ErrorCode::AuthInvalid
    };
    RpcError::new(code, e.to_string())
}
