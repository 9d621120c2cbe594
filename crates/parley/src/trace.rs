//! Distributed tracing core.
//!
//! Creates traces and spans for router, rpc, and outbound federation work,
//! stores them in memory, and propagates context in the W3C traceparent form
//! (`00-{trace_id}-{span_id}-{flags}`) as well as inside JSON payloads.
//!
//! The tracer is constructed once at startup and passed by parameter; there
//! is no ambient global. A disabled tracer or an unsampled root hands out
//! the constant no-op context (`trace_id` all zeros), which makes every
//! downstream operation a cheap no-op.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parleyconf::TraceConfig;
use rand::Rng;
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Instant;
use tracing::debug;
use uuid::Uuid;

/// The trace id handed out when tracing is disabled or unsampled.
pub const NOOP_TRACE_ID: &str = "00000000000000000000000000000000";

/// Immutable trace context, passed by value through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceContext {
    /// 32 lowercase hex chars.
    pub trace_id: String,
    /// 16 lowercase hex chars.
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub sampled: bool,
    pub baggage: HashMap<String, String>,
}

impl TraceContext {
    /// The constant no-op context.
    pub fn noop() -> Self {
        Self {
            trace_id: NOOP_TRACE_ID.to_string(),
            span_id: "0000000000000000".to_string(),
            parent_span_id: None,
            sampled: false,
            baggage: HashMap::new(),
        }
    }

    pub fn is_noop(&self) -> bool {
        !self.sampled
    }

    /// W3C traceparent header value for outbound propagation.
    pub fn traceparent(&self) -> String {
        let flags = if self.sampled { "01" } else { "00" };
        format!("00-{}-{}-{}", self.trace_id, self.span_id, flags)
    }
}

/// Terminal status of a span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanStatus {
    InProgress,
    Ok,
    Error,
}

/// One timed event recorded inside a span.
#[derive(Debug, Clone, Serialize)]
pub struct SpanEvent {
    pub name: String,
    pub timestamp: DateTime<Utc>,
    pub attrs: HashMap<String, Value>,
}

/// One timed operation within a trace.
#[derive(Debug, Clone, Serialize)]
pub struct Span {
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub start: DateTime<Utc>,
    pub end: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub status: SpanStatus,
    pub attrs: HashMap<String, Value>,
    pub events: Vec<SpanEvent>,
    /// Monotonic start for TTL math; not serialized.
    #[serde(skip)]
    started_mono: Instant,
}

impl Span {
    fn finish(&mut self, status: SpanStatus) {
        let end = Utc::now();
        self.duration_ms = Some(
            (end - self.start)
                .num_milliseconds()
                .max(0) as u64,
        );
        self.end = Some(end);
        self.status = status;
    }
}

/// In-memory trace and span store.
///
/// Active spans are held by span id; completed spans per trace with a
/// per-trace cap (oldest evicted). A periodic sweep force-ends active spans
/// older than the configured TTL.
pub struct Tracer {
    config: TraceConfig,
    active: DashMap<String, Span>,
    completed: DashMap<String, VecDeque<Span>>,
}

impl Tracer {
    pub fn new(config: TraceConfig) -> Self {
        Self {
            config,
            active: DashMap::new(),
            completed: DashMap::new(),
        }
    }

    /// Start a root trace, making the sampling decision.
    pub fn start_trace(&self, name: &str) -> TraceContext {
        if !self.config.enabled || !self.sample() {
            return TraceContext::noop();
        }
        let ctx = TraceContext {
            trace_id: Uuid::new_v4().simple().to_string(),
            span_id: new_span_id(),
            parent_span_id: None,
            sampled: true,
            baggage: HashMap::new(),
        };
        self.record_start(name, &ctx);
        ctx
    }

    /// Start a child span; the child inherits the parent's sampling decision.
    pub fn start_span(&self, name: &str, parent: &TraceContext) -> TraceContext {
        if !self.config.enabled || parent.is_noop() {
            return TraceContext::noop();
        }
        let ctx = TraceContext {
            trace_id: parent.trace_id.clone(),
            span_id: new_span_id(),
            parent_span_id: Some(parent.span_id.clone()),
            sampled: true,
            baggage: parent.baggage.clone(),
        };
        self.record_start(name, &ctx);
        ctx
    }

    /// Set an attribute on the active span.
    pub fn set_attr(&self, ctx: &TraceContext, key: &str, value: Value) {
        if ctx.is_noop() {
            return;
        }
        if let Some(mut span) = self.active.get_mut(&ctx.span_id) {
            span.attrs.insert(key.to_string(), value);
        }
    }

    /// Record a timed event on the active span.
    pub fn add_event(&self, ctx: &TraceContext, name: &str, attrs: HashMap<String, Value>) {
        if ctx.is_noop() {
            return;
        }
        if let Some(mut span) = self.active.get_mut(&ctx.span_id) {
            span.events.push(SpanEvent {
                name: name.to_string(),
                timestamp: Utc::now(),
                attrs,
            });
        }
    }

    /// End the active span with the given status and move it to the
    /// completed store.
    pub fn end_span(&self, ctx: &TraceContext, status: SpanStatus) {
        if ctx.is_noop() {
            return;
        }
        let Some((_, mut span)) = self.active.remove(&ctx.span_id) else {
            return;
        };
        span.finish(status);
        self.retain_completed(span);
    }

    /// Force-end active spans older than the configured TTL.
    ///
    /// Returns how many spans were expired. Called from the periodic sweep
    /// task; tests call [`Tracer::sweep_expired_at`] with explicit clocks.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Instant::now())
    }

    pub fn sweep_expired_at(&self, now: Instant) -> usize {
        let ttl = std::time::Duration::from_millis(self.config.span_ttl_ms);
        let expired: Vec<String> = self
            .active
            .iter()
            .filter(|entry| now.duration_since(entry.started_mono) > ttl)
            .map(|entry| entry.span_id.clone())
            .collect();

        let count = expired.len();
        for span_id in expired {
            if let Some((_, mut span)) = self.active.remove(&span_id) {
                span.finish(SpanStatus::Error);
                span.attrs.insert("expired".to_string(), Value::Bool(true));
                debug!(span_id = %span.span_id, name = %span.name, "span expired by TTL sweep");
                self.retain_completed(span);
            }
        }
        count
    }

    /// Completed spans for a trace, oldest first.
    pub fn completed_spans(&self, trace_id: &str) -> Vec<Span> {
        self.completed
            .get(trace_id)
            .map(|spans| spans.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn active_span_count(&self) -> usize {
        self.active.len()
    }

    /// Extract a context from an inbound payload, accepting any of
    /// `traceId`, `x-trace-id`, or `trace_id`. A fresh child span id is
    /// generated when the payload names a trace but no span.
    pub fn extract_payload(&self, payload: &Value) -> Option<TraceContext> {
        let obj = payload.as_object()?;
        let trace_id = ["traceId", "x-trace-id", "trace_id"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))?
            .to_string();

        let parent_span_id = ["spanId", "span_id"]
            .iter()
            .find_map(|key| obj.get(*key).and_then(Value::as_str))
            .map(str::to_string);

        Some(TraceContext {
            trace_id,
            span_id: new_span_id(),
            parent_span_id,
            sampled: self.config.enabled,
            baggage: HashMap::new(),
        })
    }

    /// Inject trace identifiers into an outbound JSON payload.
    pub fn inject_payload(ctx: &TraceContext, payload: &mut Value) {
        if ctx.is_noop() {
            return;
        }
        if let Value::Object(map) = payload {
            map.insert("traceId".into(), Value::String(ctx.trace_id.clone()));
            map.insert("spanId".into(), Value::String(ctx.span_id.clone()));
            if let Some(parent) = &ctx.parent_span_id {
                map.insert("parentSpanId".into(), Value::String(parent.clone()));
            }
        }
    }

    /// Parse a W3C traceparent header into a context continuing that trace.
    pub fn extract_traceparent(&self, header: &str) -> Option<TraceContext> {
        let mut parts = header.split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let parent_span = parts.next()?;
        let flags = parts.next()?;
        if version != "00" || trace_id.len() != 32 || parent_span.len() != 16 {
            return None;
        }
        if trace_id == NOOP_TRACE_ID {
            return None;
        }
        Some(TraceContext {
            trace_id: trace_id.to_string(),
            span_id: new_span_id(),
            parent_span_id: Some(parent_span.to_string()),
            sampled: self.config.enabled && flags != "00",
            baggage: HashMap::new(),
        })
    }

    fn sample(&self) -> bool {
        let rate = self.config.sample_rate;
        if rate >= 1.0 {
            return true;
        }
        if rate <= 0.0 {
            return false;
        }
        rand::thread_rng().gen::<f64>() < rate
    }

    fn record_start(&self, name: &str, ctx: &TraceContext) {
        let span = Span {
            trace_id: ctx.trace_id.clone(),
            span_id: ctx.span_id.clone(),
            parent_span_id: ctx.parent_span_id.clone(),
            name: name.to_string(),
            start: Utc::now(),
            end: None,
            duration_ms: None,
            status: SpanStatus::InProgress,
            attrs: HashMap::new(),
            events: Vec::new(),
            started_mono: Instant::now(),
        };
        self.active.insert(ctx.span_id.clone(), span);
    }

    fn retain_completed(&self, span: Span) {
        let mut spans = self
            .completed
            .entry(span.trace_id.clone())
            .or_default();
        if spans.len() >= self.config.max_spans_per_trace {
            spans.pop_front();
        }
        spans.push_back(span);
    }
}

fn new_span_id() -> String {
    format!("{:016x}", rand::thread_rng().gen::<u64>())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracer() -> Tracer {
        Tracer::new(TraceConfig::default())
    }

    #[test]
    fn root_span_lifecycle() {
        let tracer = tracer();
        let ctx = tracer.start_trace("router.handle");
        assert_eq!(ctx.trace_id.len(), 32);
        assert_eq!(ctx.span_id.len(), 16);
        assert!(ctx.sampled);
        assert_eq!(tracer.active_span_count(), 1);

        tracer.end_span(&ctx, SpanStatus::Ok);
        assert_eq!(tracer.active_span_count(), 0);

        let completed = tracer.completed_spans(&ctx.trace_id);
        assert_eq!(completed.len(), 1);
        assert_eq!(completed[0].status, SpanStatus::Ok);
        assert!(completed[0].end.unwrap() >= completed[0].start);
        assert!(completed[0].duration_ms.is_some());
    }

    #[test]
    fn child_inherits_trace_and_links_parent() {
        let tracer = tracer();
        let root = tracer.start_trace("router.handle");
        let child = tracer.start_span("prompt.submit", &root);

        assert_eq!(child.trace_id, root.trace_id);
        assert_ne!(child.span_id, root.span_id);
        assert_eq!(child.parent_span_id.as_deref(), Some(root.span_id.as_str()));
    }

    #[test]
    fn disabled_tracer_hands_out_noop() {
        let tracer = Tracer::new(TraceConfig {
            enabled: false,
            ..TraceConfig::default()
        });
        let ctx = tracer.start_trace("anything");
        assert_eq!(ctx.trace_id, NOOP_TRACE_ID);
        assert!(ctx.is_noop());
        assert_eq!(tracer.active_span_count(), 0);

        // Ending a noop span is harmless.
        tracer.end_span(&ctx, SpanStatus::Ok);
    }

    #[test]
    fn zero_sample_rate_never_samples() {
        let tracer = Tracer::new(TraceConfig {
            sample_rate: 0.0,
            ..TraceConfig::default()
        });
        for _ in 0..20 {
            assert!(tracer.start_trace("op").is_noop());
        }
    }

    #[test]
    fn unsampled_children_stay_noop() {
        let tracer = Tracer::new(TraceConfig {
            sample_rate: 0.0,
            ..TraceConfig::default()
        });
        let root = tracer.start_trace("op");
        let child = tracer.start_span("child", &root);
        assert!(child.is_noop());
    }

    #[test]
    fn traceparent_roundtrip() {
        let tracer = tracer();
        let ctx = tracer.start_trace("outbound");
        let header = ctx.traceparent();
        assert_eq!(header, format!("00-{}-{}-01", ctx.trace_id, ctx.span_id));

        let extracted = tracer.extract_traceparent(&header).unwrap();
        assert_eq!(extracted.trace_id, ctx.trace_id);
        assert_eq!(extracted.parent_span_id.as_deref(), Some(ctx.span_id.as_str()));
        assert_ne!(extracted.span_id, ctx.span_id);
    }

    #[test]
    fn malformed_traceparent_rejected() {
        let tracer = tracer();
        assert!(tracer.extract_traceparent("garbage").is_none());
        assert!(tracer.extract_traceparent("00-short-xyz-01").is_none());
        assert!(tracer
            .extract_traceparent(&format!("00-{}-0000000000000000-01", NOOP_TRACE_ID))
            .is_none());
    }

    #[test]
    fn payload_injection_and_extraction() {
        let tracer = tracer();
        let ctx = tracer.start_trace("peer.call");

        let mut payload = serde_json::json!({"question": "status?"});
        Tracer::inject_payload(&ctx, &mut payload);
        assert_eq!(payload["traceId"], ctx.trace_id.as_str());
        assert_eq!(payload["spanId"], ctx.span_id.as_str());

        let extracted = tracer.extract_payload(&payload).unwrap();
        assert_eq!(extracted.trace_id, ctx.trace_id);
        assert_eq!(extracted.parent_span_id.as_deref(), Some(ctx.span_id.as_str()));
    }

    #[test]
    fn extraction_accepts_alternate_keys() {
        let tracer = tracer();
        for key in ["traceId", "x-trace-id", "trace_id"] {
            let payload = serde_json::json!({ key: "abc123" });
            let ctx = tracer.extract_payload(&payload).unwrap();
            assert_eq!(ctx.trace_id, "abc123");
            assert_eq!(ctx.span_id.len(), 16);
        }
        assert!(tracer.extract_payload(&serde_json::json!({"x": 1})).is_none());
    }

    #[test]
    fn ttl_sweep_expires_stale_spans() {
        let tracer = Tracer::new(TraceConfig {
            span_ttl_ms: 1000,
            ..TraceConfig::default()
        });
        let ctx = tracer.start_trace("stuck.handler");
        assert_eq!(tracer.active_span_count(), 1);

        // Just under the TTL: nothing expires.
        let now = Instant::now() + std::time::Duration::from_millis(500);
        assert_eq!(tracer.sweep_expired_at(now), 0);

        let later = Instant::now() + std::time::Duration::from_millis(1500);
        assert_eq!(tracer.sweep_expired_at(later), 1);
        assert_eq!(tracer.active_span_count(), 0);

        let completed = tracer.completed_spans(&ctx.trace_id);
        assert_eq!(completed[0].status, SpanStatus::Error);
        assert_eq!(completed[0].attrs["expired"], serde_json::json!(true));
    }

    #[test]
    fn per_trace_cap_evicts_oldest() {
        let tracer = Tracer::new(TraceConfig {
            max_spans_per_trace: 3,
            ..TraceConfig::default()
        });
        let root = tracer.start_trace("root");
        for i in 0..5 {
            let child = tracer.start_span(&format!("child-{}", i), &root);
            tracer.end_span(&child, SpanStatus::Ok);
        }

        let completed = tracer.completed_spans(&root.trace_id);
        assert_eq!(completed.len(), 3);
        assert_eq!(completed[0].name, "child-2");
        assert_eq!(completed[2].name, "child-4");
    }

    #[test]
    fn span_events_recorded_in_order() {
        let tracer = tracer();
        let ctx = tracer.start_trace("op");
        tracer.add_event(&ctx, "first", HashMap::new());
        tracer.add_event(&ctx, "second", HashMap::new());
        tracer.end_span(&ctx, SpanStatus::Ok);

        let spans = tracer.completed_spans(&ctx.trace_id);
        let events: Vec<&str> = spans[0].events.iter().map(|e| e.name.as_str()).collect();
        assert_eq!(events, vec!["first", "second"]);
    }
}
