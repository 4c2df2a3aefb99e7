//! W3C Trace Context propagation
//!
//! Every inbound and outbound request carries
//! `traceparent: 00-<traceId 32hex>-<spanId 16hex>-<flags 2hex>` and
//! optionally `baggage: k1=v1,k2=v2` with URL-encoded values. A missing or
//! malformed `traceparent` starts a new root context; otherwise a child
//! span is derived (same trace id, fresh span id, parent = incoming span).
//!
//! The ambient per-task slot is a `tokio::task_local!` scope: spawners copy
//! the current context into the child task's scope instead of relying on
//! thread-local state.

use chrono::{DateTime, Utc};
use percent_encoding::{AsciiSet, CONTROLS, percent_decode_str, utf8_percent_encode};
use rand::Rng;
use std::future::Future;
use tracing::debug;

/// Header carrying the trace parent
pub const TRACEPARENT_HEADER: &str = "traceparent";
/// Header carrying baggage entries
pub const BAGGAGE_HEADER: &str = "baggage";

/// Characters escaped in baggage values
const BAGGAGE_ESCAPE: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'%')
    .add(b',')
    .add(b';')
    .add(b'=');

/// The (traceId, spanId, parentSpanId, flags, baggage) tuple propagated
/// across hops
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceContext {
    /// 32 lowercase hex chars, never all-zero
    pub trace_id: String,
    /// 16 lowercase hex chars, never all-zero
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub flags: u8,
    pub baggage: Vec<(String, String)>,
}

impl TraceContext {
    /// Start a new sampled root context
    #[must_use]
    pub fn new_root() -> Self {
        let mut rng = rand::thread_rng();
        let trace: u128 = loop {
            let v = rng.r#gen();
            if v != 0 {
                break v;
            }
        };
        let span: u64 = loop {
            let v = rng.r#gen();
            if v != 0 {
                break v;
            }
        };
        Self {
            trace_id: format!("{trace:032x}"),
            span_id: format!("{span:016x}"),
            parent_span_id: None,
            flags: 0x01,
            baggage: Vec::new(),
        }
    }

    /// Derive a child span: same trace id, fresh span id, parent set to
    /// this context's span
    #[must_use]
    pub fn child(&self) -> Self {
        let span: u64 = loop {
            let v = rand::thread_rng().r#gen();
            if v != 0 {
                break v;
            }
        };
        Self {
            trace_id: self.trace_id.clone(),
            span_id: format!("{span:016x}"),
            parent_span_id: Some(self.span_id.clone()),
            flags: self.flags,
            baggage: self.baggage.clone(),
        }
    }

    /// Parse a `traceparent` value; `None` on any malformation
    #[must_use]
    pub fn parse(traceparent: &str) -> Option<Self> {
        let mut parts = traceparent.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;
        if parts.next().is_some() {
            return None;
        }
        if version.len() != 2 || !is_lower_hex(version) || version == "ff" {
            return None;
        }
        if trace_id.len() != 32 || !is_lower_hex(trace_id) || is_all_zero(trace_id) {
            return None;
        }
        if span_id.len() != 16 || !is_lower_hex(span_id) || is_all_zero(span_id) {
            return None;
        }
        if flags.len() != 2 || !is_lower_hex(flags) {
            return None;
        }
        let flags = u8::from_str_radix(flags, 16).ok()?;
        Some(Self {
            trace_id: trace_id.to_string(),
            span_id: span_id.to_string(),
            parent_span_id: None,
            flags,
            baggage: Vec::new(),
        })
    }

    /// Extract the propagation context from incoming headers and derive the
    /// child span for this hop. Malformed or absent input starts a root.
    #[must_use]
    pub fn extract(traceparent: Option<&str>, baggage: Option<&str>) -> Self {
        match traceparent.and_then(Self::parse) {
            Some(incoming) => {
                let mut ctx = incoming.child();
                if let Some(raw) = baggage {
                    ctx.baggage = parse_baggage(raw);
                }
                ctx
            }
            None => {
                if traceparent.is_some() {
                    debug!("Malformed traceparent, starting new root context");
                }
                Self::new_root()
            }
        }
    }

    /// Encode as a `traceparent` header value
    #[must_use]
    pub fn to_traceparent(&self) -> String {
        format!("00-{}-{}-{:02x}", self.trace_id, self.span_id, self.flags)
    }

    /// Encode the baggage entries, or `None` when empty
    #[must_use]
    pub fn to_baggage(&self) -> Option<String> {
        if self.baggage.is_empty() {
            return None;
        }
        let encoded: Vec<String> = self
            .baggage
            .iter()
            .map(|(k, v)| format!("{}={}", k, utf8_percent_encode(v, BAGGAGE_ESCAPE)))
            .collect();
        Some(encoded.join(","))
    }
}

/// Parse a `baggage` header, skipping malformed entries
#[must_use]
pub fn parse_baggage(raw: &str) -> Vec<(String, String)> {
    raw.split(',')
        .filter_map(|entry| {
            let (key, value) = entry.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            // Properties after ';' are dropped; only the value survives
            let value = value.split(';').next().unwrap_or("").trim();
            let decoded = percent_decode_str(value).decode_utf8().ok()?;
            Some((key.to_string(), decoded.into_owned()))
        })
        .collect()
}

fn is_lower_hex(s: &str) -> bool {
    s.bytes()
        .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn is_all_zero(s: &str) -> bool {
    s.bytes().all(|b| b == b'0')
}

tokio::task_local! {
    static CURRENT_CONTEXT: TraceContext;
}

/// Run `fut` with `ctx` as the ambient per-task trace context
pub async fn with_context<F>(ctx: TraceContext, fut: F) -> F::Output
where
    F: Future,
{
    CURRENT_CONTEXT.scope(ctx, fut).await
}

/// The ambient context of the current task, if one is in scope
#[must_use]
pub fn current() -> Option<TraceContext> {
    CURRENT_CONTEXT.try_with(Clone::clone).ok()
}

/// A finished span, handed to the configured sink
#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub name: String,
    pub trace_id: String,
    pub span_id: String,
    pub parent_span_id: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub ok: bool,
}

/// Destination for finished spans. Trace storage and query live outside
/// the control plane; the core only writes.
pub trait TraceSink: Send + Sync {
    fn record(&self, span: &SpanRecord);
}

/// Default sink: structured log lines through `tracing`
#[derive(Debug, Default)]
pub struct LogTraceSink;

impl TraceSink for LogTraceSink {
    fn record(&self, span: &SpanRecord) {
        debug!(
            name = %span.name,
            trace_id = %span.trace_id,
            span_id = %span.span_id,
            parent_span_id = span.parent_span_id.as_deref().unwrap_or(""),
            duration_ms = span.duration_ms,
            ok = span.ok,
            "span finished"
        );
    }
}
