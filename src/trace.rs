//! Distributed trace context propagation
//!
//! The tracing agent is an injected collaborator with two jobs: serialize the
//! current trace context so it can ride along inside a message, and start a
//! span that continues a context received from a peer. Contexts use the W3C
//! `traceparent` text form (`00-<trace id>-<span id>-<flags>`).

use rand::Rng;
use std::fmt;
use std::time::Instant;
use tracing::{debug, Span};

/// A span started for one inbound message
pub trait TraceSpan: Send + Sync {
    /// Serialized context of this span, for passing to further publishes
    fn context(&self) -> Option<String>;

    /// Finish the span
    fn end(self: Box<Self>);
}

/// Tracing agent consumed by the reply bus
pub trait Tracer: Send + Sync {
    /// Serialized context to attach to an outgoing message that was not given
    /// one explicitly, if tracing is active
    fn current_context(&self) -> Option<String>;

    /// Start a span named `name`, continuing `parent` when it is a valid context
    fn start_span(&self, name: &str, kind: &str, parent: Option<&str>) -> Box<dyn TraceSpan>;
}

/// Parsed W3C trace parent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TraceParent {
    pub trace_id: u128,
    pub span_id: u64,
    pub flags: u8,
}

impl TraceParent {
    /// Start a new trace
    pub fn root() -> Self {
        let mut rng = rand::thread_rng();
        Self {
            trace_id: rng.gen::<u128>().max(1),
            span_id: rng.gen::<u64>().max(1),
            flags: 0x01,
        }
    }

    /// A new span in the same trace
    pub fn child(&self) -> Self {
        Self {
            trace_id: self.trace_id,
            span_id: rand::thread_rng().gen::<u64>().max(1),
            flags: self.flags,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        let mut parts = s.trim().split('-');
        let version = parts.next()?;
        let trace_id = parts.next()?;
        let span_id = parts.next()?;
        let flags = parts.next()?;

        if version != "00" || parts.next().is_some() {
            return None;
        }
        if trace_id.len() != 32 || span_id.len() != 16 || flags.len() != 2 {
            return None;
        }

        let trace_id = u128::from_str_radix(trace_id, 16).ok()?;
        let span_id = u64::from_str_radix(span_id, 16).ok()?;
        let flags = u8::from_str_radix(flags, 16).ok()?;

        // All-zero ids are invalid
        if trace_id == 0 || span_id == 0 {
            return None;
        }

        Some(Self {
            trace_id,
            span_id,
            flags,
        })
    }
}

impl fmt::Display for TraceParent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "00-{:032x}-{:016x}-{:02x}",
            self.trace_id, self.span_id, self.flags
        )
    }
}

/// Tracer that records spans with the `tracing` crate
///
/// It keeps no ambient context: `current_context` starts a new root trace on
/// every call. A publish made while handling a message joins that message's
/// trace only when the handler passes `IncomingMessage::trace_context` on
/// through `PublishOptions::trace_context`.
#[derive(Debug, Clone, Default)]
pub struct TracingTracer;

impl Tracer for TracingTracer {
    fn current_context(&self) -> Option<String> {
        Some(TraceParent::root().to_string())
    }

    fn start_span(&self, name: &str, kind: &str, parent: Option<&str>) -> Box<dyn TraceSpan> {
        let parent = parent.and_then(TraceParent::parse);
        let context = parent.map(|p| p.child()).unwrap_or_else(TraceParent::root);

        let trace_id = format!("{:032x}", context.trace_id);
        let span_id = format!("{:016x}", context.span_id);
        let parent_span_id = parent.map(|p| format!("{:016x}", p.span_id));

        let span = tracing::info_span!(
            "replybus.message",
            name = %name,
            kind = %kind,
            trace_id = %trace_id,
            span_id = %span_id,
            parent_span_id = ?parent_span_id,
        );

        Box::new(TracingSpan {
            span,
            context,
            started: Instant::now(),
        })
    }
}

struct TracingSpan {
    span: Span,
    context: TraceParent,
    started: Instant,
}

impl TraceSpan for TracingSpan {
    fn context(&self) -> Option<String> {
        Some(self.context.to_string())
    }

    fn end(self: Box<Self>) {
        let elapsed = self.started.elapsed();
        self.span.in_scope(|| {
            debug!(duration_us = elapsed.as_micros() as u64, "Span ended");
        });
    }
}

/// Tracer that never attaches or records anything
#[derive(Debug, Clone, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn current_context(&self) -> Option<String> {
        None
    }

    fn start_span(&self, _name: &str, _kind: &str, parent: Option<&str>) -> Box<dyn TraceSpan> {
        Box::new(NoopSpan {
            parent: parent.map(str::to_string),
        })
    }
}

struct NoopSpan {
    parent: Option<String>,
}

impl TraceSpan for NoopSpan {
    fn context(&self) -> Option<String> {
        self.parent.clone()
    }

    fn end(self: Box<Self>) {}
}
