//! Optional tracing hooks.
//!
//! Workflow phases report spans through the [`Tracer`] capability.
//! Implementations must be infallible from the caller's point of view:
//! an observability outage never halts execution.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

use tracing::debug;

/// Opaque handle for an open span.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SpanId(u64);

/// Span hooks for workflow phases.
pub trait Tracer: Send + Sync {
    fn start_span(&self, name: &str) -> SpanId;
    fn end_span(&self, span: SpanId);
}

/// Tracer that drops everything.
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn start_span(&self, _name: &str) -> SpanId {
        SpanId(0)
    }

    fn end_span(&self, _span: SpanId) {}
}

/// Tracer that logs span durations through `tracing`.
pub struct LogTracer {
    next_id: AtomicU64,
    open: Mutex<HashMap<SpanId, (String, Instant)>>,
}

impl LogTracer {
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            open: Mutex::new(HashMap::new()),
        }
    }
}

impl Default for LogTracer {
    fn default() -> Self {
        Self::new()
    }
}

impl Tracer for LogTracer {
    fn start_span(&self, name: &str) -> SpanId {
        let id = SpanId(self.next_id.fetch_add(1, Ordering::SeqCst));
        self.open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, (name.to_string(), Instant::now()));
        id
    }

    fn end_span(&self, span: SpanId) {
        let entry = self
            .open
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&span);
        if let Some((name, started)) = entry {
            debug!(
                span = %name,
                elapsed_ms = started.elapsed().as_millis() as u64,
                "Span ended"
            );
        }
    }
}
