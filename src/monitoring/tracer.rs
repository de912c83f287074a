/*!
 * Heap Tracing
 * Structured tracing for heap maintenance using the tracing crate
 *
 * Allocation and free are too hot to carry spans. Rescans, mailbox drains
 * and teardown are not, and a slow one is worth a warning.
 */

use crate::core::types::HeapId;
use std::time::{Duration, Instant};
use tracing::{debug, span, warn, Level, Span};
use tracing_subscriber::{
    fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

/// Maintenance taking longer than this is logged at warn
const SLOW_OPERATION: Duration = Duration::from_millis(10);

/// Initialize structured tracing
///
/// Environment variables:
/// - RUST_LOG: Set log level (default: info)
/// - HEAPCORE_TRACE_JSON: Enable JSON output (default: false)
///
/// Does nothing if a global subscriber is already installed.
pub fn init_tracing() {
    let _ = try_init_tracing();
}

/// As [`init_tracing`], reporting whether this call installed the subscriber
pub fn try_init_tracing() -> bool {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let use_json = std::env::var("HEAPCORE_TRACE_JSON")
        .map(|v| v == "1" || v == "true")
        .unwrap_or(false);

    let registry = tracing_subscriber::registry().with(env_filter);

    let installed = if use_json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_span_events(FmtSpan::CLOSE),
            )
            .try_init()
            .is_ok()
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_thread_names(true)
                    .with_span_events(FmtSpan::CLOSE)
                    .compact(),
            )
            .try_init()
            .is_ok()
    };
    if installed {
        debug!("Tracing initialized (json: {})", use_json);
    }
    installed
}

/// Timed span around one maintenance operation on a heap
pub struct HeapSpan {
    span: Span,
    start: Instant,
    operation: &'static str,
    heap: HeapId,
}

impl HeapSpan {
    pub fn new(operation: &'static str, heap: HeapId) -> Self {
        let span = span!(
            Level::DEBUG,
            "heap_op",
            op = operation,
            heap = heap.get(),
            items = tracing::field::Empty,
            duration_us = tracing::field::Empty,
        );
        Self {
            span,
            start: Instant::now(),
            operation,
            heap,
        }
    }

    /// Record how many blocks or superblocks the operation touched
    pub fn record_items(&self, count: usize) {
        self.span.record("items", count);
    }

    pub fn enter(&self) -> tracing::span::Entered<'_> {
        self.span.enter()
    }
}

impl Drop for HeapSpan {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        self.span.record("duration_us", elapsed.as_micros() as u64);
        if elapsed > SLOW_OPERATION {
            let _entered = self.span.enter();
            warn!(
                heap = %self.heap,
                op = self.operation,
                duration_ms = elapsed.as_millis() as u64,
                slow = true,
                "slow heap maintenance"
            );
        }
    }
}

/// Span for a maintenance operation on `heap`
pub fn span_heap_op(operation: &'static str, heap: HeapId) -> HeapSpan {
    HeapSpan::new(operation, heap)
}
