/*!
 * Monitoring
 * Tracing setup and spans for heap maintenance
 */

mod tracer;

pub use tracer::{init_tracing, span_heap_op, try_init_tracing, HeapSpan};
