/*!
 * heapcore
 * Pooled size-class allocator, reference-counted block lifecycle and
 * futex mutex primitives for a multi-threaded array runtime
 */

pub mod core;
pub mod memory;
pub mod monitoring;

// Re-exports
pub use crate::core::errors::*;
pub use crate::core::sync::{
    CancellationToken, FutexGuard, FutexMutex, OwnerId, StrategyType, SyncConfig,
};
pub use crate::core::types::{HeapId, SizeClass};
pub use memory::{
    AuditMode, Block, Heap, HeapBuilder, HeapRegistry, HeapStats, PoolConfig, ProtectStrategy,
    StackMark, ValueKind, ValueLayout, ViolationAction,
};
pub use monitoring::init_tracing;
