/*!
 * Memory Module
 * Pooled size-class allocator with lazy coalescing and cross-thread repatriation
 */

pub mod audit;
pub mod block;
pub mod config;
pub mod header;
pub mod heap;
pub mod os;
pub mod repatriation;
pub mod traits;
pub mod types;

// Re-export for convenience
pub use audit::{AuditMode, AuditViolation, ViolationAction};
pub use block::{Block, ValueKind, ValueLayout};
pub use config::{PoolConfig, ProtectStrategy};
pub use header::{BlockTag, HeaderTag, Usecount};
pub use heap::{Heap, HeapBuilder, StackMark};
pub use os::{MmapMemory, SystemForeignAllocator};
pub use repatriation::HeapRegistry;
pub use traits::*;
pub use types::*;
