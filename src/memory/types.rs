/*!
 * Memory Types
 * Allocator errors and introspection records
 */

use crate::core::types::{HeapId, SizeClass};
use miette::Diagnostic;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Memory operation result
pub type MemoryResult<T> = Result<T, MemoryError>;

/// Allocator errors
#[derive(Error, Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Diagnostic)]
#[serde(tag = "error_type", content = "details", rename_all = "snake_case")]
pub enum MemoryError {
    #[error("Out of memory: the OS refused {requested} bytes")]
    #[diagnostic(
        code(memory::out_of_memory),
        help("The system is low on memory or address space. Release blocks or lower the working set.")
    )]
    OutOfMemory { requested: usize },

    #[error("Allocation of {requested} bytes exceeds the limit of {limit} bytes")]
    #[diagnostic(
        code(memory::limit_exceeded),
        help("Raise PoolConfig::max_allocation_bytes if this size is intended.")
    )]
    LimitExceeded { requested: usize, limit: usize },

    #[error("Size class {class} out of range (heap has {classes} classes)")]
    #[diagnostic(code(memory::invalid_size_class))]
    InvalidSizeClass { class: u8, classes: usize },

    #[error("Invalid pool configuration: {0}")]
    #[diagnostic(
        code(memory::invalid_config),
        help("Check size class bounds against the superblock size.")
    )]
    InvalidConfig(String),

    #[error("Operation not supported on a virtual block")]
    #[diagnostic(
        code(memory::virtual_block),
        help("Realize the view first to get an owned copy.")
    )]
    VirtualBlock,

    #[error("Operation not supported for {0} blocks")]
    #[diagnostic(code(memory::unsupported_kind))]
    UnsupportedKind(String),

    #[error("Offset {offset} out of bounds for length {len}")]
    #[diagnostic(code(memory::out_of_bounds))]
    OutOfBounds { offset: usize, len: usize },

    #[error("{op} failed with errno {errno}")]
    #[diagnostic(
        code(memory::system_call),
        help("Pinning memory may require raising RLIMIT_MEMLOCK.")
    )]
    SystemCall { op: String, errno: i32 },
}

/// Per-class pool statistics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ClassStats {
    pub class: SizeClass,
    pub block_bytes: usize,
    pub free_blocks: usize,
    pub superblocks: usize,
    /// Bytes still to be freed before the next rescan
    pub rescan_countdown: i64,
}

/// Heap statistics snapshot
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeapStats {
    pub heap: HeapId,
    pub bytes_in_use: i64,
    pub os_bytes: usize,
    pub os_bytes_peak: usize,
    pub superblocks_carved: u64,
    pub superblocks_released: u64,
    pub collections: u64,
    pub blocks_repatriated_in: u64,
    pub blocks_repatriated_out: u64,
    pub stack_depth: usize,
    pub classes: Vec<ClassStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tracking_peak: Option<i64>,
}

impl HeapStats {
    /// Total free pool blocks across classes
    pub fn free_blocks(&self) -> usize {
        self.classes.iter().map(|c| c.free_blocks).sum()
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }
}

impl fmt::Display for HeapStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} bytes in use, {} bytes mapped (peak {}), {} free blocks, {} collections",
            self.heap,
            self.bytes_in_use,
            self.os_bytes,
            self.os_bytes_peak,
            self.free_blocks(),
            self.collections
        )
    }
}
