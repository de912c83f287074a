/*!
 * Limits and Constants
 *
 * Default tuning values for the pooled allocator and the mutex layer.
 * Every value here can be overridden through `PoolConfig` or `SyncConfig`;
 * these are only the starting points.
 *
 * Performance-critical constants are marked with [PERF].
 */

// =============================================================================
// BLOCK LAYOUT
// =============================================================================

/// Bytes reserved at the front of every block for its header
/// [PERF] One cache line; keeps block data 64-byte aligned
pub const HEADER_BYTES: usize = 64;

/// Current version stamped into every header tag
pub const HEADER_TAG_VERSION: u32 = 1;

// =============================================================================
// SIZE CLASSES
// =============================================================================

/// Smallest pool block (64 bytes, header only)
pub const DEFAULT_MIN_BLOCK_LOG2: u8 = 6;

/// Largest pool block (4KB); anything bigger is a system block
pub const DEFAULT_MAX_POOL_LOG2: u8 = 12;

/// Superblock carved into pool blocks when a free list runs dry (64KB)
/// [PERF] Large enough to amortize the mmap, small enough to coalesce often
pub const DEFAULT_SUPERBLOCK_LOG2: u8 = 16;

/// Upper bound on blocks per superblock
/// The root's free counter is 16 bits and must reach the block count
pub const MAX_BLOCKS_PER_SUPERBLOCK: usize = 1 << 15;

/// Number of size-class codes the header tag can carry
pub const MAX_SIZE_CODE: u8 = 63;

// =============================================================================
// COALESCING
// =============================================================================

/// Net bytes a class must free before its free list is rescanned (1MB)
/// [PERF] Scans are linear in the free list; too low and they dominate frees
pub const DEFAULT_RESCAN_THRESHOLD: usize = 1024 * 1024;

// =============================================================================
// REPATRIATION
// =============================================================================

/// Outgoing buffer size that forces a flush to the owning heap (32KB)
pub const DEFAULT_REPATRIATION_FLUSH_BYTES: usize = 32 * 1024;

/// Pending bytes in a mailbox that make the owner drain at its next safe point (256KB)
pub const DEFAULT_REPATRIATION_DRAIN_BYTES: usize = 256 * 1024;

// =============================================================================
// ALLOCATION LIMITS
// =============================================================================

/// Largest single allocation accepted (1TB)
/// Requests above this fail with `LimitExceeded` rather than reaching the OS
pub const DEFAULT_MAX_ALLOCATION: usize = 1 << 40;

// =============================================================================
// DEFERRED-RELEASE STACK
// =============================================================================

/// Entries per stack segment
/// [PERF] A segment is allocated once and recycled through a single spare
pub const DEFAULT_STACK_SEGMENT_ENTRIES: usize = 2048;

// =============================================================================
// MUTEX
// =============================================================================

/// Spins on a held mutex before marking it WAIT and sleeping
/// [PERF] Short critical sections usually clear within this window
pub const DEFAULT_MUTEX_SPINS: u32 = 40;
