/*!
 * Pool Configuration
 *
 * Size-class geometry and tuning knobs for a heap. Defaults come from
 * `core::limits`; `from_env` layers `HEAPCORE_*` overrides on top.
 */

use super::audit::{AuditMode, ViolationAction};
use super::types::{MemoryError, MemoryResult};
use crate::core::limits::*;
use crate::core::types::SizeClass;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// How `protect` restores the protected block after popping the stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ProtectStrategy {
    /// Always raise, pop, and push back
    #[default]
    Baseline,
    /// Skip the raise/push round trip when the stack layout proves it unneeded
    Fast,
}

/// Heap configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// log2 of the smallest pool block; must hold a header
    pub min_block_log2: u8,
    /// log2 of the largest pool block
    pub max_pool_log2: u8,
    /// log2 of the superblock carved when a free list is empty
    pub superblock_log2: u8,
    /// Net bytes a class frees before its free list is rescanned
    pub rescan_threshold: usize,
    /// Outgoing repatriation bytes that force a flush
    pub repatriation_flush_bytes: usize,
    /// Mailbox bytes that ask the owner to drain
    pub repatriation_drain_bytes: usize,
    /// Largest accepted allocation
    pub max_allocation_bytes: usize,
    /// Entries per deferred-release stack segment
    pub stack_segment_entries: usize,
    pub protect: ProtectStrategy,
    pub audit: AuditMode,
    pub on_violation: ViolationAction,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_block_log2: DEFAULT_MIN_BLOCK_LOG2,
            max_pool_log2: DEFAULT_MAX_POOL_LOG2,
            superblock_log2: DEFAULT_SUPERBLOCK_LOG2,
            rescan_threshold: DEFAULT_RESCAN_THRESHOLD,
            repatriation_flush_bytes: DEFAULT_REPATRIATION_FLUSH_BYTES,
            repatriation_drain_bytes: DEFAULT_REPATRIATION_DRAIN_BYTES,
            max_allocation_bytes: DEFAULT_MAX_ALLOCATION,
            stack_segment_entries: DEFAULT_STACK_SEGMENT_ENTRIES,
            protect: ProtectStrategy::default(),
            audit: AuditMode::default(),
            on_violation: ViolationAction::default(),
        }
    }
}

impl PoolConfig {
    /// Small superblocks and eager rescans
    pub fn low_memory() -> Self {
        Self {
            superblock_log2: 14,
            max_pool_log2: 11,
            rescan_threshold: 64 * 1024,
            repatriation_flush_bytes: 8 * 1024,
            repatriation_drain_bytes: 32 * 1024,
            ..Self::default()
        }
    }

    /// Large superblocks, lazy rescans and the fast protect path
    pub fn throughput() -> Self {
        Self {
            superblock_log2: 18,
            rescan_threshold: 8 * 1024 * 1024,
            repatriation_flush_bytes: 128 * 1024,
            repatriation_drain_bytes: 1024 * 1024,
            protect: ProtectStrategy::Fast,
            ..Self::default()
        }
    }

    /// Defaults overridden by `HEAPCORE_*` environment variables
    ///
    /// Recognised: `HEAPCORE_SUPERBLOCK_LOG2`, `HEAPCORE_RESCAN_THRESHOLD`,
    /// `HEAPCORE_MAX_ALLOCATION`, `HEAPCORE_AUDIT` (off/checked/paranoid),
    /// `HEAPCORE_PROTECT` (baseline/fast). Unparseable values are logged and
    /// ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        if let Some(v) = env_parse("HEAPCORE_SUPERBLOCK_LOG2") {
            config.superblock_log2 = v;
        }
        if let Some(v) = env_parse("HEAPCORE_RESCAN_THRESHOLD") {
            config.rescan_threshold = v;
        }
        if let Some(v) = env_parse("HEAPCORE_MAX_ALLOCATION") {
            config.max_allocation_bytes = v;
        }
        if let Ok(v) = std::env::var("HEAPCORE_AUDIT") {
            match v.to_ascii_lowercase().as_str() {
                "off" => config.audit = AuditMode::Off,
                "checked" => config.audit = AuditMode::Checked,
                "paranoid" => config.audit = AuditMode::Paranoid,
                other => warn!("Ignoring HEAPCORE_AUDIT={}", other),
            }
        }
        if let Ok(v) = std::env::var("HEAPCORE_PROTECT") {
            match v.to_ascii_lowercase().as_str() {
                "baseline" => config.protect = ProtectStrategy::Baseline,
                "fast" => config.protect = ProtectStrategy::Fast,
                other => warn!("Ignoring HEAPCORE_PROTECT={}", other),
            }
        }
        config
    }

    pub fn with_superblock_log2(mut self, log2: u8) -> Self {
        self.superblock_log2 = log2;
        self
    }

    pub fn with_rescan_threshold(mut self, bytes: usize) -> Self {
        self.rescan_threshold = bytes;
        self
    }

    pub fn with_repatriation(mut self, flush_bytes: usize, drain_bytes: usize) -> Self {
        self.repatriation_flush_bytes = flush_bytes;
        self.repatriation_drain_bytes = drain_bytes;
        self
    }

    pub fn with_max_allocation(mut self, bytes: usize) -> Self {
        self.max_allocation_bytes = bytes;
        self
    }

    pub fn with_stack_segment_entries(mut self, entries: usize) -> Self {
        self.stack_segment_entries = entries;
        self
    }

    pub fn with_protect(mut self, protect: ProtectStrategy) -> Self {
        self.protect = protect;
        self
    }

    pub fn with_audit(mut self, audit: AuditMode, on_violation: ViolationAction) -> Self {
        self.audit = audit;
        self.on_violation = on_violation;
        self
    }

    /// Check the geometry is self-consistent
    pub fn validate(&self) -> MemoryResult<()> {
        let invalid = |msg: String| Err(MemoryError::InvalidConfig(msg));

        if (1usize << self.min_block_log2) < HEADER_BYTES {
            return invalid(format!(
                "smallest block 2^{} cannot hold a {}-byte header",
                self.min_block_log2, HEADER_BYTES
            ));
        }
        if self.max_pool_log2 < self.min_block_log2 {
            return invalid(format!(
                "max_pool_log2 {} below min_block_log2 {}",
                self.max_pool_log2, self.min_block_log2
            ));
        }
        if self.superblock_log2 <= self.max_pool_log2 || self.superblock_log2 > 30 {
            return invalid(format!(
                "superblock 2^{} must exceed the largest pool block 2^{} and stay within 2^30",
                self.superblock_log2, self.max_pool_log2
            ));
        }
        if (1usize << (self.superblock_log2 - self.min_block_log2)) > MAX_BLOCKS_PER_SUPERBLOCK {
            return invalid(format!(
                "superblock 2^{} holds more than {} blocks of 2^{}",
                self.superblock_log2, MAX_BLOCKS_PER_SUPERBLOCK, self.min_block_log2
            ));
        }
        if self.class_count() > MAX_SIZE_CODE as usize + 1 || self.class_count() > 64 {
            return invalid(format!("{} size classes is too many", self.class_count()));
        }
        if self.rescan_threshold == 0 || self.stack_segment_entries == 0 {
            return invalid("rescan threshold and stack segment size must be non-zero".into());
        }
        if self.max_allocation_bytes < HEADER_BYTES {
            return invalid(format!(
                "max_allocation_bytes {} is below the header size",
                self.max_allocation_bytes
            ));
        }
        Ok(())
    }

    /// Number of pool size classes
    #[inline]
    pub fn class_count(&self) -> usize {
        (self.max_pool_log2 - self.min_block_log2) as usize + 1
    }

    /// Block size of `class`, header included
    #[inline]
    pub fn block_bytes(&self, class: SizeClass) -> usize {
        1usize << (self.min_block_log2 + class.0)
    }

    #[inline]
    pub fn superblock_bytes(&self) -> usize {
        1usize << self.superblock_log2
    }

    #[inline]
    pub fn blocks_per_superblock(&self, class: SizeClass) -> usize {
        self.superblock_bytes() / self.block_bytes(class)
    }

    /// Smallest class holding `total` bytes, or `None` above the pool
    pub fn class_for_total(&self, total: usize) -> Option<SizeClass> {
        if total > 1usize << self.max_pool_log2 {
            return None;
        }
        let log2 = total
            .max(1 << self.min_block_log2)
            .next_power_of_two()
            .trailing_zeros() as u8;
        Some(SizeClass(log2 - self.min_block_log2))
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("Ignoring unparseable {}={}", key, raw);
            None
        }
    }
}
