/*!
 * Per-Thread Heap
 *
 * A `Heap` is the allocator context a thread passes to every operation. It
 * owns:
 *
 * - one free list per power-of-two size class, refilled by carving 64KB
 *   (configurable) superblocks
 * - the deferred-release stack that frees temporaries when a scope unwinds
 * - an outgoing repatriation buffer for blocks owned by other heaps
 * - byte accounting and the optional high-water tracking session
 *
 * ## Coalescing
 *
 * Frees only push onto a free list. Each class counts down from the rescan
 * threshold by freed bytes; when it reaches zero the class is rescanned at
 * the next safe point and every superblock whose blocks are all free is
 * returned to the OS.
 *
 * ## Safe points
 *
 * Pending rescans and mailbox drains run at the end of `pop_stack`,
 * `free`, `lower`, `protect`, `drain_repatriated` and `collect`, never in
 * the middle of a release traversal.
 *
 * A heap is `!Send`: it stays on the thread that created it. Blocks can move
 * between threads; freeing a foreign-owned block routes it home through the
 * owner's mailbox.
 */

mod allocator;
mod free_list;
mod gc;
mod lifecycle;
mod protect;
mod stack;
mod tracking;

pub use stack::StackMark;

use super::audit::{fatal, AuditViolation};
use super::config::PoolConfig;
use super::repatriation::{HeapRegistry, Mailbox, Outgoing};
use super::types::MemoryResult;
use crate::core::types::{HeapId, SizeClass};
use free_list::ClassPool;
use stack::ReleaseStack;
use std::sync::Arc;
use tracing::{debug, info, warn};
use tracking::Tracking;

#[derive(Debug, Default, Clone, Copy)]
struct HeapCounters {
    superblocks_carved: u64,
    superblocks_released: u64,
    collections: u64,
    blocks_repatriated_in: u64,
    blocks_repatriated_out: u64,
}

/// Per-thread allocator context
pub struct Heap {
    id: HeapId,
    config: PoolConfig,
    registry: Arc<HeapRegistry>,
    mailbox: Arc<Mailbox>,
    pools: Vec<ClassPool>,
    /// Bit per class with a rescan due
    pending_collect: u64,
    stack: ReleaseStack,
    outgoing: Outgoing,
    tracking: Tracking,
    counters: HeapCounters,
}

/// Builder for [`Heap`]
pub struct HeapBuilder {
    registry: Arc<HeapRegistry>,
    config: PoolConfig,
}

impl HeapBuilder {
    pub fn new(registry: Arc<HeapRegistry>) -> Self {
        Self {
            registry,
            config: PoolConfig::default(),
        }
    }

    pub fn with_config(mut self, config: PoolConfig) -> Self {
        self.config = config;
        self
    }

    /// Validate the configuration and register the heap
    pub fn build(self) -> MemoryResult<Heap> {
        self.config.validate()?;

        let config = self.config;
        let pools = (0..config.class_count() as u8)
            .map(|c| {
                let class = SizeClass(c);
                ClassPool::new(
                    config.block_bytes(class),
                    config.blocks_per_superblock(class),
                    config.rescan_threshold,
                )
            })
            .collect();
        let (id, mailbox) = self.registry.register();

        info!(
            "{} initialized: {} size classes ({}..={} bytes), {} byte superblocks, audit {:?}",
            id,
            config.class_count(),
            1usize << config.min_block_log2,
            1usize << config.max_pool_log2,
            config.superblock_bytes(),
            config.audit
        );

        Ok(Heap {
            id,
            stack: ReleaseStack::new(config.stack_segment_entries),
            config,
            registry: self.registry,
            mailbox,
            pools,
            pending_collect: 0,
            outgoing: Outgoing::new(),
            tracking: Tracking::new(),
            counters: HeapCounters::default(),
        })
    }
}

impl Heap {
    /// Heap with the default configuration
    pub fn new(registry: Arc<HeapRegistry>) -> MemoryResult<Self> {
        HeapBuilder::new(registry).build()
    }

    pub fn builder(registry: Arc<HeapRegistry>) -> HeapBuilder {
        HeapBuilder::new(registry)
    }

    #[inline]
    pub fn id(&self) -> HeapId {
        self.id
    }

    #[inline]
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    #[inline]
    pub fn registry(&self) -> &Arc<HeapRegistry> {
        &self.registry
    }

    /// Run pending mailbox drains and rescans
    fn safe_point(&mut self) {
        if self.mailbox.drain_requested() {
            self.drain_inbox();
        }
        if self.pending_collect != 0 {
            self.collect_pending();
        }
    }

    #[inline]
    fn violation(&self, violation: AuditViolation) -> ! {
        fatal(self.config.on_violation, violation)
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // Releasing into a heap that may be inconsistent risks a double panic
            self.registry.unregister(self.id);
            return;
        }

        self.pop_entries(0);
        self.flush_repatriation();
        self.drain_inbox();
        self.registry.unregister(self.id);
        // Senders that looked the mailbox up before it was removed may still deliver
        self.drain_inbox();
        self.collect();

        let outstanding = self.bytes_in_use();
        if outstanding != 0 {
            warn!(
                "{} dropped with {} bytes still in use; {} bytes stay mapped",
                self.id, outstanding, self.tracking.os_bytes()
            );
        } else {
            debug!("{} dropped cleanly", self.id);
        }
    }
}
