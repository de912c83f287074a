/*!
 * Cross-Thread Repatriation
 *
 * A pool block freed by a heap other than its owner is returned through
 * the owner's [`Mailbox`]: a lock-free singly linked stack that any thread
 * may prepend a whole chain to (CAS loop) and only the owner empties
 * (swap with null). Freeing heaps batch blocks per destination in an
 * [`Outgoing`] buffer so one CAS carries many blocks.
 *
 * The drain flag and byte counters are advisory. A stale read delays
 * reclamation and never causes a wrong one.
 */

use super::header::BlockHeader;
use super::os::{MmapMemory, SystemForeignAllocator};
use super::traits::{ForeignAllocator, SymbolTableHook, VirtualMemory};
use crate::core::types::HeapId;
use ahash::RandomState;
use dashmap::DashMap;
use std::ptr::{self, NonNull};
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicPtr, AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{debug, trace};

/// Incoming side of repatriation, one per heap
#[repr(C, align(64))]
pub(crate) struct Mailbox {
    head: AtomicPtr<BlockHeader>,
    /// Pool bytes queued but not yet drained
    pending_bytes: AtomicIsize,
    /// System-block bytes unmapped by other heaps on the owner's behalf
    system_credit: AtomicIsize,
    drain_requested: AtomicBool,
    /// Owner's local bytes-in-use, published for registry-wide totals
    published_in_use: AtomicIsize,
}

impl Mailbox {
    fn new() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            pending_bytes: AtomicIsize::new(0),
            system_credit: AtomicIsize::new(0),
            drain_requested: AtomicBool::new(false),
            published_in_use: AtomicIsize::new(0),
        }
    }

    /// Prepend the chain `head..=tail` holding `bytes`
    ///
    /// # Safety
    /// The chain must be linked through `chain`, owned exclusively by the
    /// caller, and consist of free pool blocks owned by this mailbox's heap.
    pub(crate) unsafe fn deliver(
        &self,
        head: NonNull<BlockHeader>,
        tail: NonNull<BlockHeader>,
        bytes: usize,
        drain_threshold: usize,
    ) {
        let before = self.pending_bytes.fetch_add(bytes as isize, Ordering::Relaxed);
        let mut current = self.head.load(Ordering::Acquire);
        loop {
            (*tail.as_ptr()).chain = current;
            match self.head.compare_exchange_weak(
                current,
                head.as_ptr(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        if before + bytes as isize >= drain_threshold as isize {
            self.drain_requested.store(true, Ordering::Release);
        }
    }

    /// Take the whole queued chain
    pub(crate) fn take(&self) -> Option<NonNull<BlockHeader>> {
        NonNull::new(self.head.swap(ptr::null_mut(), Ordering::AcqRel))
    }

    #[inline]
    pub(crate) fn has_mail(&self) -> bool {
        !self.head.load(Ordering::Acquire).is_null()
    }

    #[inline]
    pub(crate) fn drain_requested(&self) -> bool {
        self.drain_requested.load(Ordering::Acquire)
    }

    #[inline]
    pub(crate) fn clear_drain_request(&self) {
        self.drain_requested.store(false, Ordering::Release);
    }

    #[inline]
    pub(crate) fn settle_pending(&self, bytes: usize) {
        self.pending_bytes.fetch_sub(bytes as isize, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn pending_bytes(&self) -> isize {
        self.pending_bytes.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn credit_system_free(&self, bytes: usize) {
        self.system_credit.fetch_add(bytes as isize, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn take_system_credit(&self) -> isize {
        self.system_credit.swap(0, Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn system_credit(&self) -> isize {
        self.system_credit.load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn publish_in_use(&self, bytes: isize) {
        self.published_in_use.store(bytes, Ordering::Relaxed);
    }

    fn outstanding(&self) -> isize {
        self.published_in_use.load(Ordering::Relaxed) - self.pending_bytes() - self.system_credit()
    }
}

/// A flushed batch for one destination
pub(crate) struct Batch {
    pub(crate) dest: HeapId,
    pub(crate) head: NonNull<BlockHeader>,
    pub(crate) tail: NonNull<BlockHeader>,
    pub(crate) bytes: usize,
    pub(crate) blocks: usize,
}

/// Outgoing side of repatriation: blocks bound for a single destination
pub(crate) struct Outgoing {
    dest: Option<HeapId>,
    head: *mut BlockHeader,
    tail: *mut BlockHeader,
    bytes: usize,
    blocks: usize,
}

impl Outgoing {
    pub(crate) fn new() -> Self {
        Self {
            dest: None,
            head: ptr::null_mut(),
            tail: ptr::null_mut(),
            bytes: 0,
            blocks: 0,
        }
    }

    #[inline]
    pub(crate) fn dest(&self) -> Option<HeapId> {
        self.dest
    }

    #[inline]
    pub(crate) fn bytes(&self) -> usize {
        self.bytes
    }

    /// Append a block for `dest`, keeping enqueue order
    ///
    /// # Safety
    /// `block` is a free pool block owned by `dest` and not linked anywhere.
    /// The buffer must be empty or already bound for `dest`.
    pub(crate) unsafe fn push(&mut self, dest: HeapId, block: NonNull<BlockHeader>, bytes: usize) {
        debug_assert!(self.dest.map_or(true, |d| d == dest));
        let raw = block.as_ptr();
        (*raw).chain = ptr::null_mut();
        if self.tail.is_null() {
            self.head = raw;
        } else {
            (*self.tail).chain = raw;
        }
        self.tail = raw;
        self.dest = Some(dest);
        self.bytes += bytes;
        self.blocks += 1;
    }

    /// Empty the buffer
    pub(crate) fn take(&mut self) -> Option<Batch> {
        let dest = self.dest.take()?;
        let head = NonNull::new(std::mem::replace(&mut self.head, ptr::null_mut()))?;
        let tail = NonNull::new(std::mem::replace(&mut self.tail, ptr::null_mut()))?;
        let batch = Batch {
            dest,
            head,
            tail,
            bytes: std::mem::take(&mut self.bytes),
            blocks: std::mem::take(&mut self.blocks),
        };
        Some(batch)
    }
}

/// Shared directory of heaps and the OS-level capabilities they allocate from
pub struct HeapRegistry {
    mailboxes: DashMap<HeapId, Arc<Mailbox>, RandomState>,
    next_id: AtomicU32,
    memory: Arc<dyn VirtualMemory>,
    foreign: Arc<dyn ForeignAllocator>,
    symbol_hook: Option<Arc<dyn SymbolTableHook>>,
}

impl HeapRegistry {
    /// Registry over anonymous mappings and the global allocator
    pub fn new() -> Self {
        Self {
            mailboxes: DashMap::with_hasher(RandomState::new()),
            next_id: AtomicU32::new(1),
            memory: Arc::new(MmapMemory::new()),
            foreign: Arc::new(SystemForeignAllocator),
            symbol_hook: None,
        }
    }

    /// Use a different virtual-memory capability
    pub fn with_memory(mut self, memory: Arc<dyn VirtualMemory>) -> Self {
        self.memory = memory;
        self
    }

    /// Use a different foreign allocator
    pub fn with_foreign(mut self, foreign: Arc<dyn ForeignAllocator>) -> Self {
        self.foreign = foreign;
        self
    }

    /// Install the symbol-table release hook
    pub fn with_symbol_hook(mut self, hook: Arc<dyn SymbolTableHook>) -> Self {
        self.symbol_hook = Some(hook);
        self
    }

    pub(crate) fn register(&self) -> (HeapId, Arc<Mailbox>) {
        let id = HeapId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mailbox = Arc::new(Mailbox::new());
        self.mailboxes.insert(id, mailbox.clone());
        debug!("Registered {}", id);
        (id, mailbox)
    }

    pub(crate) fn unregister(&self, id: HeapId) {
        self.mailboxes.remove(&id);
        debug!("Unregistered {}", id);
    }

    pub(crate) fn mailbox(&self, id: HeapId) -> Option<Arc<Mailbox>> {
        let found = self.mailboxes.get(&id).map(|m| m.value().clone());
        if found.is_none() {
            trace!("No mailbox for {}", id);
        }
        found
    }

    #[inline]
    pub(crate) fn memory(&self) -> &dyn VirtualMemory {
        self.memory.as_ref()
    }

    #[inline]
    pub(crate) fn foreign(&self) -> &dyn ForeignAllocator {
        self.foreign.as_ref()
    }

    #[inline]
    pub(crate) fn symbol_hook(&self) -> Option<&dyn SymbolTableHook> {
        self.symbol_hook.as_deref()
    }

    /// Number of live heaps
    pub fn heap_count(&self) -> usize {
        self.mailboxes.len()
    }

    /// Bytes in use summed over every live heap
    ///
    /// Built from values each heap publishes as it allocates and frees, so
    /// it may trail concurrent activity slightly.
    pub fn total_bytes_in_use(&self) -> i64 {
        self.mailboxes
            .iter()
            .map(|entry| entry.value().outstanding() as i64)
            .sum()
    }
}

impl Default for HeapRegistry {
    fn default() -> Self {
        Self::new()
    }
}
