/*!
 * Allocation and Free Routing
 *
 * Pool classes pop their free list MRU first, fall back to draining
 * repatriated blocks, then carve a new superblock. Requests above the
 * largest class get their own mapping rounded to a power of two.
 *
 * Frees route on the header tag: pool blocks of this heap go back on the
 * class free list, pool blocks of another heap are batched for
 * repatriation, system blocks are unmapped on the spot.
 */

use super::stack::header_mut;
use super::Heap;
use crate::core::limits::{HEADER_BYTES, MAX_SIZE_CODE};
use crate::core::types::{HeapId, SizeClass};
use crate::memory::audit::AuditViolation;
use crate::memory::block::{Block, ValueLayout};
use crate::memory::header::{BlockHeader, BlockTag, HeaderTag, Usecount, FLAG_RECURSIVE};
use crate::memory::types::{MemoryError, MemoryResult};
use crate::monitoring::span_heap_op;
use std::ptr::{self, NonNull};
use tracing::{debug, error, trace, warn};

impl Heap {
    /// Allocate a raw block of pool class `class`
    ///
    /// The block holds `capacity` bytes (block size minus header), starts
    /// with usecount 1 inplaceable, and is registered on the deferred-release
    /// stack.
    pub fn allocate(&mut self, class: SizeClass) -> MemoryResult<Block> {
        if class.index() >= self.pools.len() {
            return Err(MemoryError::InvalidSizeClass {
                class: class.0,
                classes: self.pools.len(),
            });
        }
        let capacity = self.pools[class.index()].block_bytes - HEADER_BYTES;
        self.stack.ensure_room()?;
        let raw = self.pool_alloc(class)?;
        Ok(self.adopt(raw, ValueLayout::bytes(capacity)))
    }

    /// Allocate `n` bytes of payload
    pub fn allocate_bytes(&mut self, n: usize) -> MemoryResult<Block> {
        self.allocate_value(ValueLayout::bytes(n))
    }

    /// Allocate a block shaped by `layout`, child slots zeroed
    pub fn allocate_value(&mut self, layout: ValueLayout) -> MemoryResult<Block> {
        let total = self.checked_total(layout.data_bytes()?)?;
        self.stack.ensure_room()?;
        let raw = match self.config.class_for_total(total) {
            Some(class) => self.pool_alloc(class)?,
            None => self.system_alloc(total)?,
        };
        Ok(self.adopt(raw, layout))
    }

    /// Allocate `n` bytes from the foreign allocator
    ///
    /// Foreign blocks carry a normal header and lifecycle but are not
    /// counted in `bytes_in_use`.
    pub fn allocate_foreign(&mut self, n: usize) -> MemoryResult<Block> {
        let total = self.checked_total(n)?;
        let size_log2 = size_log2_for(total)?;
        self.stack.ensure_room()?;
        let bytes = 1usize << size_log2;
        let base = self
            .registry
            .foreign()
            .allocate(bytes)
            .ok_or(MemoryError::OutOfMemory { requested: bytes })?;
        let raw = base.cast::<BlockHeader>();
        // SAFETY: fresh allocation of at least a header
        unsafe {
            raw.as_ptr().write(BlockHeader::new(
                HeaderTag::encode(BlockTag::Foreign { size_log2 }),
                self.id.get(),
            ));
        }
        Ok(self.adopt(raw, ValueLayout::bytes(n)))
    }

    fn checked_total(&self, data_bytes: usize) -> MemoryResult<usize> {
        let limit = self.config.max_allocation_bytes;
        let total = data_bytes
            .checked_add(HEADER_BYTES)
            .ok_or(MemoryError::LimitExceeded {
                requested: usize::MAX,
                limit,
            })?;
        if total > limit {
            return Err(MemoryError::LimitExceeded {
                requested: total,
                limit,
            });
        }
        Ok(total)
    }

    /// Fill in the value fields of a freshly allocated header and register it
    fn adopt(&mut self, raw: NonNull<BlockHeader>, layout: ValueLayout) -> Block {
        let block = Block::from_header(raw);
        let header = header_mut(block);
        header.chain = ptr::null_mut();
        header.aux = ptr::null_mut();
        // SAFETY: every block is at least one header plus its payload
        header.data = unsafe { BlockHeader::data_area(raw.as_ptr()) };
        header.len = layout.len;
        header.kind = layout.kind as u8;
        header.rank = layout.rank;
        header.atom_log2 = layout.atom_log2;
        header.flags = if layout.kind.born_recursive() {
            FLAG_RECURSIVE
        } else {
            0
        };
        header.usecount = Usecount::fresh();
        header.zaploc = 0;
        header.tag = header.tag.with_free(false);

        let slots = layout.kind.child_slots(layout.len);
        // SAFETY: the payload holds `slots` child slots
        unsafe { ptr::write_bytes(block.slot(0), 0, slots) };

        self.push_entry(block);
        block
    }

    /// Pop a block of `class`, draining mail or carving as needed
    pub(crate) fn pool_alloc(&mut self, class: SizeClass) -> MemoryResult<NonNull<BlockHeader>> {
        let c = class.index();
        let popped = match self.pools[c].free.pop() {
            Some(raw) => Some(raw),
            None => {
                if self.mailbox.has_mail() {
                    self.drain_inbox();
                }
                self.pools[c].free.pop()
            }
        };
        let raw = match popped {
            Some(raw) => raw,
            None => {
                // A freshly carved root was never on a list
                let root = self.carve(class)?;
                self.charge(class);
                return Ok(root);
            }
        };

        if self.config.audit.enabled() {
            // SAFETY: free-list members are free headers
            let tag = unsafe { (*raw.as_ptr()).tag };
            match tag.decode() {
                Some(BlockTag::Pool { class: found, .. }) if found == class => {}
                Some(BlockTag::Pool { class: found, .. }) => {
                    self.violation(AuditViolation::WrongClass {
                        addr: raw.as_ptr() as usize,
                        list: class.0,
                        tag: found.0,
                    })
                }
                _ => self.violation(AuditViolation::BadTag {
                    addr: raw.as_ptr() as usize,
                    raw: tag.raw(),
                }),
            }
            if !tag.is_free() {
                self.violation(AuditViolation::NotFree {
                    addr: raw.as_ptr() as usize,
                });
            }
        }

        self.charge(class);
        Ok(raw)
    }

    #[inline]
    fn charge(&mut self, class: SizeClass) {
        let c = class.index();
        let bytes = self.pools[c].block_bytes;
        self.pools[c].trigger += bytes as isize;
        self.note_allocated(bytes);
    }

    /// Map a superblock, put every block but the root on the free list and
    /// return the root
    fn carve(&mut self, class: SizeClass) -> MemoryResult<NonNull<BlockHeader>> {
        let sb_bytes = self.config.superblock_bytes();
        let base = match self.registry.memory().allocate(sb_bytes) {
            Ok(base) => base,
            Err(e) => {
                error!("{} could not map a {} byte superblock: {}", self.id, sb_bytes, e);
                return Err(MemoryError::OutOfMemory { requested: sb_bytes });
            }
        };

        let c = class.index();
        let block_bytes = self.pools[c].block_bytes;
        let count = self.pools[c].blocks_per_superblock;
        let owner = self.id.get();
        let at = |i: usize| -> *mut BlockHeader {
            // SAFETY: i < count, inside the mapping
            unsafe { base.as_ptr().add(i * block_bytes) as *mut BlockHeader }
        };

        // Chain blocks 1..count in ascending address order
        for i in 1..count {
            let tag = HeaderTag::encode(BlockTag::Pool {
                class,
                index: i as u16,
            });
            let mut header = BlockHeader::new(tag.with_free(true), owner);
            header.chain = if i + 1 < count { at(i + 1) } else { ptr::null_mut() };
            // SAFETY: writable, block-aligned, inside the mapping
            unsafe { at(i).write(header) };
        }
        let root = at(0);
        // SAFETY: as above
        unsafe {
            root.write(BlockHeader::new(
                HeaderTag::encode(BlockTag::Pool { class, index: 0 }),
                owner,
            ));
        }
        if count > 1 {
            // SAFETY: the chain just written is well formed and holds count - 1 blocks
            let free = &mut self.pools[c].free;
            let old_head = free.head();
            let old_len = free.len();
            unsafe {
                (*at(count - 1)).chain = old_head;
                free.replace(at(1), old_len + count - 1);
            }
        }

        self.pools[c].superblocks += 1;
        self.counters.superblocks_carved += 1;
        self.tracking.mapped(sb_bytes);
        debug!(
            "{} carved superblock {:p} for class {} ({} blocks of {} bytes)",
            self.id, base, class, count, block_bytes
        );
        // SAFETY: non-null, derived from the mapping
        Ok(unsafe { NonNull::new_unchecked(root) })
    }

    fn system_alloc(&mut self, total: usize) -> MemoryResult<NonNull<BlockHeader>> {
        let size_log2 = size_log2_for(total)?;
        let bytes = 1usize << size_log2;
        let base = self.registry.memory().allocate(bytes).map_err(|e| {
            warn!("{} system allocation of {} bytes failed: {}", self.id, bytes, e);
            MemoryError::OutOfMemory { requested: bytes }
        })?;
        let raw = base.cast::<BlockHeader>();
        // SAFETY: fresh mapping of `bytes` >= header
        unsafe {
            raw.as_ptr().write(BlockHeader::new(
                HeaderTag::encode(BlockTag::System { size_log2 }),
                self.id.get(),
            ));
        }
        self.tracking.mapped(bytes);
        self.note_allocated(bytes);
        trace!("{} mapped system block of {} bytes", self.id, bytes);
        Ok(raw)
    }

    /// Return `block` to its pool or the OS, wherever it came from
    ///
    /// Clears the block's stack entry first, so a later `pop_stack` does not
    /// touch it. What the block owns goes with it: a view lowers its backer
    /// and a recursive compound lowers its children. Permanent blocks are
    /// never freed.
    pub fn free(&mut self, block: Block) {
        if block.is_permanent() {
            debug!("{} ignored free of permanent {:?}", self.id, block);
            return;
        }
        if self.config.audit.enabled() && block.tag().is_free() {
            self.violation(AuditViolation::DoubleFree { addr: block.addr() });
        }
        self.detach(block);
        self.drop_owned(block);
        self.free_block(block.header());
        self.safe_point();
    }

    /// Route a block whose references are all gone
    pub(crate) fn free_block(&mut self, raw: NonNull<BlockHeader>) {
        let addr = raw.as_ptr() as usize;
        // SAFETY: caller hands over a live header
        let header = unsafe { &mut *raw.as_ptr() };
        let tag = header.tag;
        let audit = self.config.audit.enabled();

        if audit && tag.is_free() {
            self.violation(AuditViolation::DoubleFree { addr });
        }
        let Some(decoded) = tag.decode() else {
            self.violation(AuditViolation::BadTag {
                addr,
                raw: tag.raw(),
            });
        };
        let owner = HeapId(header.owner);
        if audit {
            header.usecount = Usecount::poisoned();
        }

        match decoded {
            BlockTag::Pool { class, .. } => {
                header.tag = tag.with_free(true);
                if owner == self.id {
                    self.push_free(class, raw);
                } else {
                    self.send_home(owner, class, raw);
                }
            }
            BlockTag::System { size_log2 } => {
                let bytes = 1usize << size_log2;
                // SAFETY: system blocks are whole mappings of `bytes`
                unsafe { self.registry.memory().release(raw.cast(), bytes) };
                if owner == self.id {
                    self.tracking.unmapped(bytes);
                    self.note_freed(bytes);
                } else if let Some(mailbox) = self.registry.mailbox(owner) {
                    mailbox.credit_system_free(bytes);
                } else {
                    warn!("{} freed a system block of departed {}", self.id, owner);
                }
            }
            BlockTag::Foreign { size_log2 } => {
                // SAFETY: allocated by the foreign allocator with this size
                unsafe { self.registry.foreign().free(raw.cast(), 1usize << size_log2) };
            }
        }
    }

    fn push_free(&mut self, class: SizeClass, raw: NonNull<BlockHeader>) {
        let c = class.index();
        let bytes = self.pools[c].block_bytes;
        let pool = &mut self.pools[c];
        // SAFETY: tagged free, owned here, unlinked
        unsafe { pool.free.push(raw) };
        pool.trigger -= bytes as isize;
        if pool.trigger <= 0 {
            self.pending_collect |= 1u64 << c;
        }
        self.note_freed(bytes);
    }

    fn send_home(&mut self, owner: HeapId, class: SizeClass, raw: NonNull<BlockHeader>) {
        if self.outgoing.dest().is_some_and(|d| d != owner) {
            self.flush_repatriation();
        }
        let bytes = self.config.block_bytes(class);
        // SAFETY: tagged free, owned by `owner`, unlinked
        unsafe { self.outgoing.push(owner, raw, bytes) };
        if self.outgoing.bytes() >= self.config.repatriation_flush_bytes {
            self.flush_repatriation();
        }
    }

    /// Deliver the outgoing repatriation batch to its owner
    pub fn flush_repatriation(&mut self) {
        let Some(batch) = self.outgoing.take() else {
            return;
        };
        match self.registry.mailbox(batch.dest) {
            Some(mailbox) => {
                // SAFETY: the batch is a private chain of free blocks owned by `dest`
                unsafe {
                    mailbox.deliver(
                        batch.head,
                        batch.tail,
                        batch.bytes,
                        self.config.repatriation_drain_bytes,
                    )
                };
                self.counters.blocks_repatriated_out += batch.blocks as u64;
                trace!(
                    "{} sent {} blocks ({} bytes) to {}",
                    self.id, batch.blocks, batch.bytes, batch.dest
                );
            }
            None => warn!(
                "{} dropped {} blocks for departed {}; their memory stays mapped",
                self.id, batch.blocks, batch.dest
            ),
        }
    }

    /// Take repatriated blocks into the local free lists and run due rescans
    pub fn drain_repatriated(&mut self) {
        let span = span_heap_op("drain", self.id);
        let _guard = span.enter();
        let received = self.counters.blocks_repatriated_in;
        self.drain_inbox();
        self.collect_pending();
        span.record_items((self.counters.blocks_repatriated_in - received) as usize);
    }

    pub(crate) fn drain_inbox(&mut self) {
        let credit = self.mailbox.take_system_credit();
        if credit != 0 {
            self.tracking.unmapped(credit as usize);
            self.note_freed(credit as usize);
        }
        self.mailbox.clear_drain_request();

        let mut next = self.mailbox.take();
        let mut bytes = 0usize;
        let mut blocks = 0u64;
        while let Some(raw) = next {
            // SAFETY: mailbox chains hold free blocks owned by this heap
            let header = unsafe { &*raw.as_ptr() };
            next = NonNull::new(header.chain);
            if self.config.audit.enabled() && header.owner != self.id.get() {
                self.violation(AuditViolation::Misdelivered {
                    addr: raw.as_ptr() as usize,
                });
            }
            let Some(BlockTag::Pool { class, .. }) = header.tag.decode() else {
                self.violation(AuditViolation::BadTag {
                    addr: raw.as_ptr() as usize,
                    raw: header.tag.raw(),
                });
            };
            bytes += self.pools[class.index()].block_bytes;
            self.push_free(class, raw);
            blocks += 1;
        }
        if blocks > 0 {
            self.mailbox.settle_pending(bytes);
            self.counters.blocks_repatriated_in += blocks;
            trace!("{} drained {} repatriated blocks ({} bytes)", self.id, blocks, bytes);
        }
    }

    /// Payload capacity of the allocation behind `block`
    pub(crate) fn capacity(&self, block: Block) -> usize {
        let total = match block.tag().decode() {
            Some(BlockTag::Pool { class, .. }) => self.config.block_bytes(class),
            Some(BlockTag::System { size_log2 }) | Some(BlockTag::Foreign { size_log2 }) => {
                1usize << size_log2
            }
            None => HEADER_BYTES,
        };
        total - HEADER_BYTES
    }

    fn note_allocated(&mut self, bytes: usize) {
        let remote = self.mailbox.pending_bytes() + self.mailbox.system_credit();
        self.tracking.allocated(bytes, remote);
        self.mailbox.publish_in_use(self.tracking.in_use());
    }

    fn note_freed(&mut self, bytes: usize) {
        self.tracking.freed(bytes);
        self.mailbox.publish_in_use(self.tracking.in_use());
    }
}

fn size_log2_for(total: usize) -> MemoryResult<u8> {
    let rounded = total
        .checked_next_power_of_two()
        .ok_or(MemoryError::LimitExceeded {
            requested: total,
            limit: 1usize << MAX_SIZE_CODE,
        })?;
    let log2 = rounded.trailing_zeros() as u8;
    if log2 > MAX_SIZE_CODE {
        return Err(MemoryError::LimitExceeded {
            requested: total,
            limit: 1usize << MAX_SIZE_CODE,
        });
    }
    Ok(log2)
}
