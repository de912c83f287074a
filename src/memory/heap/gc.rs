/*!
 * Lazy Coalescing
 *
 * Rescans one class's free list and returns to the OS every superblock
 * whose blocks are all free. Runs in three passes:
 *
 * 1. Walk the list, counting free blocks per superblock in the root's
 *    `free_count`. The first free block seen for a superblock becomes its
 *    proxy and is chained through `aux`.
 * 2. If some superblock is complete, rebuild the list without its blocks,
 *    preserving the order of the rest.
 * 3. Walk the proxies: unmap complete superblocks, reset the counters of
 *    the others.
 *
 * The proxy is needed because the root itself may be allocated and must
 * not be linked anywhere.
 */

use super::Heap;
use crate::core::types::SizeClass;
use crate::memory::audit::{AuditMode, AuditViolation};
use crate::memory::header::{BlockHeader, BlockTag};
use crate::monitoring::span_heap_op;
use std::ptr::{self, NonNull};
use tracing::debug;

/// Root header of the superblock containing `block`
///
/// # Safety
/// `block` is a pool block of `block_bytes` bytes with a valid tag.
#[inline]
unsafe fn root_of(block: *mut BlockHeader, block_bytes: usize) -> *mut BlockHeader {
    let index = (*block).tag.index() as usize;
    (block as *mut u8).sub(index * block_bytes) as *mut BlockHeader
}

impl Heap {
    /// Rescan every class now, regardless of triggers
    pub fn collect(&mut self) {
        let span = span_heap_op("collect", self.id);
        let _guard = span.enter();
        let released = self.counters.superblocks_released;
        self.drain_inbox();
        for c in 0..self.pools.len() {
            self.collect_class(SizeClass(c as u8));
        }
        span.record_items((self.counters.superblocks_released - released) as usize);
    }

    /// Rescan the classes whose triggers have fired
    pub(crate) fn collect_pending(&mut self) {
        while self.pending_collect != 0 {
            let c = self.pending_collect.trailing_zeros() as u8;
            self.collect_class(SizeClass(c));
        }
    }

    pub(crate) fn collect_class(&mut self, class: SizeClass) {
        let c = class.index();
        let block_bytes = self.pools[c].block_bytes;
        let total = self.pools[c].blocks_per_superblock;
        let sb_bytes = self.config.superblock_bytes();
        let listed = self.pools[c].free.len();

        // Pass 1: count free blocks per superblock, one proxy per superblock
        let mut proxies: *mut BlockHeader = ptr::null_mut();
        let mut any_complete = false;
        let mut walked = 0usize;
        for block in self.pools[c].free.iter() {
            walked += 1;
            if walked > listed {
                self.violation(AuditViolation::ListLoop { class: class.0 });
            }
            let b = block.as_ptr();
            // SAFETY: free-list members are pool blocks of this class
            unsafe {
                let root = root_of(b, block_bytes);
                if (*root).free_count == 0 {
                    (*b).aux = proxies;
                    proxies = b;
                }
                (*root).free_count += 1;
                if (*root).free_count as usize == total {
                    any_complete = true;
                }
            }
        }

        // Pass 2: unlink blocks of complete superblocks
        if any_complete {
            let mut head: *mut BlockHeader = ptr::null_mut();
            let mut tail: *mut BlockHeader = ptr::null_mut();
            let mut kept = 0usize;
            for block in self.pools[c].free.iter() {
                let b = block.as_ptr();
                // SAFETY: as above; `tail`'s successor was read before relinking
                unsafe {
                    if (*root_of(b, block_bytes)).free_count as usize == total {
                        continue;
                    }
                    if tail.is_null() {
                        head = b;
                    } else {
                        (*tail).chain = b;
                    }
                    tail = b;
                }
                kept += 1;
            }
            // SAFETY: the rebuilt chain holds exactly `kept` members
            unsafe {
                if !tail.is_null() {
                    (*tail).chain = ptr::null_mut();
                }
                self.pools[c].free.replace(head, kept);
            }
        }

        // Pass 3: release complete superblocks, reset the rest
        let mut released = 0usize;
        let mut proxy = proxies;
        while !proxy.is_null() {
            // SAFETY: proxies are pool blocks; `aux` is read before the
            // superblock can be unmapped
            unsafe {
                let next = (*proxy).aux;
                let root = root_of(proxy, block_bytes);
                if (*root).free_count as usize == total {
                    self.registry
                        .memory()
                        .release(NonNull::new_unchecked(root).cast(), sb_bytes);
                    released += 1;
                } else {
                    (*root).free_count = 0;
                    (*proxy).aux = ptr::null_mut();
                }
                proxy = next;
            }
        }

        let pool = &mut self.pools[c];
        pool.superblocks -= released;
        pool.trigger = self.config.rescan_threshold as isize;
        self.pending_collect &= !(1u64 << c);
        self.counters.collections += 1;
        if released > 0 {
            self.counters.superblocks_released += released as u64;
            self.tracking.unmapped(released * sb_bytes);
            debug!(
                "{} {}: released {} superblocks, {} free blocks remain",
                self.id,
                class,
                released,
                self.pools[c].free.len()
            );
        }

        if self.config.audit == AuditMode::Paranoid {
            if let Err(violation) = self.check_free_pool() {
                self.violation(violation);
            }
        }
    }

    /// Whether `block` is the root of a superblock whose blocks are all free
    #[cfg(test)]
    pub(crate) fn is_complete_root(&self, root: NonNull<BlockHeader>) -> bool {
        // SAFETY: test helper over a live pool root
        let header = unsafe { root.as_ref() };
        match header.tag.decode() {
            Some(BlockTag::Pool { class, index: 0 }) => {
                let pool = &self.pools[class.index()];
                pool.free
                    .iter()
                    .filter(|b| unsafe { root_of(b.as_ptr(), pool.block_bytes) } == root.as_ptr())
                    .count()
                    == pool.blocks_per_superblock
            }
            _ => false,
        }
    }
}
