/*!
 * Byte Accounting and Diagnostics
 */

use super::Heap;
use crate::core::types::SizeClass;
use crate::memory::audit::AuditViolation;
use crate::memory::header::BlockTag;
use crate::memory::types::{ClassStats, HeapStats};
use tracing::info;

#[derive(Debug, Clone, Copy)]
struct Session {
    peak: isize,
}

/// Local byte counters of one heap
#[derive(Debug, Default)]
pub(crate) struct Tracking {
    /// Bytes allocated here and not yet freed back here; includes blocks
    /// waiting in this heap's mailbox
    in_use: isize,
    os_bytes: usize,
    os_peak: usize,
    session: Option<Session>,
}

impl Tracking {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub(crate) fn in_use(&self) -> isize {
        self.in_use
    }

    #[inline]
    pub(crate) fn os_bytes(&self) -> usize {
        self.os_bytes
    }

    /// `remote` is what other heaps have already freed on our behalf
    #[inline]
    pub(crate) fn allocated(&mut self, bytes: usize, remote: isize) {
        self.in_use += bytes as isize;
        if let Some(session) = self.session.as_mut() {
            session.peak = session.peak.max(self.in_use - remote);
        }
    }

    #[inline]
    pub(crate) fn freed(&mut self, bytes: usize) {
        self.in_use -= bytes as isize;
    }

    pub(crate) fn mapped(&mut self, bytes: usize) {
        self.os_bytes += bytes;
        self.os_peak = self.os_peak.max(self.os_bytes);
    }

    pub(crate) fn unmapped(&mut self, bytes: usize) {
        self.os_bytes = self.os_bytes.saturating_sub(bytes);
    }
}

impl Heap {
    /// Bytes this heap has handed out and not yet seen freed
    ///
    /// Blocks freed by other heaps count as freed as soon as they are queued
    /// in this heap's mailbox.
    pub fn bytes_in_use(&self) -> i64 {
        (self.tracking.in_use - self.mailbox.pending_bytes() - self.mailbox.system_credit()) as i64
    }

    /// Bytes currently mapped from the OS for this heap
    pub fn os_bytes(&self) -> usize {
        self.tracking.os_bytes
    }

    /// Start a high-water session; returns the current bytes in use
    pub fn start_tracking(&mut self) -> i64 {
        let now = self.bytes_in_use();
        self.tracking.session = Some(Session { peak: now as isize });
        now
    }

    /// End the session; returns the highest bytes-in-use seen during it
    pub fn stop_tracking(&mut self) -> Option<i64> {
        self.tracking.session.take().map(|s| s.peak as i64)
    }

    /// `(block bytes, free blocks)` for every pool class
    pub fn free_counts(&self) -> Vec<(usize, usize)> {
        self.pools
            .iter()
            .map(|pool| (pool.block_bytes, pool.free.len()))
            .collect()
    }

    pub fn stats(&self) -> HeapStats {
        let classes = self
            .pools
            .iter()
            .enumerate()
            .map(|(c, pool)| ClassStats {
                class: SizeClass(c as u8),
                block_bytes: pool.block_bytes,
                free_blocks: pool.free.len(),
                superblocks: pool.superblocks,
                rescan_countdown: pool.trigger as i64,
            })
            .collect();
        HeapStats {
            heap: self.id,
            bytes_in_use: self.bytes_in_use(),
            os_bytes: self.tracking.os_bytes,
            os_bytes_peak: self.tracking.os_peak,
            superblocks_carved: self.counters.superblocks_carved,
            superblocks_released: self.counters.superblocks_released,
            collections: self.counters.collections,
            blocks_repatriated_in: self.counters.blocks_repatriated_in,
            blocks_repatriated_out: self.counters.blocks_repatriated_out,
            stack_depth: self.stack.len(),
            classes,
            tracking_peak: self.tracking.session.map(|s| s.peak as i64),
        }
    }

    /// Log a one-line summary at info level
    pub fn log_stats(&self) {
        info!("{}", self.stats());
    }

    /// Walk every free list and report the first inconsistency
    pub fn check_free_pool(&self) -> Result<(), AuditViolation> {
        for (c, pool) in self.pools.iter().enumerate() {
            let class = c as u8;
            let mut seen = 0usize;
            for block in pool.free.iter() {
                seen += 1;
                if seen > pool.free.len() {
                    return Err(AuditViolation::ListLoop { class });
                }
                let addr = block.as_ptr() as usize;
                // SAFETY: free-list members are headers this heap wrote
                let tag = unsafe { block.as_ref().tag };
                match tag.decode() {
                    Some(BlockTag::Pool { class: found, .. }) if found.0 == class => {}
                    Some(BlockTag::Pool { class: found, .. }) => {
                        return Err(AuditViolation::WrongClass {
                            addr,
                            list: class,
                            tag: found.0,
                        })
                    }
                    _ => return Err(AuditViolation::BadTag { addr, raw: tag.raw() }),
                }
                if !tag.is_free() {
                    return Err(AuditViolation::NotFree { addr });
                }
            }
            if seen != pool.free.len() {
                return Err(AuditViolation::ListLoop { class });
            }
        }
        Ok(())
    }
}
