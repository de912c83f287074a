/*!
 * Deferred-Release Stack
 *
 * Segmented stack of blocks to release when a scope unwinds. Positions are
 * global across segments so a block's `zaploc` stays valid as segments come
 * and go. One emptied segment is kept as a spare so a scope that oscillates
 * across a segment boundary does not allocate on every push.
 */

use super::Heap;
use crate::memory::block::Block;
use crate::memory::header::BlockHeader;
use crate::memory::types::{MemoryError, MemoryResult};
use std::mem::size_of;
use tracing::trace;

/// Stack position captured by [`Heap::mark`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StackMark(pub(crate) usize);

impl StackMark {
    /// Number of entries below the mark
    #[inline]
    pub fn depth(self) -> usize {
        self.0
    }
}

type Segment = Vec<Option<Block>>;

pub(crate) struct ReleaseStack {
    segments: Vec<Segment>,
    spares: Vec<Segment>,
    segment_entries: usize,
    len: usize,
    /// Pushes promised by the last `reserve` and not yet made
    reserved: usize,
}

impl ReleaseStack {
    pub(crate) fn new(segment_entries: usize) -> Self {
        Self {
            segments: Vec::new(),
            spares: Vec::new(),
            segment_entries,
            len: 0,
            reserved: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    fn new_segment(&self) -> MemoryResult<Segment> {
        let mut segment = Vec::new();
        segment
            .try_reserve_exact(self.segment_entries)
            .map_err(|_| MemoryError::OutOfMemory {
                requested: self.segment_entries * size_of::<Option<Block>>(),
            })?;
        Ok(segment)
    }

    fn room_in_last(&self) -> usize {
        self.segments
            .last()
            .map_or(0, |s| self.segment_entries - s.len())
    }

    fn room(&self) -> usize {
        self.room_in_last() + self.spares.len() * self.segment_entries
    }

    /// Make sure the next `n` pushes can proceed without allocating
    ///
    /// The promise holds across intervening pops: retired segments are kept
    /// as spares while they are needed to cover it.
    pub(crate) fn reserve(&mut self, n: usize) -> MemoryResult<()> {
        self.reserved = n;
        if self.room() >= n {
            return Ok(());
        }
        let room = self.room();
        let missing = (n - room).div_ceil(self.segment_entries);
        self.segments
            .try_reserve(self.spares.len() + missing)
            .map_err(|_| MemoryError::OutOfMemory {
                requested: missing * self.segment_entries * size_of::<Option<Block>>(),
            })?;
        for _ in 0..missing {
            let segment = self.new_segment()?;
            self.spares.push(segment);
        }
        Ok(())
    }

    #[inline]
    pub(crate) fn ensure_room(&mut self) -> MemoryResult<()> {
        self.reserve(1)
    }

    /// Push an entry; returns its position
    pub(crate) fn push(&mut self, entry: Option<Block>) -> MemoryResult<usize> {
        self.ensure_room()?;
        Ok(self.push_reserved(entry))
    }

    /// Push after a successful `reserve`
    pub(crate) fn push_reserved(&mut self, entry: Option<Block>) -> usize {
        debug_assert!(self.room() > 0, "push without a reservation");
        self.reserved = self.reserved.saturating_sub(1);
        if self.room_in_last() == 0 {
            let segment = self.spares.pop().unwrap_or_default();
            self.segments.push(segment);
        }
        if let Some(last) = self.segments.last_mut() {
            last.push(entry);
        }
        self.len += 1;
        self.len - 1
    }

    /// Remove the top entry
    pub(crate) fn pop(&mut self) -> Option<Option<Block>> {
        let segment = self.segments.last_mut()?;
        let entry = segment.pop()?;
        self.len -= 1;
        if segment.is_empty() && self.segments.len() > 1 {
            if let Some(retired) = self.segments.pop() {
                // One spare, or as many as the open reservation needs
                if self.spares.is_empty() || self.room() < self.reserved {
                    self.spares.push(retired);
                }
            }
        }
        Some(entry)
    }

    #[inline]
    fn locate(&self, pos: usize) -> (usize, usize) {
        (pos / self.segment_entries, pos % self.segment_entries)
    }

    pub(crate) fn get(&self, pos: usize) -> Option<Block> {
        if pos >= self.len {
            return None;
        }
        let (seg, idx) = self.locate(pos);
        self.segments[seg][idx]
    }

    pub(crate) fn set(&mut self, pos: usize, entry: Option<Block>) {
        if pos < self.len {
            let (seg, idx) = self.locate(pos);
            self.segments[seg][idx] = entry;
        }
    }
}

#[inline]
pub(crate) fn header_mut<'a>(block: Block) -> &'a mut BlockHeader {
    // SAFETY: live handles point at initialized headers, and only the
    // thread holding the reference touches its header
    unsafe { &mut *block.header().as_ptr() }
}

impl Heap {
    /// Current top of the deferred-release stack
    #[inline]
    pub fn mark(&self) -> StackMark {
        StackMark(self.stack.len())
    }

    #[inline]
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Register `block` for release at the next `pop_stack` below this point
    pub fn defer_release(&mut self, block: Block) -> MemoryResult<()> {
        let pos = self.stack.push(Some(block))?;
        header_mut(block).zaploc = pos + 1;
        Ok(())
    }

    /// Push after the caller reserved room
    pub(crate) fn push_entry(&mut self, block: Block) {
        let pos = self.stack.push_reserved(Some(block));
        header_mut(block).zaploc = pos + 1;
    }

    /// Release every entry above `mark`, newest first, then run due rescans
    pub fn pop_stack(&mut self, mark: StackMark) {
        self.pop_entries(mark.0);
        self.safe_point();
    }

    pub(crate) fn pop_entries(&mut self, to: usize) {
        let from = self.stack.len();
        while self.stack.len() > to {
            let pos = self.stack.len() - 1;
            match self.stack.pop() {
                Some(Some(block)) => self.release_entry(block, pos),
                Some(None) => {}
                None => break,
            }
        }
        if from > to {
            trace!("{} popped {} stack entries", self.id, from - to);
        }
    }

    fn release_entry(&mut self, block: Block, pos: usize) {
        let header = header_mut(block);
        if header.zaploc == pos + 1 {
            header.zaploc = 0;
        }
        self.lower_inner(block);
    }

    /// Drop `block`'s stack entry so the next pop leaves it alone
    ///
    /// Returns whether an entry was found. The caller takes over the
    /// reference the entry held; this is how a block is handed to another
    /// thread.
    pub fn detach(&mut self, block: Block) -> bool {
        let header = header_mut(block);
        let zaploc = header.zaploc;
        if zaploc == 0 || self.stack.get(zaploc - 1) != Some(block) {
            return false;
        }
        self.stack.set(zaploc - 1, None);
        header.zaploc = 0;
        true
    }

    pub(crate) fn stack_entry(&self, pos: usize) -> Option<Block> {
        self.stack.get(pos)
    }

    pub(crate) fn swap_entry(&mut self, pos: usize, entry: Option<Block>) -> Option<Block> {
        let old = self.stack.get(pos);
        self.stack.set(pos, entry);
        old
    }

    pub(crate) fn reserve_entries(&mut self, n: usize) -> MemoryResult<()> {
        self.stack.reserve(n)
    }
}
