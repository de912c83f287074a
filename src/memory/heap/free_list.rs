/*!
 * Free Lists
 * Intrusive per-class free lists, most-recently-freed first
 */

use crate::memory::header::BlockHeader;
use std::ptr::{self, NonNull};

/// Singly linked chain of free blocks through `BlockHeader::chain`
pub(crate) struct FreeList {
    head: *mut BlockHeader,
    len: usize,
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self {
            head: ptr::null_mut(),
            len: 0,
        }
    }

    #[inline]
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    #[inline]
    pub(crate) fn head(&self) -> *mut BlockHeader {
        self.head
    }

    /// # Safety
    /// `block` is a free block of this list's class, linked nowhere else.
    #[inline]
    pub(crate) unsafe fn push(&mut self, block: NonNull<BlockHeader>) {
        (*block.as_ptr()).chain = self.head;
        self.head = block.as_ptr();
        self.len += 1;
    }

    #[inline]
    pub(crate) fn pop(&mut self) -> Option<NonNull<BlockHeader>> {
        let head = NonNull::new(self.head)?;
        // SAFETY: members of the list are live free blocks
        self.head = unsafe { (*head.as_ptr()).chain };
        self.len -= 1;
        Some(head)
    }

    /// Replace the whole list
    ///
    /// # Safety
    /// `head` starts a well-formed chain of exactly `len` free blocks.
    pub(crate) unsafe fn replace(&mut self, head: *mut BlockHeader, len: usize) {
        self.head = head;
        self.len = len;
    }

    /// Walk the members without modifying them
    pub(crate) fn iter(&self) -> FreeIter {
        FreeIter { next: self.head }
    }
}

pub(crate) struct FreeIter {
    next: *mut BlockHeader,
}

impl Iterator for FreeIter {
    type Item = NonNull<BlockHeader>;

    fn next(&mut self) -> Option<Self::Item> {
        let current = NonNull::new(self.next)?;
        // SAFETY: members of the list are live free blocks
        self.next = unsafe { (*current.as_ptr()).chain };
        Some(current)
    }
}

/// One size class: its free list and rescan trigger
pub(crate) struct ClassPool {
    pub(crate) free: FreeList,
    /// Counts down by freed bytes; a rescan is due once it reaches zero
    pub(crate) trigger: isize,
    pub(crate) block_bytes: usize,
    pub(crate) blocks_per_superblock: usize,
    /// Superblocks of this class currently mapped
    pub(crate) superblocks: usize,
}

impl ClassPool {
    pub(crate) fn new(block_bytes: usize, blocks_per_superblock: usize, threshold: usize) -> Self {
        Self {
            free: FreeList::new(),
            trigger: threshold as isize,
            block_bytes,
            blocks_per_superblock,
            superblocks: 0,
        }
    }
}
