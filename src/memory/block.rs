/*!
 * Blocks and Value Kinds
 *
 * A [`Block`] is a handle onto a header in heap memory. Handles are plain
 * pointers: their lifetime is governed by the block's usecount, not by Rust
 * ownership, and using a handle after its block has been released is a
 * caller bug (caught by audit mode where detectable).
 */

use super::header::{BlockHeader, HeaderTag, Usecount, FLAG_RECURSIVE, FLAG_VIRTUAL};
use super::types::{MemoryError, MemoryResult};
use crate::core::types::HeapId;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::mem::size_of;
use std::ptr::NonNull;

/// Handle onto a block header
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Block(NonNull<BlockHeader>);

// SAFETY: a block may be handed to another thread, which can only free it
// (routed back to its owner) or read it; usecount mutation stays with the
// thread that currently owns the reference.
unsafe impl Send for Block {}

impl Block {
    #[inline]
    pub(crate) fn from_header(header: NonNull<BlockHeader>) -> Self {
        Self(header)
    }

    #[inline]
    pub(crate) fn header(self) -> NonNull<BlockHeader> {
        self.0
    }

    #[inline]
    fn h(&self) -> &BlockHeader {
        // SAFETY: handles point at initialized headers while the block is live
        unsafe { self.0.as_ref() }
    }

    /// Address of the header, useful for identity comparisons
    #[inline]
    pub fn addr(self) -> usize {
        self.0.as_ptr() as usize
    }

    /// Number of atoms
    #[inline]
    pub fn len(self) -> usize {
        self.h().len
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.len() == 0
    }

    #[inline]
    pub fn rank(self) -> u8 {
        self.h().rank
    }

    #[inline]
    pub fn kind(self) -> ValueKind {
        ValueKind::from_code(self.h().kind).unwrap_or(ValueKind::Bytes)
    }

    /// Bytes per atom (pointer width for traversable kinds)
    #[inline]
    pub fn atom_size(self) -> usize {
        1 << self.h().atom_log2
    }

    /// Current reference count, without the inplace marker
    #[inline]
    pub fn usecount(self) -> i64 {
        self.h().usecount.count()
    }

    #[inline]
    pub(crate) fn raw_usecount(self) -> Usecount {
        self.h().usecount
    }

    #[inline]
    pub fn is_inplaceable(self) -> bool {
        self.h().usecount.is_inplaceable()
    }

    #[inline]
    pub fn is_permanent(self) -> bool {
        self.h().usecount.is_permanent()
    }

    #[inline]
    pub fn is_virtual(self) -> bool {
        self.h().has_flag(FLAG_VIRTUAL)
    }

    #[inline]
    pub fn is_recursive(self) -> bool {
        self.h().has_flag(FLAG_RECURSIVE)
    }

    /// Heap that allocated the block
    #[inline]
    pub fn owner(self) -> HeapId {
        HeapId(self.h().owner)
    }

    #[inline]
    pub fn tag(self) -> HeaderTag {
        self.h().tag
    }

    /// The block this view aliases, for virtual blocks
    pub fn backer(self) -> Option<Block> {
        if self.is_virtual() {
            NonNull::new(self.h().aux).map(Block)
        } else {
            None
        }
    }

    #[inline]
    pub(crate) fn data_ptr(self) -> *mut u8 {
        self.h().data
    }

    /// Bytes of payload: atoms for direct kinds, child slots for the rest
    pub fn data_bytes(self) -> usize {
        let kind = self.kind();
        if kind.is_traversable() {
            kind.child_slots(self.len()) * size_of::<Option<Block>>()
        } else {
            self.len() << self.h().atom_log2
        }
    }

    /// Number of child slots
    #[inline]
    pub fn child_count(self) -> usize {
        self.kind().child_slots(self.len())
    }

    /// Pointer to child slot `index`
    ///
    /// # Safety
    /// `index < self.child_count()` and the block is live.
    #[inline]
    pub(crate) unsafe fn slot(self, index: usize) -> *mut Option<Block> {
        (self.data_ptr() as *mut Option<Block>).add(index)
    }

    /// Read child slot `index`
    ///
    /// # Safety
    /// As for [`Block::slot`].
    #[inline]
    pub(crate) unsafe fn read_slot(self, index: usize) -> Option<Block> {
        *self.slot(index)
    }
}

impl fmt::Debug for Block {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Block({:#x})", self.addr())
    }
}

/// Closed set of block kinds and how many owned children each carries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum ValueKind {
    /// Direct data, no children
    Bytes = 0,
    /// Array of boxes, one child per atom
    Boxed = 1,
    /// Verb/adverb/conjunction: up to three operands
    Verb = 2,
    /// Rationals: numerator and denominator per atom
    Rational = 3,
    /// Extended integers: one indirect number per atom
    Extended = 4,
    /// Sparse array: axes, fill, indices, values
    Sparse = 5,
    /// Symbol table: name and value per slot
    SymbolTable = 6,
}

impl ValueKind {
    pub(crate) const fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ValueKind::Bytes),
            1 => Some(ValueKind::Boxed),
            2 => Some(ValueKind::Verb),
            3 => Some(ValueKind::Rational),
            4 => Some(ValueKind::Extended),
            5 => Some(ValueKind::Sparse),
            6 => Some(ValueKind::SymbolTable),
            _ => None,
        }
    }

    /// Child slots for a block of `len` atoms
    pub const fn child_slots(self, len: usize) -> usize {
        match self {
            ValueKind::Bytes => 0,
            ValueKind::Boxed | ValueKind::Extended => len,
            ValueKind::Rational | ValueKind::SymbolTable => len.saturating_mul(2),
            ValueKind::Verb => 3,
            ValueKind::Sparse => 4,
        }
    }

    #[inline]
    pub const fn is_traversable(self) -> bool {
        !matches!(self, ValueKind::Bytes)
    }

    /// Kinds whose children are owned from the moment they are stored
    #[inline]
    pub const fn born_recursive(self) -> bool {
        matches!(self, ValueKind::SymbolTable)
    }

    /// Kinds with a fixed number of children regardless of length
    #[inline]
    pub const fn is_fixed_arity(self) -> bool {
        matches!(self, ValueKind::Verb | ValueKind::Sparse)
    }

    pub const fn name(self) -> &'static str {
        match self {
            ValueKind::Bytes => "bytes",
            ValueKind::Boxed => "boxed",
            ValueKind::Verb => "verb",
            ValueKind::Rational => "rational",
            ValueKind::Extended => "extended",
            ValueKind::Sparse => "sparse",
            ValueKind::SymbolTable => "symbol table",
        }
    }
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Shape of a value to allocate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValueLayout {
    pub kind: ValueKind,
    pub atom_log2: u8,
    pub len: usize,
    pub rank: u8,
}

const SLOT_LOG2: u8 = size_of::<Option<Block>>().trailing_zeros() as u8;

impl ValueLayout {
    /// `n` raw bytes, rank 1
    pub const fn bytes(n: usize) -> Self {
        Self {
            kind: ValueKind::Bytes,
            atom_log2: 0,
            len: n,
            rank: 1,
        }
    }

    /// `len` direct atoms of `1 << atom_log2` bytes
    pub const fn direct(atom_log2: u8, len: usize, rank: u8) -> Self {
        Self {
            kind: ValueKind::Bytes,
            atom_log2,
            len,
            rank,
        }
    }

    /// List of `len` boxes
    pub const fn boxed(len: usize) -> Self {
        Self::children(ValueKind::Boxed, len, 1)
    }

    pub const fn verb() -> Self {
        Self::children(ValueKind::Verb, 0, 0)
    }

    pub const fn rational(len: usize) -> Self {
        Self::children(ValueKind::Rational, len, 1)
    }

    pub const fn extended(len: usize) -> Self {
        Self::children(ValueKind::Extended, len, 1)
    }

    pub const fn sparse(rank: u8) -> Self {
        Self::children(ValueKind::Sparse, 0, rank)
    }

    /// Symbol table with `slots` name/value pairs
    pub const fn symbol_table(slots: usize) -> Self {
        Self::children(ValueKind::SymbolTable, slots, 0)
    }

    const fn children(kind: ValueKind, len: usize, rank: u8) -> Self {
        Self {
            kind,
            atom_log2: SLOT_LOG2,
            len,
            rank,
        }
    }

    /// Payload bytes this layout needs
    pub fn data_bytes(&self) -> MemoryResult<usize> {
        let (count, log2) = if self.kind.is_traversable() {
            (self.kind.child_slots(self.len), SLOT_LOG2)
        } else {
            (self.len, self.atom_log2)
        };
        if log2 >= usize::BITS as u8 {
            return Err(MemoryError::UnsupportedKind(format!(
                "atom size 2^{}",
                self.atom_log2
            )));
        }
        count
            .checked_mul(1usize << log2)
            .ok_or(MemoryError::LimitExceeded {
                requested: usize::MAX,
                limit: isize::MAX as usize,
            })
    }
}
