/*!
 * Block Header Codec
 *
 * Every block starts with a 64-byte [`BlockHeader`]. Its `tag` word packs
 * the allocation bookkeeping:
 *
 * ```text
 *  31..28   27..25   24........9   8      7..6     5..0
 *  version  unused   index         free   origin   size code
 * ```
 *
 * - size code: class index for pool blocks, log2 of the mapping for system
 *   and foreign blocks
 * - index: position of a pool block inside its superblock (0 = root)
 *
 * The packed form is only ever built from and read back into [`BlockTag`],
 * so the origin-specific fields cannot be confused.
 */

use crate::core::limits::{HEADER_BYTES, HEADER_TAG_VERSION, MAX_SIZE_CODE};
use crate::core::types::SizeClass;
use std::fmt;
use std::ptr;

const SIZE_MASK: u32 = 0x3f;
const ORIGIN_SHIFT: u32 = 6;
const ORIGIN_MASK: u32 = 0b11 << ORIGIN_SHIFT;
const FREE_BIT: u32 = 1 << 8;
const INDEX_SHIFT: u32 = 9;
const INDEX_MASK: u32 = 0xffff << INDEX_SHIFT;
const VERSION_SHIFT: u32 = 28;

const ORIGIN_POOL: u32 = 0;
const ORIGIN_SYSTEM: u32 = 1;
const ORIGIN_FOREIGN: u32 = 2;

/// Where a block's memory came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockTag {
    /// Carved from a superblock; `index` 0 is the root
    Pool { class: SizeClass, index: u16 },
    /// Individually mapped, `1 << size_log2` bytes
    System { size_log2: u8 },
    /// From the foreign allocator, `1 << size_log2` bytes
    Foreign { size_log2: u8 },
}

/// Packed, versioned header tag
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct HeaderTag(u32);

impl HeaderTag {
    /// Pack a tag in the current version, allocated
    pub const fn encode(tag: BlockTag) -> Self {
        let (origin, size, index) = match tag {
            BlockTag::Pool { class, index } => (ORIGIN_POOL, class.0, index),
            BlockTag::System { size_log2 } => (ORIGIN_SYSTEM, size_log2, 0),
            BlockTag::Foreign { size_log2 } => (ORIGIN_FOREIGN, size_log2, 0),
        };
        Self(
            (HEADER_TAG_VERSION << VERSION_SHIFT)
                | ((index as u32) << INDEX_SHIFT)
                | (origin << ORIGIN_SHIFT)
                | (size as u32 & SIZE_MASK),
        )
    }

    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Unpack, or `None` if the version or origin bits are not recognised
    pub const fn decode(self) -> Option<BlockTag> {
        if self.version() != HEADER_TAG_VERSION {
            return None;
        }
        let size = self.size_code();
        match (self.0 & ORIGIN_MASK) >> ORIGIN_SHIFT {
            ORIGIN_POOL => Some(BlockTag::Pool {
                class: SizeClass(size),
                index: self.index(),
            }),
            ORIGIN_SYSTEM => Some(BlockTag::System { size_log2: size }),
            ORIGIN_FOREIGN => Some(BlockTag::Foreign { size_log2: size }),
            _ => None,
        }
    }

    #[inline]
    pub const fn version(self) -> u32 {
        self.0 >> VERSION_SHIFT
    }

    #[inline]
    pub const fn size_code(self) -> u8 {
        (self.0 & SIZE_MASK) as u8
    }

    #[inline]
    pub const fn index(self) -> u16 {
        ((self.0 & INDEX_MASK) >> INDEX_SHIFT) as u16
    }

    #[inline]
    pub const fn is_pool(self) -> bool {
        (self.0 & ORIGIN_MASK) >> ORIGIN_SHIFT == ORIGIN_POOL
    }

    /// Root of its allocation (only meaningful for pool blocks)
    #[inline]
    pub const fn is_root(self) -> bool {
        self.is_pool() && self.index() == 0
    }

    #[inline]
    pub const fn is_free(self) -> bool {
        self.0 & FREE_BIT != 0
    }

    #[inline]
    pub const fn with_free(self, free: bool) -> Self {
        if free {
            Self(self.0 | FREE_BIT)
        } else {
            Self(self.0 & !FREE_BIT)
        }
    }
}

impl fmt::Debug for HeaderTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderTag")
            .field("decoded", &self.decode())
            .field("free", &self.is_free())
            .field("version", &self.version())
            .finish()
    }
}

const _: () = assert!(MAX_SIZE_CODE as u32 <= SIZE_MASK);

/// Reference count with encoded special states
///
/// - inplaceable: sign bit set over a count of 1; the sole reference may be
///   updated destructively
/// - permanent: bit 62; never decremented, never freed
/// - poison: written over freed blocks under audit so a late `lower` is caught
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(transparent)]
pub struct Usecount(i64);

impl Usecount {
    pub const INPLACE_BIT: i64 = i64::MIN;
    pub const PERMANENT: i64 = 1 << 62;
    pub const POISON: i64 = 0x1ead_beef_dead_beef;

    /// Count of a newly allocated block: 1, inplaceable
    pub const fn fresh() -> Self {
        Self(Self::INPLACE_BIT | 1)
    }

    pub const fn permanent() -> Self {
        Self(Self::PERMANENT)
    }

    pub const fn poisoned() -> Self {
        Self(Self::POISON)
    }

    pub const fn from_raw(raw: i64) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> i64 {
        self.0
    }

    /// Count without the inplace marker
    #[inline]
    pub const fn count(self) -> i64 {
        self.0 & !Self::INPLACE_BIT
    }

    #[inline]
    pub const fn is_inplaceable(self) -> bool {
        self.0 < 0
    }

    #[inline]
    pub const fn is_permanent(self) -> bool {
        self.0 >= 0 && self.0 & Self::PERMANENT != 0 && self.0 != Self::POISON
    }

    #[inline]
    pub const fn is_poisoned(self) -> bool {
        self.0 == Self::POISON
    }

    /// One more reference; clears the inplace marker
    #[inline]
    pub const fn raised(self) -> Self {
        if self.is_permanent() {
            self
        } else {
            Self(self.count() + 1)
        }
    }

    /// One fewer reference; clears the inplace marker
    #[inline]
    pub const fn lowered(self) -> Self {
        if self.is_permanent() {
            self
        } else {
            Self(self.count() - 1)
        }
    }
}

impl fmt::Debug for Usecount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_poisoned() {
            write!(f, "Usecount(poisoned)")
        } else if self.is_permanent() {
            write!(f, "Usecount(permanent)")
        } else if self.is_inplaceable() {
            write!(f, "Usecount({}, inplace)", self.count())
        } else {
            write!(f, "Usecount({})", self.count())
        }
    }
}

/// Block is a header-only alias into its backer's data
pub(crate) const FLAG_VIRTUAL: u16 = 1 << 0;
/// Block's children are owned through their usecounts
pub(crate) const FLAG_RECURSIVE: u16 = 1 << 1;

/// Header at the front of every block
///
/// `chain` links free lists and repatriation chains. `aux` is the proxy
/// chain while the block sits on a free list during coalescing, and the
/// backer while a live virtual block.
#[repr(C, align(64))]
pub struct BlockHeader {
    pub(crate) chain: *mut BlockHeader,
    pub(crate) aux: *mut BlockHeader,
    pub(crate) data: *mut u8,
    pub(crate) len: usize,
    /// Deferred-stack position + 1, or 0 when the block has no tracked entry
    pub(crate) zaploc: usize,
    pub(crate) usecount: Usecount,
    pub(crate) tag: HeaderTag,
    pub(crate) owner: u32,
    pub(crate) flags: u16,
    /// Coalescing accumulator, used on roots only
    pub(crate) free_count: u16,
    pub(crate) kind: u8,
    pub(crate) rank: u8,
    pub(crate) atom_log2: u8,
    _reserved: u8,
}

const _: () = assert!(std::mem::size_of::<BlockHeader>() == HEADER_BYTES);

impl BlockHeader {
    /// Fresh allocated header with an empty byte payload
    pub(crate) fn new(tag: HeaderTag, owner: u32) -> Self {
        Self {
            chain: ptr::null_mut(),
            aux: ptr::null_mut(),
            data: ptr::null_mut(),
            len: 0,
            zaploc: 0,
            usecount: Usecount::fresh(),
            tag,
            owner,
            flags: 0,
            free_count: 0,
            kind: 0,
            rank: 0,
            atom_log2: 0,
            _reserved: 0,
        }
    }

    /// Start of the data area that follows a header
    ///
    /// # Safety
    /// `this` must point at a header inside a block of at least
    /// `HEADER_BYTES` bytes.
    #[inline]
    pub(crate) unsafe fn data_area(this: *mut BlockHeader) -> *mut u8 {
        (this as *mut u8).add(HEADER_BYTES)
    }

    #[inline]
    pub(crate) fn has_flag(&self, flag: u16) -> bool {
        self.flags & flag != 0
    }
}
