/*!
 * Core Types
 * Common types used across the allocator and sync layers
 */

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a per-thread heap
///
/// Ids are handed out by a [`crate::memory::HeapRegistry`] starting at 1, so 0
/// never names a live heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HeapId(pub u32);

impl HeapId {
    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for HeapId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "heap#{}", self.0)
    }
}

/// Index of a power-of-two size class, 0 being the smallest pool block
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SizeClass(pub u8);

impl SizeClass {
    #[inline]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for SizeClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "class {}", self.0)
    }
}
