/*!
 * Memory Traits
 * Capabilities the allocator consumes from its environment
 */

use super::block::Block;
use super::types::MemoryResult;
use std::ptr::NonNull;

/// OS virtual-memory capability
///
/// Regions are identified by the pointer and length returned from
/// `reserve`; every other call must pass the same pair or a page-aligned
/// sub-range of it.
pub trait VirtualMemory: Send + Sync {
    /// Granularity of reservations
    fn page_size(&self) -> usize;

    /// Reserve address space without backing it
    fn reserve(&self, bytes: usize) -> MemoryResult<NonNull<u8>>;

    /// Back a reserved range with readable, writable memory
    ///
    /// # Safety
    /// The range must lie inside a live reservation.
    unsafe fn commit(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()>;

    /// Drop the backing of a committed range, keeping the reservation
    ///
    /// # Safety
    /// Nothing may read the range until it is committed again.
    unsafe fn decommit(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()>;

    /// Return a whole reservation to the OS
    ///
    /// # Safety
    /// `ptr`/`bytes` must be exactly a reservation, with no live references
    /// into it.
    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize);

    /// Pin a committed range in physical memory
    ///
    /// # Safety
    /// The range must be committed.
    unsafe fn wire(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()>;

    /// Undo [`VirtualMemory::wire`]
    ///
    /// # Safety
    /// The range must be committed.
    unsafe fn unwire(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()>;

    /// Reserve and commit in one step
    fn allocate(&self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        let ptr = self.reserve(bytes)?;
        // SAFETY: the range was reserved just above
        match unsafe { self.commit(ptr, bytes) } {
            Ok(()) => Ok(ptr),
            Err(e) => {
                // SAFETY: nothing references the fresh reservation
                unsafe { self.release(ptr, bytes) };
                Err(e)
            }
        }
    }
}

/// Alternate allocator for foreign (bignum library) blocks
pub trait ForeignAllocator: Send + Sync {
    /// Allocate `bytes`, 64-byte aligned; `None` on exhaustion
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>>;

    /// Free a previous allocation
    ///
    /// # Safety
    /// `ptr` must come from `allocate(bytes)` on this allocator.
    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize);
}

/// Release hook for symbol tables
pub trait SymbolTableHook: Send + Sync {
    /// Called once when a table's usecount reaches zero, before its
    /// name/value entries are lowered
    fn on_release(&self, table: Block);
}
