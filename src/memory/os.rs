/*!
 * OS Memory
 * Anonymous-mapping implementation of the virtual-memory capability, plus
 * the default foreign allocator
 */

use super::traits::{ForeignAllocator, VirtualMemory};
use super::types::{MemoryError, MemoryResult};
use std::alloc::{alloc, dealloc, Layout};
use std::ptr::{null_mut, NonNull};

const FOREIGN_ALIGN: usize = 64;

fn last_errno() -> i32 {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

fn check(rc: libc::c_int, op: &str) -> MemoryResult<()> {
    if rc == 0 {
        Ok(())
    } else {
        Err(MemoryError::SystemCall {
            op: op.to_string(),
            errno: last_errno(),
        })
    }
}

/// `mmap`-backed virtual memory
#[derive(Debug, Clone, Copy)]
pub struct MmapMemory {
    page_size: usize,
}

impl MmapMemory {
    pub fn new() -> Self {
        // SAFETY: sysconf has no preconditions
        let page = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        Self {
            page_size: if page > 0 { page as usize } else { 4096 },
        }
    }

    unsafe fn map(&self, bytes: usize, prot: libc::c_int) -> MemoryResult<NonNull<u8>> {
        let ptr = libc::mmap(
            null_mut(),
            bytes,
            prot,
            libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_NORESERVE,
            -1,
            0,
        );
        if ptr == libc::MAP_FAILED {
            return Err(MemoryError::OutOfMemory { requested: bytes });
        }
        NonNull::new(ptr as *mut u8).ok_or(MemoryError::OutOfMemory { requested: bytes })
    }
}

impl Default for MmapMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl VirtualMemory for MmapMemory {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn reserve(&self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        // SAFETY: a fresh anonymous mapping aliases nothing
        unsafe { self.map(bytes, libc::PROT_NONE) }
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        check(
            libc::mprotect(ptr.as_ptr().cast(), bytes, libc::PROT_READ | libc::PROT_WRITE),
            "mprotect",
        )
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        check(
            libc::madvise(ptr.as_ptr().cast(), bytes, libc::MADV_DONTNEED),
            "madvise",
        )?;
        check(libc::mprotect(ptr.as_ptr().cast(), bytes, libc::PROT_NONE), "mprotect")
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        if libc::munmap(ptr.as_ptr().cast(), bytes) != 0 {
            tracing::warn!(addr = ptr.as_ptr() as usize, bytes, errno = last_errno(), "munmap failed");
        }
    }

    unsafe fn wire(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        check(libc::mlock(ptr.as_ptr().cast(), bytes), "mlock")
    }

    unsafe fn unwire(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        check(libc::munlock(ptr.as_ptr().cast(), bytes), "munlock")
    }

    fn allocate(&self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        // SAFETY: a fresh anonymous mapping aliases nothing
        unsafe { self.map(bytes, libc::PROT_READ | libc::PROT_WRITE) }
    }
}

/// Foreign allocator over the global Rust allocator
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemForeignAllocator;

impl ForeignAllocator for SystemForeignAllocator {
    fn allocate(&self, bytes: usize) -> Option<NonNull<u8>> {
        let layout = Layout::from_size_align(bytes.max(1), FOREIGN_ALIGN).ok()?;
        // SAFETY: the layout has non-zero size
        NonNull::new(unsafe { alloc(layout) })
    }

    unsafe fn free(&self, ptr: NonNull<u8>, bytes: usize) {
        if let Ok(layout) = Layout::from_size_align(bytes.max(1), FOREIGN_ALIGN) {
            dealloc(ptr.as_ptr(), layout);
        }
    }
}
