/*!
 * Shared test fixtures
 */

#![allow(dead_code)]

use heapcore::memory::{MmapMemory, VirtualMemory};
use heapcore::{AuditMode, Heap, HeapRegistry, MemoryError, MemoryResult, PoolConfig, ViolationAction};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Audited configuration that panics on violations
pub fn checked_config() -> PoolConfig {
    PoolConfig::default().with_audit(AuditMode::Checked, ViolationAction::Panic)
}

/// Checked configuration with rescans pushed out of the way
pub fn lazy_config() -> PoolConfig {
    checked_config().with_rescan_threshold(16 * 1024 * 1024)
}

pub fn heap_with(registry: &Arc<HeapRegistry>, config: PoolConfig) -> Heap {
    Heap::builder(registry.clone())
        .with_config(config)
        .build()
        .expect("valid config")
}

/// Real mappings with counters on top
#[derive(Default)]
pub struct CountingMemory {
    inner: MmapMemory,
    pub maps: AtomicUsize,
    pub releases: AtomicUsize,
    pub mapped_bytes: AtomicUsize,
    /// Fail every allocation once this many have succeeded
    pub fail_after: Option<usize>,
}

impl CountingMemory {
    pub fn failing_after(n: usize) -> Self {
        Self {
            fail_after: Some(n),
            ..Self::default()
        }
    }

    pub fn live_bytes(&self) -> usize {
        self.mapped_bytes.load(Ordering::SeqCst)
    }
}

impl VirtualMemory for CountingMemory {
    fn page_size(&self) -> usize {
        self.inner.page_size()
    }

    fn reserve(&self, bytes: usize) -> MemoryResult<NonNull<u8>> {
        if let Some(limit) = self.fail_after {
            if self.maps.load(Ordering::SeqCst) >= limit {
                return Err(MemoryError::OutOfMemory { requested: bytes });
            }
        }
        let ptr = self.inner.reserve(bytes)?;
        self.maps.fetch_add(1, Ordering::SeqCst);
        self.mapped_bytes.fetch_add(bytes, Ordering::SeqCst);
        Ok(ptr)
    }

    unsafe fn commit(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        self.inner.commit(ptr, bytes)
    }

    unsafe fn decommit(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        self.inner.decommit(ptr, bytes)
    }

    unsafe fn release(&self, ptr: NonNull<u8>, bytes: usize) {
        self.releases.fetch_add(1, Ordering::SeqCst);
        self.mapped_bytes.fetch_sub(bytes, Ordering::SeqCst);
        self.inner.release(ptr, bytes)
    }

    unsafe fn wire(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        self.inner.wire(ptr, bytes)
    }

    unsafe fn unwire(&self, ptr: NonNull<u8>, bytes: usize) -> MemoryResult<()> {
        self.inner.unwire(ptr, bytes)
    }
}

/// Registry over a shared [`CountingMemory`]
pub fn counting_registry(memory: CountingMemory) -> (Arc<HeapRegistry>, Arc<CountingMemory>) {
    let memory = Arc::new(memory);
    let registry = Arc::new(HeapRegistry::new().with_memory(memory.clone()));
    (registry, memory)
}
