/*!
 * Pool Allocation Tests
 * Size classes, system blocks, limits and byte accounting
 */

use crate::common::{checked_config, counting_registry, heap_with, lazy_config, CountingMemory};
use heapcore::memory::BlockTag;
use heapcore::{Block, HeapRegistry, MemoryError, SizeClass, ValueKind, ValueLayout};
use pretty_assertions::assert_eq;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

fn block_size(n: usize) -> i64 {
    (n + 64).next_power_of_two().max(64) as i64
}

#[test]
fn test_allocate_class_capacity() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());

    let block = heap.allocate(SizeClass(3)).unwrap();
    assert_eq!(block.len(), 512 - 64);
    assert_eq!(block.kind(), ValueKind::Bytes);
    assert_eq!(block.usecount(), 1);
    assert!(block.is_inplaceable());
    assert_eq!(block.owner(), heap.id());
    assert_eq!(
        block.tag().decode(),
        Some(BlockTag::Pool {
            class: SizeClass(3),
            index: 0
        })
    );
    assert_eq!(heap.bytes_in_use(), 512);
    assert_eq!(heap.stack_depth(), 1);
}

#[test]
fn test_invalid_size_class() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());
    assert_eq!(
        heap.allocate(SizeClass(7)),
        Err(MemoryError::InvalidSizeClass {
            class: 7,
            classes: 7
        })
    );
    assert_eq!(heap.stack_depth(), 0);
}

#[test]
fn test_limit_exceeded() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config().with_max_allocation(1 << 20));
    assert_eq!(
        heap.allocate_bytes(1 << 20),
        Err(MemoryError::LimitExceeded {
            requested: (1 << 20) + 64,
            limit: 1 << 20
        })
    );
    assert!(heap.allocate_bytes((1 << 20) - 64).is_ok());
    assert!(matches!(
        heap.allocate_value(ValueLayout::direct(3, usize::MAX / 4, 1)),
        Err(MemoryError::LimitExceeded { .. })
    ));
}

#[test]
fn test_freed_block_is_reused_first() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, lazy_config());

    let first = heap.allocate_bytes(200).unwrap();
    let second = heap.allocate_bytes(200).unwrap();
    heap.free(first);
    heap.free(second);

    assert_eq!(heap.allocate_bytes(200).unwrap(), second);
    assert_eq!(heap.allocate_bytes(200).unwrap(), first);
    assert_eq!(heap.stats().superblocks_carved, 1);
}

#[test]
fn test_system_block_round_trip() {
    let (registry, memory) = counting_registry(CountingMemory::default());
    let mut heap = heap_with(&registry, checked_config());

    let block = heap.allocate_bytes(10_000).unwrap();
    assert_eq!(block.tag().decode(), Some(BlockTag::System { size_log2: 14 }));
    assert_eq!(heap.bytes_in_use(), 16384);
    assert_eq!(heap.os_bytes(), 16384);
    heap.bytes_mut(block).unwrap().fill(0xab);

    heap.free(block);
    assert_eq!(heap.bytes_in_use(), 0);
    assert_eq!(heap.os_bytes(), 0);
    assert_eq!(memory.live_bytes(), 0);
}

#[test]
fn test_out_of_memory_is_reported() {
    let (registry, _memory) = counting_registry(CountingMemory::failing_after(1));
    let mut heap = heap_with(&registry, checked_config());

    heap.allocate(SizeClass(0)).unwrap();
    assert_eq!(
        heap.allocate(SizeClass(1)),
        Err(MemoryError::OutOfMemory { requested: 65536 })
    );
    assert!(matches!(
        heap.allocate_bytes(100_000),
        Err(MemoryError::OutOfMemory { .. })
    ));
    // The class that already has a superblock keeps working
    heap.allocate(SizeClass(0)).unwrap();
    assert_eq!(heap.stack_depth(), 2);
}

#[test]
fn test_foreign_blocks_are_not_counted() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());

    let mark = heap.mark();
    let block = heap.allocate_foreign(100).unwrap();
    assert_eq!(block.tag().decode(), Some(BlockTag::Foreign { size_log2: 8 }));
    assert_eq!(block.len(), 100);
    assert_eq!(heap.bytes_in_use(), 0);
    heap.bytes_mut(block).unwrap().fill(1);
    heap.free(block);
    // The cleared entry stays behind; popping past it is a no-op
    assert_eq!(heap.stack_depth(), 1);
    heap.pop_stack(mark);
    assert_eq!(heap.stack_depth(), 0);
}

#[test]
fn test_bytes_in_use_matches_live_blocks() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config().with_rescan_threshold(64 * 1024));
    let mut rng = StdRng::seed_from_u64(0x5eed);
    let mut live: Vec<(Block, i64)> = Vec::new();

    for _ in 0..5_000 {
        if live.is_empty() || rng.gen_bool(0.6) {
            let n = if rng.gen_bool(0.05) {
                rng.gen_range(4096..40_000)
            } else {
                rng.gen_range(0..2000)
            };
            let block = heap.allocate_bytes(n).unwrap();
            live.push((block, block_size(n)));
        } else {
            let i = rng.gen_range(0..live.len());
            let (block, _) = live.swap_remove(i);
            heap.free(block);
        }
        let expected: i64 = live.iter().map(|(_, size)| size).sum();
        assert_eq!(heap.bytes_in_use(), expected);
    }

    for (block, _) in live.drain(..) {
        heap.free(block);
    }
    assert_eq!(heap.bytes_in_use(), 0);
    heap.check_free_pool().unwrap();
}

#[test]
fn test_wire_and_unwire() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());
    let block = heap.allocate_bytes(100).unwrap();

    match heap.wire(block) {
        Ok(()) => heap.unwire(block).unwrap(),
        // Locked-memory limits are environment dependent
        Err(MemoryError::SystemCall { op, .. }) => assert_eq!(op, "mlock"),
        Err(other) => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_stats_reflect_activity() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());
    let mark = heap.mark();
    heap.allocate(SizeClass(0)).unwrap();
    heap.allocate(SizeClass(6)).unwrap();

    let stats = heap.stats();
    assert_eq!(stats.superblocks_carved, 2);
    assert_eq!(stats.os_bytes, 2 * 65536);
    assert_eq!(stats.bytes_in_use, 64 + 4096);
    assert_eq!(stats.stack_depth, 2);
    assert_eq!(stats.classes[0].free_blocks, 1023);
    assert_eq!(stats.classes[6].free_blocks, 15);

    heap.pop_stack(mark);
    let counts = heap.free_counts();
    assert_eq!(counts[0], (64, 1024));
    assert_eq!(counts[6], (4096, 16));
}
