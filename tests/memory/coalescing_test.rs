/*!
 * Coalescing Tests
 * Superblocks go back to the OS exactly when every block in them is free
 */

use crate::common::{checked_config, counting_registry, heap_with, lazy_config, CountingMemory};
use heapcore::{Block, HeapRegistry, PoolConfig, SizeClass};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::Arc;

const CLASS: SizeClass = SizeClass(5);
const PER_SUPERBLOCK: usize = 32;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_superblock_released_iff_all_free(
        freed in proptest::collection::vec(any::<bool>(), PER_SUPERBLOCK),
        order in Just((0..PER_SUPERBLOCK).collect::<Vec<_>>()).prop_shuffle(),
    ) {
        let (registry, memory) = counting_registry(CountingMemory::default());
        let mut heap = heap_with(&registry, lazy_config());
        let blocks: Vec<Block> = (0..PER_SUPERBLOCK)
            .map(|_| heap.allocate(CLASS).unwrap())
            .collect();
        prop_assert_eq!(heap.stats().superblocks_carved, 1);

        for &i in &order {
            if freed[i] {
                heap.free(blocks[i]);
            }
        }
        heap.collect();

        let all_free = freed.iter().all(|&f| f);
        let stats = heap.stats();
        prop_assert_eq!(stats.superblocks_released, all_free as u64);
        prop_assert_eq!(stats.os_bytes, if all_free { 0 } else { 65536 });
        prop_assert_eq!(memory.live_bytes(), stats.os_bytes);
        prop_assert_eq!(
            stats.classes[CLASS.index()].free_blocks,
            if all_free { 0 } else { freed.iter().filter(|&&f| f).count() }
        );
        heap.check_free_pool().unwrap();
    }
}

#[test]
fn test_trigger_fires_at_safe_point() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config().with_rescan_threshold(64 * 1024));

    let mark = heap.mark();
    for _ in 0..2 * PER_SUPERBLOCK {
        heap.allocate(CLASS).unwrap();
    }
    // Resets the countdown; nothing is free yet
    heap.collect();
    let before = heap.stats().collections;

    heap.pop_stack(mark);
    let stats = heap.stats();
    assert!(stats.collections > before);
    assert_eq!(stats.superblocks_released, 2);
    assert_eq!(stats.os_bytes, 0);
    assert_eq!(stats.classes[CLASS.index()].free_blocks, 0);
}

#[test]
fn test_survivors_keep_mru_order() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, lazy_config());

    let first: Vec<Block> = (0..PER_SUPERBLOCK).map(|_| heap.allocate(CLASS).unwrap()).collect();
    let second: Vec<Block> = (0..PER_SUPERBLOCK).map(|_| heap.allocate(CLASS).unwrap()).collect();
    assert_eq!(heap.stats().superblocks_carved, 2);

    heap.free(second[5]);
    for &b in &first {
        heap.free(b);
    }
    heap.free(second[7]);
    heap.collect();

    assert_eq!(heap.stats().superblocks_released, 1);
    assert_eq!(heap.allocate(CLASS).unwrap(), second[7]);
    assert_eq!(heap.allocate(CLASS).unwrap(), second[5]);
}

#[test]
fn test_os_bytes_track_mappings() {
    let (registry, memory) = counting_registry(CountingMemory::default());
    let config = PoolConfig::low_memory().with_audit(
        heapcore::AuditMode::Paranoid,
        heapcore::ViolationAction::Panic,
    );
    let mut heap = heap_with(&registry, config);

    for round in 0..4 {
        let mark = heap.mark();
        for i in 0..300 {
            heap.allocate_bytes((i * 37 + round * 11) % 3000).unwrap();
        }
        assert_eq!(memory.live_bytes(), heap.os_bytes());
        heap.pop_stack(mark);
        heap.collect();
        assert_eq!(memory.live_bytes(), heap.os_bytes());
    }
    assert_eq!(heap.os_bytes(), 0);
    assert_eq!(heap.bytes_in_use(), 0);
}
