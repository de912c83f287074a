/*!
 * Repatriation Tests
 * Blocks freed on a foreign thread find their way back to the owning heap
 */

use crate::common::{checked_config, heap_with, lazy_config};
use heapcore::{Block, HeapRegistry, SizeClass};
use pretty_assertions::assert_eq;
use serial_test::serial;
use std::sync::mpsc;
use std::sync::{Arc, Barrier};
use std::thread;

#[test]
fn test_cross_thread_free_returns_home() {
    let registry = Arc::new(HeapRegistry::new());
    let mut owner = heap_with(&registry, lazy_config());

    let blocks: Vec<Block> = (0..100)
        .map(|_| {
            let b = owner.allocate(SizeClass(2)).unwrap();
            assert!(owner.detach(b));
            b
        })
        .collect();
    assert_eq!(owner.bytes_in_use(), 100 * 256);
    let free_before = owner.free_counts()[2].1;

    let remote_registry = registry.clone();
    thread::spawn(move || {
        let mut remote = heap_with(&remote_registry, lazy_config());
        for b in blocks {
            remote.free(b);
        }
        remote.flush_repatriation();
        let stats = remote.stats();
        assert_eq!(stats.blocks_repatriated_out, 100);
        assert_eq!(remote.bytes_in_use(), 0);
    })
    .join()
    .unwrap();

    // Queued blocks already count as freed
    assert_eq!(owner.bytes_in_use(), 0);
    assert_eq!(owner.free_counts()[2].1, free_before);

    owner.drain_repatriated();
    let stats = owner.stats();
    assert_eq!(stats.blocks_repatriated_in, 100);
    assert_eq!(owner.free_counts()[2].1, free_before + 100);
    assert_eq!(owner.bytes_in_use(), 0);
    owner.check_free_pool().unwrap();
}

#[test]
fn test_remote_system_free_is_credited() {
    let registry = Arc::new(HeapRegistry::new());
    let mut owner = heap_with(&registry, checked_config());
    let block = owner.allocate_bytes(50_000).unwrap();
    owner.detach(block);
    assert_eq!(owner.os_bytes(), 65536);

    let remote_registry = registry.clone();
    thread::spawn(move || {
        let mut remote = heap_with(&remote_registry, checked_config());
        remote.free(block);
        assert_eq!(remote.os_bytes(), 0);
    })
    .join()
    .unwrap();

    assert_eq!(owner.bytes_in_use(), 0);
    owner.drain_repatriated();
    assert_eq!(owner.os_bytes(), 0);
    assert_eq!(owner.bytes_in_use(), 0);
}

#[test]
fn test_allocation_drains_mailbox_before_carving() {
    let registry = Arc::new(HeapRegistry::new());
    let mut owner = heap_with(&registry, lazy_config());
    let per_superblock = 16;

    let blocks: Vec<Block> = (0..per_superblock)
        .map(|_| {
            let b = owner.allocate(SizeClass(6)).unwrap();
            owner.detach(b);
            b
        })
        .collect();
    assert_eq!(owner.free_counts()[6].1, 0);

    let remote_registry = registry.clone();
    thread::spawn(move || {
        let mut remote = heap_with(&remote_registry, lazy_config());
        for b in blocks {
            remote.free(b);
        }
    })
    .join()
    .unwrap();

    owner.allocate(SizeClass(6)).unwrap();
    let stats = owner.stats();
    assert_eq!(stats.superblocks_carved, 1);
    assert_eq!(stats.blocks_repatriated_in, 16);
}

#[test]
#[serial]
fn test_many_threads_free_each_others_blocks() {
    const THREADS: usize = 4;
    const BLOCKS: usize = 1000;

    let registry = Arc::new(HeapRegistry::new());
    let barrier = Arc::new(Barrier::new(THREADS + 1));
    let (senders, receivers): (Vec<_>, Vec<_>) =
        (0..THREADS).map(|_| mpsc::channel::<Vec<Block>>()).unzip();

    let handles: Vec<_> = receivers
        .into_iter()
        .enumerate()
        .map(|(i, inbox)| {
            let registry = registry.clone();
            let barrier = barrier.clone();
            let next = senders[(i + 1) % THREADS].clone();
            thread::spawn(move || {
                let mut heap = heap_with(&registry, lazy_config());
                let mine: Vec<Block> = (0..BLOCKS)
                    .map(|k| {
                        let b = heap.allocate_bytes(k % 900).unwrap();
                        heap.detach(b);
                        b
                    })
                    .collect();
                next.send(mine).unwrap();

                for b in inbox.recv().unwrap() {
                    assert_ne!(b.owner(), heap.id());
                    heap.free(b);
                }
                heap.flush_repatriation();

                barrier.wait(); // everything is in flight
                barrier.wait(); // main has checked the totals

                heap.drain_repatriated();
                assert_eq!(heap.bytes_in_use(), 0);
                assert_eq!(heap.stats().blocks_repatriated_in, BLOCKS as u64);
                heap.check_free_pool().unwrap();
            })
        })
        .collect();

    barrier.wait();
    assert_eq!(registry.heap_count(), THREADS);
    assert_eq!(registry.total_bytes_in_use(), 0);
    barrier.wait();

    for handle in handles {
        handle.join().unwrap();
    }
    assert_eq!(registry.heap_count(), 0);
}

#[test]
#[serial]
fn test_ping_pong() {
    const ROUNDS: usize = 10_000;

    let registry = Arc::new(HeapRegistry::new());
    let (to_b, from_a) = mpsc::channel::<Block>();
    let (to_a, from_b) = mpsc::channel::<Block>();
    // Neither heap may go away before the other's last flush
    let flushed = Arc::new(Barrier::new(2));

    let registry_b = registry.clone();
    let flushed_b = flushed.clone();
    let b = thread::spawn(move || {
        let mut heap = heap_with(&registry_b, checked_config());
        for _ in 0..ROUNDS {
            let incoming = from_a.recv().unwrap();
            heap.free(incoming);
            let reply = heap.allocate_bytes(100).unwrap();
            heap.detach(reply);
            to_a.send(reply).unwrap();
        }
        heap.flush_repatriation();
        flushed_b.wait();
        heap.stats()
    });

    let mut heap = heap_with(&registry, checked_config());
    for _ in 0..ROUNDS {
        let block = heap.allocate_bytes(100).unwrap();
        heap.detach(block);
        to_b.send(block).unwrap();
        let reply = from_b.recv().unwrap();
        heap.free(reply);
    }
    heap.flush_repatriation();
    flushed.wait();

    let b_stats = b.join().unwrap();
    assert_eq!(b_stats.blocks_repatriated_out, ROUNDS as u64);
    // Only the reply sizes cycled through B's own pool
    assert!(b_stats.superblocks_carved <= 2);

    heap.drain_repatriated();
    let stats = heap.stats();
    assert_eq!(stats.blocks_repatriated_out, ROUNDS as u64);
    assert_eq!(heap.bytes_in_use(), 0);
    assert!(stats.superblocks_carved <= 2);
}

#[test]
#[serial]
fn test_many_threads_free_into_one_owner() {
    const THREADS: usize = 8;
    const PER_THREAD: usize = 2_000;

    let registry = Arc::new(HeapRegistry::new());
    let mut owner = heap_with(&registry, lazy_config());
    let batches: Vec<Vec<Block>> = (0..THREADS)
        .map(|t| {
            (0..PER_THREAD)
                .map(|k| {
                    let b = owner.allocate(SizeClass(((t + k) % 4) as u8)).unwrap();
                    assert!(owner.detach(b));
                    b
                })
                .collect()
        })
        .collect();
    assert!(owner.bytes_in_use() > 0);

    // Every sender starts at once so the mailbox sees concurrent prepends
    let start = Arc::new(Barrier::new(THREADS));
    let senders: Vec<_> = batches
        .into_iter()
        .map(|batch| {
            let registry = registry.clone();
            let start = start.clone();
            thread::spawn(move || {
                let mut heap = heap_with(&registry, lazy_config().with_repatriation(1024, 1 << 30));
                start.wait();
                for b in batch {
                    heap.free(b);
                }
                heap.flush_repatriation();
                heap.stats().blocks_repatriated_out
            })
        })
        .collect();

    let sent: u64 = senders.into_iter().map(|h| h.join().unwrap()).sum();
    assert_eq!(sent, (THREADS * PER_THREAD) as u64);
    assert_eq!(owner.bytes_in_use(), 0);

    owner.drain_repatriated();
    assert_eq!(owner.stats().blocks_repatriated_in, (THREADS * PER_THREAD) as u64);
    assert_eq!(owner.bytes_in_use(), 0);
    owner.check_free_pool().unwrap();
}
