/*!
 * Lifecycle Tests
 * Usecounts, ownership of children, views and growth
 */

use crate::common::{checked_config, heap_with, lazy_config};
use heapcore::memory::SymbolTableHook;
use heapcore::{Block, HeapRegistry, ValueLayout};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_realized_view_matches_source(len in 1usize..600, cut in 0.0f64..=1.0) {
        let registry = Arc::new(HeapRegistry::new());
        let mut heap = heap_with(&registry, lazy_config());
        let offset = ((len as f64) * cut) as usize;

        let mark = heap.mark();
        let block = heap.allocate_bytes(len).unwrap();
        for (i, byte) in heap.bytes_mut(block).unwrap().iter_mut().enumerate() {
            *byte = (i * 31 % 251) as u8;
        }
        let view = heap.virtualize(block, offset, 1).unwrap();
        let copy = heap.realize(view).unwrap();

        prop_assert!(!copy.is_virtual());
        prop_assert_eq!(copy.len(), len - offset);
        prop_assert_eq!(heap.bytes(copy), &heap.bytes(block)[offset..]);

        heap.pop_stack(mark);
        prop_assert_eq!(heap.bytes_in_use(), 0);
    }
}

#[test]
#[should_panic(expected = "heap audit failed")]
fn test_lower_after_release_is_fatal() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());
    let block = heap.allocate_bytes(32).unwrap();
    heap.lower(block);
    heap.lower(block);
}

#[test]
#[should_panic(expected = "freed twice")]
fn test_double_free_is_fatal() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, lazy_config());
    let block = heap.allocate_bytes(32).unwrap();
    heap.free(block);
    heap.free(block);
}

#[test]
fn test_nested_release() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());

    let mark = heap.mark();
    let a = heap.allocate_bytes(8).unwrap();
    let b = heap.allocate_bytes(8).unwrap();
    let inner = heap.allocate_value(ValueLayout::boxed(2)).unwrap();
    heap.set_child(inner, 0, Some(a)).unwrap();
    heap.set_child(inner, 1, Some(b)).unwrap();
    let outer = heap.allocate_value(ValueLayout::boxed(1)).unwrap();
    heap.set_child(outer, 0, Some(inner)).unwrap();

    heap.raise(outer);
    assert!(outer.is_recursive());
    assert!(inner.is_recursive());
    assert_eq!(a.usecount(), 2);

    heap.pop_stack(mark);
    assert_eq!(outer.usecount(), 1);
    assert_eq!(inner.usecount(), 1);
    assert_eq!(heap.bytes_in_use(), 4 * 128);

    heap.lower(outer);
    assert_eq!(heap.bytes_in_use(), 0);
    assert_eq!(heap.stack_depth(), 0);
}

#[derive(Default)]
struct CountingHook {
    released: AtomicUsize,
}

impl SymbolTableHook for CountingHook {
    fn on_release(&self, _table: Block) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn test_symbol_table_release_runs_hook() {
    let hook = Arc::new(CountingHook::default());
    let registry = Arc::new(HeapRegistry::new().with_symbol_hook(hook.clone()));
    let mut heap = heap_with(&registry, checked_config());

    let mark = heap.mark();
    let table = heap.allocate_value(ValueLayout::symbol_table(4)).unwrap();
    let name = heap.allocate_bytes(5).unwrap();
    let value = heap.allocate_bytes(40).unwrap();
    heap.set_child(table, 0, Some(name)).unwrap();
    heap.set_child(table, 1, Some(value)).unwrap();
    assert_eq!(value.usecount(), 2);

    heap.pop_stack(mark);
    assert_eq!(hook.released.load(Ordering::SeqCst), 1);
    assert_eq!(heap.bytes_in_use(), 0);
}

#[test]
fn test_extend_bytes_keeps_prefix() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());
    let mark = heap.mark();

    let block = heap.allocate_bytes(10).unwrap();
    heap.bytes_mut(block).unwrap().copy_from_slice(b"0123456789");
    let grown = heap.extend(block).unwrap();

    // 20 bytes wanted, the 128-byte block holds 64
    assert_eq!(grown.len(), 64);
    assert_eq!(&heap.bytes(grown)[..10], b"0123456789");
    heap.pop_stack(mark);
    assert_eq!(heap.bytes_in_use(), 0);
}

#[test]
fn test_extend_recursive_box_shares_children() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());
    let mark = heap.mark();

    let child = heap.allocate_bytes(8).unwrap();
    let parent = heap.allocate_value(ValueLayout::boxed(1)).unwrap();
    heap.set_child(parent, 0, Some(child)).unwrap();
    heap.raise(parent);
    assert_eq!(child.usecount(), 2);

    let grown = heap.extend(parent).unwrap();
    assert!(grown.is_recursive());
    assert_eq!(grown.len(), 8);
    assert_eq!(heap.child(grown, 0), Some(child));
    assert_eq!(heap.child(grown, 5), None);
    assert_eq!(child.usecount(), 3);

    heap.lower(parent);
    heap.pop_stack(mark);
    assert_eq!(heap.bytes_in_use(), 0);
}

#[test]
fn test_replacing_child_of_recursive_parent() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());

    let parent = heap.allocate_value(ValueLayout::boxed(1)).unwrap();
    heap.make_permanent(parent);
    let mark = heap.mark();
    let first = heap.allocate_bytes(8).unwrap();
    heap.set_child(parent, 0, Some(first)).unwrap();
    heap.pop_stack(mark);
    assert_eq!(first.usecount(), 1);

    let mark = heap.mark();
    let second = heap.allocate_bytes(8).unwrap();
    heap.set_child(parent, 0, Some(second)).unwrap();
    heap.pop_stack(mark);

    assert_eq!(heap.child(parent, 0), Some(second));
    // Only the permanent parent and its current child remain
    assert_eq!(heap.bytes_in_use(), 2 * 128);
}

#[test]
fn test_view_keeps_backer_alive() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());

    let outer = heap.mark();
    let inner = heap.mark();
    let block = heap.allocate_bytes(200).unwrap();
    heap.bytes_mut(block).unwrap().fill(3);
    let view = heap.virtualize(block, 100, 1).unwrap();
    heap.protect(view, inner).unwrap();

    assert_eq!(block.usecount(), 1);
    assert_eq!(heap.bytes(view), &[3u8; 100][..]);
    heap.pop_stack(outer);
    assert_eq!(heap.bytes_in_use(), 0);
}

#[test]
fn test_free_of_view_lowers_backer() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());

    let mark = heap.mark();
    let backer = heap.allocate_bytes(64).unwrap();
    let view = heap.virtualize(backer, 16, 1).unwrap();
    assert_eq!(backer.usecount(), 2);

    assert!(heap.detach(view));
    heap.free(view);
    assert_eq!(backer.usecount(), 1);

    heap.pop_stack(mark);
    assert_eq!(heap.bytes_in_use(), 0);
}

#[test]
fn test_free_of_recursive_box_lowers_children() {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, checked_config());

    let mark = heap.mark();
    let child = heap.allocate_bytes(8).unwrap();
    let parent = heap.allocate_value(ValueLayout::boxed(1)).unwrap();
    heap.set_child(parent, 0, Some(child)).unwrap();
    heap.raise(parent);
    assert_eq!(child.usecount(), 2);

    heap.free(parent);
    assert_eq!(child.usecount(), 1);
    heap.pop_stack(mark);
    assert_eq!(heap.bytes_in_use(), 0);
}
