/*!
 * Protect Tests
 * Both protect strategies keep the same values alive
 */

use crate::common::{heap_with, lazy_config};
use heapcore::{Block, Heap, HeapRegistry, ProtectStrategy, ValueKind, ValueLayout};
use pretty_assertions::assert_eq;
use proptest::prelude::*;
use proptest::sample::Index;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Step {
    Bytes { len: usize, fill: u8 },
    Boxed { links: Vec<Option<Index>> },
}

fn step() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0usize..300, any::<u8>()).prop_map(|(len, fill)| Step::Bytes { len, fill }),
        proptest::collection::vec(proptest::option::of(any::<Index>()), 0..4)
            .prop_map(|links| Step::Boxed { links }),
    ]
}

/// Structural content of a value, independent of where it lives
#[derive(Debug, PartialEq)]
enum Shape {
    Bytes(Vec<u8>),
    Boxed(Vec<Option<Shape>>),
}

fn shape(heap: &Heap, block: Block) -> Shape {
    match block.kind() {
        ValueKind::Bytes => Shape::Bytes(heap.bytes(block).to_vec()),
        _ => Shape::Boxed(
            (0..block.child_count())
                .map(|i| heap.child(block, i).map(|c| shape(heap, c)))
                .collect(),
        ),
    }
}

struct Outcome {
    in_use_after_protect: i64,
    depth_above_mark: usize,
    result: Shape,
    in_use_at_end: i64,
}

fn run(strategy: ProtectStrategy, steps: &[Step], pick: Index) -> Outcome {
    let registry = Arc::new(HeapRegistry::new());
    let mut heap = heap_with(&registry, lazy_config().with_protect(strategy));

    let outer = heap.mark();
    heap.allocate_bytes(40).unwrap();
    let inner = heap.mark();

    let mut made: Vec<Block> = Vec::new();
    for step in steps {
        let block = match step {
            Step::Bytes { len, fill } => {
                let b = heap.allocate_bytes(*len).unwrap();
                heap.bytes_mut(b).unwrap().fill(*fill);
                b
            }
            Step::Boxed { links } => {
                let b = heap.allocate_value(ValueLayout::boxed(links.len())).unwrap();
                for (slot, link) in links.iter().enumerate() {
                    let child = match link {
                        Some(ix) if !made.is_empty() => Some(made[ix.index(made.len())]),
                        _ => None,
                    };
                    heap.set_child(b, slot, child).unwrap();
                }
                b
            }
        };
        made.push(block);
    }

    let chosen = made[pick.index(made.len())];
    let kept = heap.protect(chosen, inner).unwrap();
    let outcome_result = shape(&heap, kept);
    let in_use_after_protect = heap.bytes_in_use();
    let depth_above_mark = heap.stack_depth() - inner.depth();

    heap.pop_stack(outer);
    Outcome {
        in_use_after_protect,
        depth_above_mark,
        result: outcome_result,
        in_use_at_end: heap.bytes_in_use(),
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(128))]

    #[test]
    fn test_strategies_agree(
        steps in proptest::collection::vec(step(), 1..24),
        pick in any::<Index>(),
    ) {
        let baseline = run(ProtectStrategy::Baseline, &steps, pick);
        let fast = run(ProtectStrategy::Fast, &steps, pick);

        prop_assert_eq!(&baseline.result, &fast.result);
        prop_assert_eq!(baseline.in_use_after_protect, fast.in_use_after_protect);
        prop_assert_eq!(baseline.depth_above_mark, 1);
        prop_assert_eq!(fast.depth_above_mark, 1);
        prop_assert_eq!(baseline.in_use_at_end, 0);
        prop_assert_eq!(fast.in_use_at_end, 0);
    }
}

#[test]
fn test_protect_in_a_loop_does_not_grow_the_stack() {
    for strategy in [ProtectStrategy::Baseline, ProtectStrategy::Fast] {
        let registry = Arc::new(HeapRegistry::new());
        let mut heap = heap_with(&registry, lazy_config().with_protect(strategy));
        let base = heap.mark();

        let mut acc = heap.allocate_bytes(8).unwrap();
        heap.bytes_mut(acc).unwrap().fill(0);
        for round in 0..1_000usize {
            let next = heap.allocate_bytes(8).unwrap();
            let prev = heap.bytes(acc).to_vec();
            let bytes = heap.bytes_mut(next).unwrap();
            bytes.copy_from_slice(&prev);
            bytes[0] = bytes[0].wrapping_add(1);
            heap.allocate_bytes(round % 200).unwrap();

            acc = heap.protect(next, base).unwrap();
            assert_eq!(heap.stack_depth(), base.depth() + 1, "{strategy:?}");
            assert_eq!(heap.bytes_in_use(), 128, "{strategy:?}");
        }

        assert_eq!(heap.bytes(acc)[0], (1_000 % 256) as u8, "{strategy:?}");
        heap.pop_stack(base);
        assert_eq!(heap.bytes_in_use(), 0, "{strategy:?}");
    }
}

#[test]
fn test_protect_permanent_block() {
    for strategy in [ProtectStrategy::Baseline, ProtectStrategy::Fast] {
        let registry = Arc::new(HeapRegistry::new());
        let mut heap = heap_with(&registry, lazy_config().with_protect(strategy));
        let fixed = heap.allocate_bytes(8).unwrap();
        heap.make_permanent(fixed);

        let mark = heap.mark();
        heap.allocate_bytes(8).unwrap();
        assert_eq!(heap.protect(fixed, mark).unwrap(), fixed);
        assert_eq!(heap.stack_depth(), mark.depth(), "{strategy:?}");
        assert_eq!(heap.bytes_in_use(), 128, "{strategy:?}");
    }
}
