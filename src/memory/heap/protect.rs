/*!
 * Protect
 *
 * `protect(w, mark)` pops the stack back to `mark` while keeping `w` (and
 * everything it owns) alive in the caller's scope. It is how a function
 * returns a result built from temporaries.
 *
 * The baseline raises `w`, pops, and pushes `w` again. The fast path avoids
 * the raise/push round trip when the stack layout shows it is not needed,
 * and realizes a virtual `w` whose backer would otherwise be kept alive
 * only by the view.
 */

use super::stack::header_mut;
use super::{Heap, StackMark};
use crate::memory::block::Block;
use crate::memory::config::ProtectStrategy;
use crate::memory::types::MemoryResult;
use tracing::warn;

impl Heap {
    /// Pop the stack to `mark`, keeping `block` alive above it
    ///
    /// Returns the block the caller should use from now on: `block` itself,
    /// or under the fast strategy a realized copy of a virtual `block`.
    pub fn protect(&mut self, block: Block, mark: StackMark) -> MemoryResult<Block> {
        self.stack.ensure_room()?;
        let kept = if block.is_permanent() {
            self.pop_entries(mark.0);
            block
        } else {
            match self.config.protect {
                ProtectStrategy::Baseline => self.protect_baseline(block, mark),
                ProtectStrategy::Fast => self.protect_fast(block, mark),
            }
        };
        self.safe_point();
        Ok(kept)
    }

    /// Protect several blocks at once
    pub fn protect_many(&mut self, blocks: &[Block], mark: StackMark) -> MemoryResult<()> {
        self.reserve_entries(blocks.len())?;
        for &block in blocks {
            self.raise(block);
        }
        self.pop_entries(mark.0);
        for &block in blocks {
            if block.is_permanent() {
                continue;
            }
            self.push_entry(block);
        }
        self.safe_point();
        Ok(())
    }

    fn protect_baseline(&mut self, block: Block, mark: StackMark) -> Block {
        self.raise(block);
        self.pop_entries(mark.0);
        self.push_entry(block);
        block
    }

    fn protect_fast(&mut self, block: Block, mark: StackMark) -> Block {
        if block.is_virtual() {
            return self.protect_view(block, mark);
        }

        let top = self.stack_depth();
        if mark.0 >= top {
            // Nothing to pop; an inplaceable block already has its entry
            if !block.is_inplaceable() {
                self.raise(block);
                self.push_entry(block);
            }
            return block;
        }

        // First entry above the mark is the block itself: pop past it
        if self.stack_entry(mark.0) == Some(block) {
            if mark.0 + 1 < top {
                self.make_recursive(block);
                self.pop_entries(mark.0 + 1);
            }
            return block;
        }

        // Sole reference lives above the mark: move the entry down to it
        let zaploc = header_mut(block).zaploc;
        if block.is_inplaceable() && zaploc > mark.0 && self.stack_entry(zaploc - 1) == Some(block) {
            self.make_recursive(block);
            let pos = zaploc - 1;
            let displaced = self.swap_entry(mark.0, Some(block));
            self.swap_entry(pos, displaced);
            header_mut(block).zaploc = mark.0 + 1;
            if let Some(other) = displaced {
                let other_header = header_mut(other);
                if other_header.zaploc == mark.0 + 1 {
                    other_header.zaploc = pos + 1;
                }
            }
            self.pop_entries(mark.0 + 1);
            return block;
        }

        let before = block.raw_usecount();
        self.raise(block);
        self.pop_entries(mark.0);
        if !before.is_inplaceable() || block.usecount() == 1 {
            self.push_entry(block);
        }
        if before.is_inplaceable() {
            header_mut(block).usecount = before;
        }
        block
    }

    /// Fast protect of a virtual block
    ///
    /// If the pop dropped a reference on the backer, the view may be the
    /// backer's last owner, so copy the visible part out and let both go.
    fn protect_view(&mut self, view: Block, mark: StackMark) -> Block {
        let Some(backer) = view.backer() else {
            return self.protect_baseline(view, mark);
        };
        let backer_before = backer.usecount().min(2);
        let before = view.raw_usecount();
        self.raise(view);
        self.pop_entries(mark.0);

        if backer.usecount() < backer_before {
            match self.realize(view) {
                Ok(copy) => {
                    self.lower_inner(view);
                    return copy;
                }
                Err(e) => warn!("{} kept view {:?} after realize failed: {}", self.id, view, e),
            }
            self.push_entry(view);
            return view;
        }

        if view.usecount() == before.count() + 1 {
            // The pop never touched the view
            header_mut(view).usecount = before;
        } else {
            self.push_entry(view);
        }
        view
    }
}
