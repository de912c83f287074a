/*!
 * Block Lifecycle
 *
 * Reference counting over block headers. A compound block is either
 * non-recursive (its children are kept alive by their own stack entries)
 * or recursive (it holds one reference on each child). The first `raise`
 * of a non-recursive compound block converts it, raising every child.
 *
 * Virtual blocks are header-only views into a backer's data and hold one
 * reference on the backer.
 */

use super::stack::header_mut;
use super::Heap;
use crate::core::limits::HEADER_BYTES;
use crate::core::types::SizeClass;
use crate::memory::audit::AuditViolation;
use crate::memory::block::{Block, ValueKind, ValueLayout};
use crate::memory::header::{Usecount, FLAG_RECURSIVE, FLAG_VIRTUAL};
use crate::memory::types::{MemoryError, MemoryResult};
use std::mem::size_of;
use std::ptr::{self, NonNull};
use std::slice;
use tracing::trace;

impl Heap {
    /// Add a reference to `block`
    pub fn raise(&mut self, block: Block) {
        let traversable = block.kind().is_traversable();
        let header = header_mut(block);
        if header.usecount.is_permanent() {
            return;
        }
        if self.config.audit.enabled() && header.usecount.is_poisoned() {
            self.violation(AuditViolation::PoisonedUsecount { addr: block.addr() });
        }
        header.usecount = header.usecount.raised();
        if traversable && !header.has_flag(FLAG_VIRTUAL | FLAG_RECURSIVE) {
            header.flags |= FLAG_RECURSIVE;
            self.raise_children(block);
        }
    }

    /// Drop a reference to `block`, releasing it at zero
    pub fn lower(&mut self, block: Block) {
        self.lower_inner(block);
        self.safe_point();
    }

    pub(crate) fn lower_inner(&mut self, block: Block) {
        let header = header_mut(block);
        let count = header.usecount;
        if count.is_poisoned() && self.config.audit.enabled() {
            self.violation(AuditViolation::PoisonedUsecount { addr: block.addr() });
        }
        if count.is_permanent() {
            return;
        }
        let next = count.lowered();
        if next.count() < 0 {
            if self.config.audit.enabled() {
                self.violation(AuditViolation::Underflow { addr: block.addr() });
            }
            return;
        }
        header.usecount = next;
        if next.count() == 0 {
            self.release(block);
        }
    }

    /// Make a compound block own its children without touching its own count
    pub(crate) fn make_recursive(&mut self, block: Block) {
        let traversable = block.kind().is_traversable();
        let header = header_mut(block);
        if !traversable || header.has_flag(FLAG_VIRTUAL | FLAG_RECURSIVE) {
            return;
        }
        header.flags |= FLAG_RECURSIVE;
        self.raise_children(block);
    }

    /// Take references on the children just copied into a fresh block
    fn own_copied_children(&mut self, copy: Block) {
        header_mut(copy).flags |= FLAG_RECURSIVE;
        self.raise_children(copy);
    }

    fn raise_children(&mut self, block: Block) {
        for i in 0..block.child_count() {
            // SAFETY: i < child_count
            if let Some(child) = unsafe { block.read_slot(i) } {
                self.raise(child);
            }
        }
    }

    /// Free a block whose count reached zero, dropping what it owns
    fn release(&mut self, block: Block) {
        self.detach(block);
        self.drop_owned(block);
        self.free_block(block.header());
    }

    /// Lower whatever `block` holds references on: a view's backer, or the
    /// children of a recursive compound
    pub(crate) fn drop_owned(&mut self, block: Block) {
        if block.is_virtual() {
            if let Some(backer) = block.backer() {
                self.lower_inner(backer);
            }
        } else if block.is_recursive() && block.kind().is_traversable() {
            if block.kind() == ValueKind::SymbolTable {
                if let Some(hook) = self.registry.symbol_hook() {
                    hook.on_release(block);
                }
            }
            for i in 0..block.child_count() {
                // SAFETY: i < child_count
                if let Some(child) = unsafe { block.read_slot(i) } {
                    self.lower_inner(child);
                }
            }
        }
    }

    /// Store `child` in slot `index` of `parent`
    ///
    /// A recursive parent takes a reference on the new child and drops its
    /// reference on the old one.
    pub fn set_child(&mut self, parent: Block, index: usize, child: Option<Block>) -> MemoryResult<()> {
        if parent.is_virtual() {
            return Err(MemoryError::VirtualBlock);
        }
        if !parent.kind().is_traversable() {
            return Err(MemoryError::UnsupportedKind(parent.kind().to_string()));
        }
        let count = parent.child_count();
        if index >= count {
            return Err(MemoryError::OutOfBounds { offset: index, len: count });
        }
        let recursive = parent.is_recursive();
        if recursive {
            if let Some(c) = child {
                self.raise(c);
            }
        }
        // SAFETY: index < child_count
        let old = unsafe { ptr::replace(parent.slot(index), child) };
        if recursive {
            if let Some(o) = old {
                self.lower_inner(o);
            }
        }
        Ok(())
    }

    /// Child in slot `index`, if any
    pub fn child(&self, parent: Block, index: usize) -> Option<Block> {
        if index >= parent.child_count() {
            return None;
        }
        // SAFETY: index < child_count
        unsafe { parent.read_slot(index) }
    }

    /// Pin `block` for the life of the process
    ///
    /// Its stack entry is dropped and its children are made owned so they
    /// outlive their own scopes.
    pub fn make_permanent(&mut self, block: Block) {
        self.detach(block);
        self.make_recursive(block);
        header_mut(block).usecount = Usecount::permanent();
    }

    /// Payload bytes of `block`
    pub fn bytes(&self, block: Block) -> &[u8] {
        // SAFETY: the payload is `data_bytes` long while the block is live
        unsafe { slice::from_raw_parts(block.data_ptr(), block.data_bytes()) }
    }

    /// Mutable payload of a direct-data block
    pub fn bytes_mut(&mut self, block: Block) -> MemoryResult<&mut [u8]> {
        if block.kind().is_traversable() {
            return Err(MemoryError::UnsupportedKind(block.kind().to_string()));
        }
        // SAFETY: as for `bytes`; the `&mut self` borrow serializes access
        Ok(unsafe { slice::from_raw_parts_mut(block.data_ptr(), block.data_bytes()) })
    }

    /// Pin the pages under `block` in physical memory
    pub fn wire(&self, block: Block) -> MemoryResult<()> {
        let (ptr, len) = self.page_span(block);
        // SAFETY: the span covers mapped pages of this block's allocation
        unsafe { self.registry.memory().wire(ptr, len) }
    }

    pub fn unwire(&self, block: Block) -> MemoryResult<()> {
        let (ptr, len) = self.page_span(block);
        // SAFETY: as for `wire`
        unsafe { self.registry.memory().unwire(ptr, len) }
    }

    fn page_span(&self, block: Block) -> (NonNull<u8>, usize) {
        let page = self.registry.memory().page_size();
        let start = block.addr() & !(page - 1);
        let end = (block.addr() + HEADER_BYTES + self.capacity(block) + page - 1) & !(page - 1);
        // SAFETY: start is the page containing a live header, never null
        (unsafe { NonNull::new_unchecked(start as *mut u8) }, end - start)
    }

    /// Header-only view of `block` from atom `offset` on
    ///
    /// The view holds a reference on the root backer; views of views alias
    /// the original backer directly.
    pub fn virtualize(&mut self, block: Block, offset: usize, rank: u8) -> MemoryResult<Block> {
        let kind = block.kind();
        if !matches!(kind, ValueKind::Bytes | ValueKind::Boxed) {
            return Err(MemoryError::UnsupportedKind(kind.to_string()));
        }
        if offset > block.len() {
            return Err(MemoryError::OutOfBounds { offset, len: block.len() });
        }
        let backer = block.backer().unwrap_or(block);

        self.stack.ensure_room()?;
        let raw = self.pool_alloc(SizeClass(0))?;
        let view = Block::from_header(raw);
        let header = header_mut(view);
        header.chain = ptr::null_mut();
        header.aux = backer.header().as_ptr();
        // SAFETY: offset <= len keeps the pointer within or one past the payload
        header.data = unsafe { block.data_ptr().add(offset << block.atom_size().trailing_zeros()) };
        header.len = block.len() - offset;
        header.kind = kind as u8;
        header.rank = rank;
        header.atom_log2 = block.atom_size().trailing_zeros() as u8;
        header.flags = FLAG_VIRTUAL;
        header.usecount = Usecount::fresh();
        header.zaploc = 0;
        header.tag = header.tag.with_free(false);

        self.raise(backer);
        self.push_entry(view);
        trace!("{} virtualized {:?} at {} as {:?}", self.id, backer, offset, view);
        Ok(view)
    }

    /// Owned copy of `block`'s contents, typically of a virtual view
    pub fn realize(&mut self, block: Block) -> MemoryResult<Block> {
        let layout = ValueLayout {
            kind: block.kind(),
            atom_log2: block.atom_size().trailing_zeros() as u8,
            len: block.len(),
            rank: block.rank(),
        };
        let copy = self.allocate_value(layout)?;
        // SAFETY: both payloads are `data_bytes` long and distinct allocations
        unsafe { ptr::copy_nonoverlapping(block.data_ptr(), copy.data_ptr(), block.data_bytes()) };
        if layout.kind.is_traversable() {
            // The children are now shared with the source
            self.own_copied_children(copy);
        }
        Ok(copy)
    }

    /// Copy of `block` with room for at least twice as many atoms
    ///
    /// The new length is everything the allocation can hold. Extra child
    /// slots start empty.
    pub fn extend(&mut self, block: Block) -> MemoryResult<Block> {
        if block.is_virtual() {
            return Err(MemoryError::VirtualBlock);
        }
        let kind = block.kind();
        if kind.is_fixed_arity() {
            return Err(MemoryError::UnsupportedKind(kind.to_string()));
        }
        let want = block.len().saturating_mul(2).max(1);
        let layout = ValueLayout {
            kind,
            atom_log2: block.atom_size().trailing_zeros() as u8,
            len: want,
            rank: block.rank(),
        };
        let grown = self.allocate_value(layout)?;

        let capacity = self.capacity(grown);
        let fit = if kind.is_traversable() {
            let per_atom = kind.child_slots(1) * size_of::<Option<Block>>();
            capacity / per_atom
        } else {
            capacity >> layout.atom_log2
        };
        let header = header_mut(grown);
        header.len = fit.max(want);
        let slots = kind.child_slots(grown.len());
        // SAFETY: the allocation holds `fit` atoms; slots past the old data start empty
        unsafe {
            ptr::write_bytes(grown.slot(0), 0, slots);
            ptr::copy_nonoverlapping(block.data_ptr(), grown.data_ptr(), block.data_bytes());
        }
        if block.is_recursive() && kind.is_traversable() {
            self.own_copied_children(grown);
        }
        trace!("{} extended {:?} from {} to {} atoms", self.id, block, block.len(), grown.len());
        Ok(grown)
    }
}
