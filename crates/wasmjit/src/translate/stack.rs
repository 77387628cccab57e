//! Per-block virtual operand stack.
//!
//! Each entry is a register handle; duplicating a handle creates an
//! alias of the same underlying location, not a fresh one. The frozen
//! depth marks the boundary below which a child block must not pop, and
//! the region above it is where control-flow edges pin their merge
//! results.

use std::collections::HashSet;

use wasmjit_codegen::masm::{Assembler, RegHandle};

#[derive(Debug, Default)]
pub(crate) struct OperandStack {
    regs: Vec<RegHandle>,
    frozen: Option<usize>,
}

impl OperandStack {
    pub(crate) fn new() -> Self {
        OperandStack {
            regs: Vec::new(),
            frozen: None,
        }
    }

    pub(crate) fn push(&mut self, h: RegHandle) {
        self.regs.push(h);
    }

    pub(crate) fn pop(&mut self) -> RegHandle {
        assert!(
            self.regs.len() > self.frozen_depth(),
            "operand stack underflow (pop at depth {}, frozen {})",
            self.regs.len(),
            self.frozen_depth()
        );
        self.regs.pop().unwrap()
    }

    pub(crate) fn peek(&self) -> &RegHandle {
        assert!(!self.regs.is_empty(), "operand stack underflow (peek)");
        self.regs.last().unwrap()
    }

    pub(crate) fn size(&self) -> usize {
        self.regs.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.regs.is_empty()
    }

    /// Record the boundary below which a child block must not pop.
    pub(crate) fn freeze(&mut self) {
        debug_assert!(self.frozen.is_none(), "stack frozen twice");
        self.frozen = Some(self.regs.len());
    }

    pub(crate) fn unfreeze(&mut self) {
        self.frozen = None;
    }

    pub(crate) fn frozen_depth(&self) -> usize {
        self.frozen.unwrap_or(0)
    }

    /// Move the top `in_arity` handles off `parent` onto this (empty)
    /// stack, preserving order. This is how a child block inherits its
    /// input operands.
    pub(crate) fn init_from(&mut self, parent: &mut OperandStack, in_arity: usize) {
        debug_assert!(self.regs.is_empty(), "init_from into a non-empty stack");
        debug_assert!(parent.regs.len() >= in_arity, "parent too shallow");
        let at = parent.regs.len() - in_arity;
        self.regs.extend(parent.regs.drain(at..));
    }

    /// Merge the top `count` values of `source` into this stack at the
    /// frozen boundary.
    ///
    /// Positions already pinned by a prior edge get a register move
    /// (unless the handles coincide); the rest of the source handles
    /// are appended and become the pinned set. Every predecessor edge
    /// into the join therefore leaves its results in the same
    /// locations.
    pub(crate) fn transfer_from(
        &mut self,
        masm: &mut Assembler,
        source: &OperandStack,
        count: usize,
    ) {
        let frozen = self.frozen.expect("transfer into an unfrozen stack");
        assert!(source.size() >= count, "transfer source too shallow");
        let pinned = self.regs.len() - frozen;
        let src_base = source.size() - count;
        let merged = pinned.min(count);
        for i in 0..merged {
            let dst = self.regs[frozen + i];
            let src = source.regs[src_base + i];
            if dst != src {
                masm.mov(dst, src);
            }
        }
        for i in merged..count {
            self.regs.push(source.regs[src_base + i]);
        }
        // Net size: frozen + max(pinned, count).
    }

    /// Copy out stack entries that alias a local or an earlier entry.
    ///
    /// Walks the stack once, remembering seen ids (seeded with the
    /// locals), and replaces each repeat with a fresh handle holding a
    /// copy. Run before a merge pins handles at a join, so the merge
    /// cannot overwrite a value that is still live on another path.
    pub(crate) fn deduplicate(&mut self, masm: &mut Assembler, locals: &[RegHandle]) {
        let mut seen: HashSet<u32> = locals.iter().map(|h| h.id()).collect();
        for slot in self.regs.iter_mut() {
            if !seen.insert(slot.id()) {
                let copy = masm.new_reg(slot.width());
                masm.mov(copy, *slot);
                *slot = copy;
            }
        }
    }

    /// Mutable view of the entries (local-alias spilling on `local.set`).
    pub(crate) fn slots_mut(&mut self) -> impl Iterator<Item = &mut RegHandle> {
        self.regs.iter_mut()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wasmjit_codegen::masm::Width;

    fn asm_with_regs(n: usize) -> (Assembler, Vec<RegHandle>) {
        let mut masm = Assembler::new();
        let regs = (0..n).map(|_| masm.new_reg(Width::W32)).collect();
        (masm, regs)
    }

    #[test]
    fn push_pop_peek() {
        let (_, regs) = asm_with_regs(2);
        let mut s = OperandStack::new();
        s.push(regs[0]);
        s.push(regs[1]);
        assert_eq!(*s.peek(), regs[1]);
        assert_eq!(s.pop(), regs[1]);
        assert_eq!(s.pop(), regs[0]);
        assert!(s.is_empty());
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn pop_empty_is_a_bug() {
        let mut s = OperandStack::new();
        s.pop();
    }

    #[test]
    #[should_panic(expected = "underflow")]
    fn pop_below_frozen_is_a_bug() {
        let (_, regs) = asm_with_regs(1);
        let mut s = OperandStack::new();
        s.push(regs[0]);
        s.freeze();
        s.pop();
    }

    #[test]
    fn init_from_moves_top_values() {
        let (_, regs) = asm_with_regs(3);
        let mut parent = OperandStack::new();
        for r in &regs {
            parent.push(*r);
        }
        let mut child = OperandStack::new();
        child.init_from(&mut parent, 2);
        assert_eq!(parent.size(), 1);
        assert_eq!(child.size(), 2);
        assert_eq!(child.pop(), regs[2]);
        assert_eq!(child.pop(), regs[1]);
    }

    #[test]
    fn first_transfer_pins_source_handles() {
        let (mut masm, regs) = asm_with_regs(2);
        let mut parent = OperandStack::new();
        parent.freeze();
        let mut child = OperandStack::new();
        child.push(regs[0]);
        child.push(regs[1]);

        let before = masm.num_regs();
        parent.transfer_from(&mut masm, &child, 2);
        // First edge into the join: pure bookkeeping, no moves and no
        // fresh handles.
        assert_eq!(masm.num_regs(), before);
        assert_eq!(parent.size(), 2);
        assert_eq!(*parent.peek(), regs[1]);
    }

    #[test]
    fn second_transfer_moves_into_pinned_handles() {
        let (mut masm, regs) = asm_with_regs(2);
        let mut parent = OperandStack::new();
        parent.freeze();

        let mut path_a = OperandStack::new();
        path_a.push(regs[0]);
        parent.transfer_from(&mut masm, &path_a, 1);

        let mut path_b = OperandStack::new();
        path_b.push(regs[1]);
        parent.transfer_from(&mut masm, &path_b, 1);

        // The pinned handle stays the first edge's; the second edge
        // emitted a move into it.
        assert_eq!(parent.size(), 1);
        assert_eq!(*parent.peek(), regs[0]);
        let listing = masm.to_string();
        assert!(listing.contains("v0 = v1"), "expected a merge move: {listing}");
    }

    #[test]
    fn transfer_same_handle_emits_nothing() {
        let (mut masm, regs) = asm_with_regs(1);
        let mut parent = OperandStack::new();
        parent.freeze();
        let mut child = OperandStack::new();
        child.push(regs[0]);
        parent.transfer_from(&mut masm, &child, 1);
        parent.transfer_from(&mut masm, &child, 1);
        assert!(masm.to_string().is_empty());
    }

    #[test]
    fn dedup_copies_repeats_and_local_aliases() {
        let (mut masm, regs) = asm_with_regs(2);
        let local = regs[0];
        let mut s = OperandStack::new();
        s.push(local); // alias of a local
        s.push(regs[1]);
        s.push(regs[1]); // repeat

        s.deduplicate(&mut masm, &[local]);

        // Slot 0 aliased a local → copied. Slot 2 repeated slot 1 → copied.
        let ids: Vec<u32> = {
            let mut v = Vec::new();
            for slot in s.slots_mut() {
                v.push(slot.id());
            }
            v
        };
        assert_ne!(ids[0], local.id());
        assert_eq!(ids[1], regs[1].id());
        assert_ne!(ids[2], regs[1].id());
        assert_ne!(ids[0], ids[2]);
    }
}
