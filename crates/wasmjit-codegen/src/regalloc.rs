//! Register assignment for one function region.
//!
//! Every handle gets exactly one home for its whole lifetime: a
//! callee-saved register while the pool lasts, an rbp-relative spill
//! slot after that. A single static home is what makes the front end's
//! handle aliasing and control-merge moves sound — a `mov h1, h2`
//! recorded by the front end is always a plain move between two fixed
//! locations, on every path.
//!
//! Live ranges are textual [first mention, last mention] intervals over
//! the recorded instruction list. Ranges that overlap a backward branch
//! are widened to cover the whole loop, so anything live in a loop keeps
//! its home across every iteration. Forward branches need no special
//! handling: the textual interval already covers any skipped region.

use std::collections::HashMap;

use crate::encode::Gpr;
use crate::masm::{Assembler, Inst};

/// The home of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Loc {
    Reg(Gpr),
    /// rbp-relative spill slot index (0 is closest to the saved regs).
    Slot(u32),
}

/// Allocation result for one function region.
pub(crate) struct FnAlloc {
    /// Handle id → home.
    pub locs: HashMap<u32, Loc>,
    /// Callee-saved registers this function uses, in push order.
    pub saved: Vec<Gpr>,
    /// `sub rsp` amount: spill slots padded so rsp stays 16-byte
    /// aligned at call sites.
    pub frame_bytes: u32,
}

impl FnAlloc {
    pub(crate) fn loc(&self, id: u32) -> Loc {
        *self.locs.get(&id).expect("handle with no assigned home")
    }

    /// Displacement of a spill slot from rbp (below the saved regs).
    pub(crate) fn slot_disp(&self, slot: u32) -> i32 {
        -(8 * self.saved.len() as i32 + 8 * (slot as i32 + 1))
    }
}

/// Callee-saved registers handed out as homes. rbp is the frame
/// pointer; everything caller-saved is left free for scratch and the
/// calling convention.
const POOL: [Gpr; 5] = [Gpr::Rbx, Gpr::R12, Gpr::R13, Gpr::R14, Gpr::R15];

/// Assign a home to every handle mentioned in `insts[start..end]`.
pub(crate) fn allocate(asm: &Assembler, start: usize, end: usize) -> FnAlloc {
    // Textual live range per handle.
    let mut ranges: HashMap<u32, (usize, usize)> = HashMap::new();
    for (pos, inst) in asm.insts[start..end].iter().enumerate() {
        let pos = start + pos;
        inst.for_each_reg(|h| {
            let r = ranges.entry(h.id()).or_insert((pos, pos));
            r.0 = r.0.min(pos);
            r.1 = r.1.max(pos);
        });
    }

    // Backward branches within the region.
    let mut backedges: Vec<(usize, usize)> = Vec::new();
    for (pos, inst) in asm.insts[start..end].iter().enumerate() {
        let pos = start + pos;
        let target = match inst {
            Inst::Jmp { target } | Inst::JmpIfZero { target, .. } => *target,
            _ => continue,
        };
        if let Some(bound) = asm.label_inst[target.0 as usize] {
            if bound <= pos && bound >= start {
                backedges.push((bound, pos));
            }
        }
    }

    // Widen every range that overlaps a loop to cover the whole loop.
    // Widening can create new overlaps, so iterate to a fixpoint.
    loop {
        let mut changed = false;
        for &(t, b) in &backedges {
            for range in ranges.values_mut() {
                if range.0 <= b && range.1 >= t {
                    if range.0 > t {
                        range.0 = t;
                        changed = true;
                    }
                    if range.1 < b {
                        range.1 = b;
                        changed = true;
                    }
                }
            }
        }
        if !changed {
            break;
        }
    }

    // Linear scan. Intervals are inclusive on both ends, so an interval
    // ending where another starts still conflicts — a three-operand op
    // never sees its destination share a register with an operand.
    let mut order: Vec<(u32, (usize, usize))> = ranges.into_iter().collect();
    order.sort_by_key(|&(id, (s, _))| (s, id));

    let mut free: Vec<Gpr> = POOL.to_vec();
    let mut active: Vec<(usize, Gpr)> = Vec::new(); // (end, reg)
    let mut locs: HashMap<u32, Loc> = HashMap::new();
    let mut used: Vec<Gpr> = Vec::new();
    let mut num_slots: u32 = 0;

    for (id, (s, e)) in order {
        // Expire intervals that ended strictly before this start.
        active.retain(|&(aend, reg)| {
            if aend < s {
                free.push(reg);
                false
            } else {
                true
            }
        });
        free.sort_by_key(|r| POOL.iter().position(|p| p == r));

        if let Some(reg) = (!free.is_empty()).then(|| free.remove(0)) {
            active.push((e, reg));
            if !used.contains(&reg) {
                used.push(reg);
            }
            locs.insert(id, Loc::Reg(reg));
        } else {
            locs.insert(id, Loc::Slot(num_slots));
            num_slots += 1;
        }
        log::trace!("alloc v{id} [{s}, {e}] -> {:?}", locs[&id]);
    }

    used.sort_by_key(|r| POOL.iter().position(|p| p == r));

    // Pad the frame so that rsp is 16-byte aligned in the body:
    // entry rsp ≡ 8 (mod 16); push rbp realigns; each callee-saved push
    // and the sub itself must cancel out.
    let pushed = 8 * used.len() as u32;
    let slot_bytes = 8 * num_slots;
    let frame_bytes = slot_bytes + (16 - (slot_bytes + pushed) % 16) % 16;

    FnAlloc {
        locs,
        saved: used,
        frame_bytes,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masm::{Assembler, Width};

    #[test]
    fn few_values_stay_in_registers() {
        let mut asm = Assembler::new();
        let a = asm.new_reg(Width::W32);
        let b = asm.new_reg(Width::W32);
        let c = asm.new_reg(Width::W32);
        asm.begin_function(&[a, b]).unwrap();
        asm.add(c, a, b);
        asm.ret(Some(c));
        asm.end_function();

        let alloc = allocate(&asm, 0, asm.insts.len());
        for h in [a, b, c] {
            assert!(matches!(alloc.loc(h.id()), Loc::Reg(_)));
        }
        assert_eq!(alloc.frame_bytes % 8, 0);
    }

    #[test]
    fn overlapping_values_get_distinct_homes() {
        let mut asm = Assembler::new();
        asm.begin_function(&[]).unwrap();
        let regs: Vec<_> = (0..8)
            .map(|i| {
                let h = asm.new_reg(Width::W32);
                asm.mov_imm(h, i);
                h
            })
            .collect();
        // Keep them all live to the end.
        let sum = asm.new_reg(Width::W32);
        asm.mov_imm(sum, 0);
        for r in &regs {
            asm.add(sum, sum, *r);
        }
        asm.ret(Some(sum));
        asm.end_function();

        let alloc = allocate(&asm, 0, asm.insts.len());
        let mut homes: Vec<Loc> = regs.iter().map(|r| alloc.loc(r.id())).collect();
        homes.push(alloc.loc(sum.id()));
        for (i, a) in homes.iter().enumerate() {
            for b in &homes[i + 1..] {
                assert_ne!(a, b, "two live values share a home");
            }
        }
        // 9 simultaneously live values cannot fit the 5-register pool.
        assert!(homes.iter().any(|l| matches!(l, Loc::Slot(_))));
    }

    #[test]
    fn loop_extends_ranges_across_backedge() {
        let mut asm = Assembler::new();
        let i = asm.new_reg(Width::W32);
        let one = asm.new_reg(Width::W32);
        let tmp = asm.new_reg(Width::W32);
        asm.begin_function(&[]).unwrap();
        asm.mov_imm(i, 10);
        let head = asm.new_label();
        asm.bind(head);
        // `one` is defined before its textual last use inside the loop;
        // the backedge must keep it pinned for the whole loop.
        asm.mov_imm(one, 1);
        asm.alu(crate::masm::AluOp::Sub, tmp, i, one);
        asm.mov(i, tmp);
        asm.jmp_if_zero(i, head);
        asm.ret(Some(i));
        asm.end_function();

        let alloc = allocate(&asm, 0, asm.insts.len());
        // All three must have distinct homes: their widened ranges all
        // cover the loop body.
        let homes = [alloc.loc(i.id()), alloc.loc(one.id()), alloc.loc(tmp.id())];
        for (x, a) in homes.iter().enumerate() {
            for b in &homes[x + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
