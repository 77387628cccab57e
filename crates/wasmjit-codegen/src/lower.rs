//! Lowering of the recorded program to x86-64 bytes.
//!
//! Walks the instruction list once per module: function regions get
//! their allocation from regalloc, then every instruction is encoded
//! with its operands resolved to homes. Values homed in spill slots are
//! staged through the caller-saved scratch registers r10/r11 (rax for a
//! third operand); homes themselves are callee-saved, so calls clobber
//! nothing that lives in a home.
//!
//! Labels bind to byte offsets as they are passed; every branch and
//! intra-module call records a rel32 fixup that is resolved at the end,
//! after which the constant pool is appended and the bytes are copied
//! into an executable `CodeBuffer`.

use std::collections::HashMap;

use crate::CodegenError;
use crate::code_buffer::CodeBuffer;
use crate::encode::{ARG_REGS, AluRmOp, CondCode, Encoder, Gpr, PatchPoint};
use crate::masm::{AluOp, Assembler, CallTarget, Cc, ConstId, Inst, Label, RegHandle, Width};
use crate::regalloc::{self, FnAlloc, Loc};

/// Finalized executable image with label offsets.
#[derive(Debug)]
pub struct CodeImage {
    buffer: CodeBuffer,
    label_offsets: Vec<Option<usize>>,
}

impl CodeImage {
    /// Byte offset of a bound label within the image.
    pub fn offset_of(&self, label: Label) -> Option<usize> {
        self.label_offsets[label.0 as usize]
    }

    /// Entry pointer for a bound label: image base + label offset.
    pub fn entry_of(&self, label: Label) -> *const u8 {
        let off = self
            .offset_of(label)
            .unwrap_or_else(|| panic!("label L{} not bound in image", label.0));
        unsafe { self.buffer.entry().add(off) }
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

fn w64(h: RegHandle) -> bool {
    h.width() == Width::W64
}

fn cond(cc: Cc) -> CondCode {
    match cc {
        Cc::Eq => CondCode::E,
        Cc::Ne => CondCode::Ne,
        Cc::LtS => CondCode::L,
        Cc::LtU => CondCode::B,
        Cc::GtS => CondCode::G,
        Cc::GtU => CondCode::A,
        Cc::LeS => CondCode::Le,
        Cc::LeU => CondCode::Be,
        Cc::GeS => CondCode::Ge,
        Cc::GeU => CondCode::Ae,
    }
}

/// Read a handle's value: its home register directly, or a load of its
/// spill slot into `scratch`.
fn read(enc: &mut Encoder, alloc: &FnAlloc, h: RegHandle, scratch: Gpr) -> Gpr {
    match alloc.loc(h.id()) {
        Loc::Reg(r) => r,
        Loc::Slot(s) => {
            enc.load_rbp(w64(h), scratch, alloc.slot_disp(s));
            scratch
        }
    }
}

/// Materialize a handle's value in `dst` unconditionally.
fn read_into(enc: &mut Encoder, alloc: &FnAlloc, h: RegHandle, dst: Gpr) {
    match alloc.loc(h.id()) {
        Loc::Reg(r) => {
            if r != dst {
                enc.mov_rr(w64(h), dst, r);
            }
        }
        Loc::Slot(s) => enc.load_rbp(w64(h), dst, alloc.slot_disp(s)),
    }
}

/// Move a physical register into a handle's home.
fn write(enc: &mut Encoder, alloc: &FnAlloc, h: RegHandle, src: Gpr) {
    match alloc.loc(h.id()) {
        Loc::Reg(r) => {
            if r != src {
                enc.mov_rr(w64(h), r, src);
            }
        }
        Loc::Slot(s) => enc.store_rbp(w64(h), alloc.slot_disp(s), src),
    }
}

fn mov_imm_reg(enc: &mut Encoder, r: Gpr, val: i64, wide: bool) {
    if wide {
        enc.mov_ri64(r, val);
    } else {
        enc.mov_ri32(r, val as i32);
    }
}

/// Zero-extend a 32-bit index handle into r11 for SIB addressing. A
/// 32-bit register move clears the upper half, so whatever garbage the
/// home's upper bits hold never reaches the address computation.
fn read_index(enc: &mut Encoder, alloc: &FnAlloc, h: RegHandle) {
    match alloc.loc(h.id()) {
        Loc::Reg(r) => enc.mov_rr(false, Gpr::R11, r),
        Loc::Slot(s) => enc.load_rbp(false, Gpr::R11, alloc.slot_disp(s)),
    }
}

fn emit_prologue(enc: &mut Encoder, alloc: &FnAlloc, params: &[RegHandle]) {
    enc.push_r(Gpr::Rbp);
    enc.mov_rr(true, Gpr::Rbp, Gpr::Rsp);
    for &r in &alloc.saved {
        enc.push_r(r);
    }
    if alloc.frame_bytes > 0 {
        enc.sub_rsp(alloc.frame_bytes as i32);
    }
    for (i, p) in params.iter().enumerate() {
        write(enc, alloc, *p, ARG_REGS[i]);
    }
}

fn emit_epilogue(enc: &mut Encoder, alloc: &FnAlloc) {
    enc.lea_rsp_rbp(-(8 * alloc.saved.len() as i32));
    for &r in alloc.saved.iter().rev() {
        enc.pop_r(r);
    }
    enc.pop_r(Gpr::Rbp);
    enc.ret();
}

pub(crate) fn finalize(asm: Assembler) -> Result<CodeImage, CodegenError> {
    // Function regions: (FuncBegin index, one past FuncEnd).
    let mut regions: Vec<(usize, usize)> = Vec::new();
    let mut open: Option<usize> = None;
    for (i, inst) in asm.insts.iter().enumerate() {
        match inst {
            Inst::FuncBegin { .. } => open = Some(i),
            Inst::FuncEnd => {
                let start = open.take().expect("FuncEnd without FuncBegin");
                regions.push((start, i + 1));
            }
            _ => {}
        }
    }

    let allocs: HashMap<usize, FnAlloc> = regions
        .iter()
        .map(|&(s, e)| (s, regalloc::allocate(&asm, s, e)))
        .collect();

    let mut enc = Encoder::new();
    let mut label_offsets: Vec<Option<usize>> = vec![None; asm.num_labels()];
    let mut label_fixups: Vec<(Label, PatchPoint)> = Vec::new();
    let mut const_fixups: Vec<(ConstId, PatchPoint)> = Vec::new();
    let mut cur: Option<&FnAlloc> = None;

    for (i, inst) in asm.insts.iter().enumerate() {
        match inst {
            Inst::FuncBegin { params } => {
                let alloc = &allocs[&i];
                emit_prologue(&mut enc, alloc, params);
                cur = Some(alloc);
            }
            Inst::FuncEnd => cur = None,
            Inst::Bind { label } => {
                label_offsets[label.0 as usize] = Some(enc.offset());
            }
            inst => {
                let alloc = cur.expect("instruction outside a function region");
                emit_inst(
                    &mut enc,
                    alloc,
                    inst,
                    &mut label_fixups,
                    &mut const_fixups,
                );
            }
        }
    }

    // Every recorded branch must target a label bound by now.
    for (label, pp) in label_fixups {
        let target = label_offsets[label.0 as usize]
            .unwrap_or_else(|| panic!("branch to unbound label L{} at finalize", label.0));
        enc.patch_rel32(pp, target);
    }

    // Constant pool sits after the code, 8 bytes per entry.
    enc.pad_to_align(8);
    let pool_base = enc.offset();
    for v in &asm.consts {
        enc.emit_raw(&v.to_le_bytes());
    }
    for (cid, pp) in const_fixups {
        enc.patch_rip_disp(pp, pool_base + 8 * cid.0 as usize);
    }

    let mut buffer = CodeBuffer::new(enc.offset().max(16))?;
    buffer.emit(enc.code());
    buffer.finalize()?;

    Ok(CodeImage {
        buffer,
        label_offsets,
    })
}

fn emit_inst(
    enc: &mut Encoder,
    alloc: &FnAlloc,
    inst: &Inst,
    label_fixups: &mut Vec<(Label, PatchPoint)>,
    const_fixups: &mut Vec<(ConstId, PatchPoint)>,
) {
    match inst {
        Inst::FuncBegin { .. } | Inst::FuncEnd | Inst::Bind { .. } => unreachable!(),

        Inst::MovImm { dst, val } => match alloc.loc(dst.id()) {
            Loc::Reg(r) => mov_imm_reg(enc, r, *val, w64(*dst)),
            Loc::Slot(s) => {
                mov_imm_reg(enc, Gpr::R10, *val, w64(*dst));
                enc.store_rbp(w64(*dst), alloc.slot_disp(s), Gpr::R10);
            }
        },

        Inst::Mov { dst, src } => {
            let s = read(enc, alloc, *src, Gpr::R10);
            write(enc, alloc, *dst, s);
        }

        Inst::Add { dst, lhs, rhs } => {
            let wide = w64(*dst);
            let lhs_r = read(enc, alloc, *lhs, Gpr::R10);
            let rhs_r = read(enc, alloc, *rhs, Gpr::R11);
            match alloc.loc(dst.id()) {
                Loc::Reg(d) => {
                    if d == lhs_r {
                        enc.alu_rr(AluRmOp::Add, wide, d, rhs_r);
                    } else {
                        enc.lea_rr(wide, d, lhs_r, rhs_r);
                    }
                }
                Loc::Slot(s) => {
                    enc.lea_rr(wide, Gpr::R10, lhs_r, rhs_r);
                    enc.store_rbp(wide, alloc.slot_disp(s), Gpr::R10);
                }
            }
        }

        Inst::Alu { op, dst, lhs, rhs } => {
            let wide = w64(*dst);
            read_into(enc, alloc, *lhs, Gpr::R10);
            let rhs_r = read(enc, alloc, *rhs, Gpr::R11);
            match op {
                AluOp::Sub => enc.alu_rr(AluRmOp::Sub, wide, Gpr::R10, rhs_r),
                AluOp::And => enc.alu_rr(AluRmOp::And, wide, Gpr::R10, rhs_r),
                AluOp::Or => enc.alu_rr(AluRmOp::Or, wide, Gpr::R10, rhs_r),
                AluOp::Xor => enc.alu_rr(AluRmOp::Xor, wide, Gpr::R10, rhs_r),
                AluOp::Mul => enc.imul_rr(wide, Gpr::R10, rhs_r),
            }
            write(enc, alloc, *dst, Gpr::R10);
        }

        Inst::CmpSet { cc, dst, lhs, rhs } => {
            let wide = w64(*lhs);
            let lhs_r = read(enc, alloc, *lhs, Gpr::R10);
            let rhs_r = read(enc, alloc, *rhs, Gpr::R11);
            enc.cmp_rr(wide, lhs_r, rhs_r);
            // Flags are latched: r11 can be reused as the setcc byte.
            enc.setcc(cond(*cc), Gpr::R11);
            match alloc.loc(dst.id()) {
                Loc::Reg(d) => enc.movzx_r32_r8(d, Gpr::R11),
                Loc::Slot(s) => {
                    enc.movzx_r32_r8(Gpr::R10, Gpr::R11);
                    enc.store_rbp(false, alloc.slot_disp(s), Gpr::R10);
                }
            }
        }

        Inst::Load { dst, base, index } => {
            let base_r = read(enc, alloc, *base, Gpr::R10);
            read_index(enc, alloc, *index);
            match alloc.loc(dst.id()) {
                Loc::Reg(d) => enc.load32_bi(d, base_r, Gpr::R11),
                Loc::Slot(s) => {
                    enc.load32_bi(Gpr::Rax, base_r, Gpr::R11);
                    enc.store_rbp(false, alloc.slot_disp(s), Gpr::Rax);
                }
            }
        }

        Inst::Store { base, index, src } => {
            let base_r = read(enc, alloc, *base, Gpr::R10);
            read_index(enc, alloc, *index);
            let src_r = match alloc.loc(src.id()) {
                Loc::Reg(r) => r,
                Loc::Slot(s) => {
                    enc.load_rbp(false, Gpr::Rax, alloc.slot_disp(s));
                    Gpr::Rax
                }
            };
            enc.store32_bi(base_r, Gpr::R11, src_r);
        }

        Inst::LoadConst { dst, cid } => match alloc.loc(dst.id()) {
            Loc::Reg(d) => {
                let pp = enc.load_rip(w64(*dst), d);
                const_fixups.push((*cid, pp));
            }
            Loc::Slot(s) => {
                let pp = enc.load_rip(w64(*dst), Gpr::Rax);
                const_fixups.push((*cid, pp));
                enc.store_rbp(w64(*dst), alloc.slot_disp(s), Gpr::Rax);
            }
        },

        Inst::Jmp { target } => {
            let pp = enc.jmp_rel32();
            label_fixups.push((*target, pp));
        }

        Inst::JmpIfZero { cond, target } => {
            let c = read(enc, alloc, *cond, Gpr::R10);
            enc.test_rr(w64(*cond), c, c);
            let pp = enc.jz_rel32();
            label_fixups.push((*target, pp));
        }

        Inst::Call { target, args, ret } => {
            // Argument sources are homes (callee-saved regs or slots),
            // never argument registers, so there is no ordering hazard.
            for (i, a) in args.iter().enumerate() {
                read_into(enc, alloc, *a, ARG_REGS[i]);
            }
            match target {
                CallTarget::Label(l) => {
                    let pp = enc.call_rel32();
                    label_fixups.push((*l, pp));
                }
                CallTarget::Ptr(p) => {
                    enc.mov_ri64(Gpr::R10, *p as i64);
                    enc.call_r(Gpr::R10);
                }
            }
            if let Some(r) = ret {
                write(enc, alloc, *r, Gpr::Rax);
            }
        }

        Inst::Ret { val } => {
            if let Some(v) = val {
                read_into(enc, alloc, *v, Gpr::Rax);
            }
            emit_epilogue(enc, alloc);
        }

        Inst::Trap => enc.ud2(),
    }
}

// The tests execute emitted code, so they only run on x86-64 hosts.
#[cfg(all(test, target_arch = "x86_64"))]
mod tests {
    use super::*;
    use crate::masm::{AluOp, Assembler, CallTarget, Cc, Width};

    type Fn0 = unsafe extern "C" fn() -> i32;
    type Fn1 = unsafe extern "C" fn(i32) -> i32;
    type Fn2 = unsafe extern "C" fn(i32, i32) -> i32;

    #[test]
    fn add_function_executes() {
        let mut asm = Assembler::new();
        let entry = asm.new_label();
        let a = asm.new_reg(Width::W32);
        let b = asm.new_reg(Width::W32);
        let c = asm.new_reg(Width::W32);
        asm.bind(entry);
        asm.begin_function(&[a, b]).unwrap();
        asm.add(c, a, b);
        asm.ret(Some(c));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn2 = unsafe { std::mem::transmute(image.entry_of(entry)) };
        assert_eq!(unsafe { f(1, 2) }, 3);
        assert_eq!(unsafe { f(i32::MAX, 1) }, i32::MIN); // wrapping
    }

    #[test]
    fn spilled_values_survive() {
        let mut asm = Assembler::new();
        let entry = asm.new_label();
        asm.bind(entry);
        asm.begin_function(&[]).unwrap();
        // More simultaneously-live values than the register pool holds.
        let vals: Vec<_> = (0..9)
            .map(|i| {
                let h = asm.new_reg(Width::W32);
                asm.mov_imm(h, i);
                h
            })
            .collect();
        let mut acc = asm.new_reg(Width::W32);
        asm.mov_imm(acc, 0);
        for v in &vals {
            let next = asm.new_reg(Width::W32);
            asm.add(next, acc, *v);
            acc = next;
        }
        asm.ret(Some(acc));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn0 = unsafe { std::mem::transmute(image.entry_of(entry)) };
        assert_eq!(unsafe { f() }, (0..9).sum::<i32>());
    }

    #[test]
    fn sub_mul_cmp_execute() {
        let mut asm = Assembler::new();
        let entry = asm.new_label();
        let a = asm.new_reg(Width::W32);
        let b = asm.new_reg(Width::W32);
        asm.bind(entry);
        asm.begin_function(&[a, b]).unwrap();
        let d = asm.new_reg(Width::W32);
        asm.alu(AluOp::Sub, d, a, b);
        let m = asm.new_reg(Width::W32);
        asm.alu(AluOp::Mul, m, d, b);
        let g = asm.new_reg(Width::W32);
        asm.cmp_set(Cc::GtS, g, m, a);
        asm.ret(Some(g));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn2 = unsafe { std::mem::transmute(image.entry_of(entry)) };
        // (10 - 3) * 3 = 21 > 10 → 1
        assert_eq!(unsafe { f(10, 3) }, 1);
        // (1 - 3) * 3 = -6 > 1 is false → 0
        assert_eq!(unsafe { f(1, 3) }, 0);
    }

    #[test]
    fn cross_function_call() {
        let mut asm = Assembler::new();
        let callee = asm.new_label();
        let caller = asm.new_label();

        // caller first: forward call through an unbound label.
        let r0 = asm.new_reg(Width::W32);
        asm.bind(caller);
        asm.begin_function(&[]).unwrap();
        let arg = asm.new_reg(Width::W32);
        asm.mov_imm(arg, 41);
        asm.call(CallTarget::Label(callee), vec![arg], Some(r0));
        asm.ret(Some(r0));
        asm.end_function();

        let p = asm.new_reg(Width::W32);
        asm.bind(callee);
        asm.begin_function(&[p]).unwrap();
        let one = asm.new_reg(Width::W32);
        asm.mov_imm(one, 1);
        let sum = asm.new_reg(Width::W32);
        asm.add(sum, p, one);
        asm.ret(Some(sum));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn0 = unsafe { std::mem::transmute(image.entry_of(caller)) };
        assert_eq!(unsafe { f() }, 42);
    }

    #[test]
    fn call_host_pointer() {
        extern "C" fn double_it(x: i32) -> i32 {
            x * 2
        }

        let mut asm = Assembler::new();
        let entry = asm.new_label();
        let p = asm.new_reg(Width::W32);
        asm.bind(entry);
        asm.begin_function(&[p]).unwrap();
        let r = asm.new_reg(Width::W32);
        asm.call(
            CallTarget::Ptr(double_it as usize),
            vec![p],
            Some(r),
        );
        asm.ret(Some(r));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn1 = unsafe { std::mem::transmute(image.entry_of(entry)) };
        assert_eq!(unsafe { f(21) }, 42);
    }

    #[test]
    fn loop_counts_down() {
        let mut asm = Assembler::new();
        let entry = asm.new_label();
        let n = asm.new_reg(Width::W32);
        asm.bind(entry);
        asm.begin_function(&[n]).unwrap();
        let one = asm.new_reg(Width::W32);
        asm.mov_imm(one, 1);
        let acc = asm.new_reg(Width::W32);
        asm.mov_imm(acc, 0);
        let head = asm.new_label();
        let exit = asm.new_label();
        asm.bind(head);
        asm.jmp_if_zero(n, exit);
        let next_acc = asm.new_reg(Width::W32);
        asm.add(next_acc, acc, n);
        asm.mov(acc, next_acc);
        let next_n = asm.new_reg(Width::W32);
        asm.alu(AluOp::Sub, next_n, n, one);
        asm.mov(n, next_n);
        asm.jmp(head);
        asm.bind(exit);
        asm.ret(Some(acc));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn1 = unsafe { std::mem::transmute(image.entry_of(entry)) };
        assert_eq!(unsafe { f(5) }, 15);
        assert_eq!(unsafe { f(0) }, 0);
    }

    #[test]
    fn memory_store_then_load() {
        let mut mem = vec![0u8; 64];
        let base_addr = mem.as_mut_ptr() as i64;

        let mut asm = Assembler::new();
        let entry = asm.new_label();
        asm.bind(entry);
        asm.begin_function(&[]).unwrap();
        let base = asm.new_reg(Width::W64);
        asm.mov_imm(base, base_addr);
        let idx = asm.new_reg(Width::W32);
        asm.mov_imm(idx, 12);
        let val = asm.new_reg(Width::W32);
        asm.mov_imm(val, 1337);
        asm.store(base, idx, val);
        let out = asm.new_reg(Width::W32);
        asm.load(out, base, idx);
        asm.ret(Some(out));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn0 = unsafe { std::mem::transmute(image.entry_of(entry)) };
        assert_eq!(unsafe { f() }, 1337);
        assert_eq!(&mem[12..16], &1337i32.to_le_bytes());
    }

    #[test]
    fn const_pool_load() {
        let mut asm = Assembler::new();
        let cid = asm.add_const(0x0042_1337);
        let entry = asm.new_label();
        asm.bind(entry);
        asm.begin_function(&[]).unwrap();
        let d = asm.new_reg(Width::W32);
        asm.load_const(d, cid);
        asm.ret(Some(d));
        asm.end_function();

        let image = asm.finalize().unwrap();
        let f: Fn0 = unsafe { std::mem::transmute(image.entry_of(entry)) };
        assert_eq!(unsafe { f() }, 0x0042_1337);
    }
}
