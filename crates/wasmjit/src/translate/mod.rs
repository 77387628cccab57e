//! Single-pass translation of function bodies.
//!
//! The driver streams pre-decoded opcodes in source order with no
//! look-ahead; each handler mutates the active block's operand stack
//! and records instructions through the assembler. Structured control
//! flow is resolved on the fly: opening a block freezes the parent
//! stack, and every edge into a join harmonizes its values through
//! `OperandStack::transfer_from`.
//!
//! An `if` opens two nested blocks — an outer join block and an inner
//! then-block — with a branch-if-zero to the inner block's label
//! (bound at the else entry, or at the join when no else exists).
//! Branch depths are wasm-relative, so resolution skips the synthetic
//! inner if-blocks.

pub(crate) mod block;
pub(crate) mod stack;

use wasmjit_codegen::masm::{AluOp, Assembler, CallTarget, Cc, RegHandle, Width};

use crate::error::CompileError;
use crate::jit::ModuleCtx;
use crate::parse::FuncSig;
use crate::parse::body::{BlockType, Op};
use crate::value::ValKind;
use block::{Block, BlockKind, BlockManager};
use stack::OperandStack;

/// Translate one defined function into recorded instructions.
pub(crate) fn translate_func(
    masm: &mut Assembler,
    ctx: &ModuleCtx<'_>,
    defined_idx: u32,
) -> Result<(), CompileError> {
    let module = ctx.module;
    let func_idx = module.num_imports() + defined_idx;
    let func = &module.funcs[defined_idx as usize];
    let sig = module.sig_of(func_idx).clone();
    log::debug!(
        "translating fn{} ({} params, {} locals, {} ops)",
        func_idx,
        sig.params.len(),
        func.locals.len(),
        func.body.ops.len()
    );

    let mut t = FuncTranslator {
        masm,
        ctx,
        func_idx,
        blocks: BlockManager::new(),
        locals: Vec::new(),
        ret: sig.ret,
    };
    t.start_function(&sig)?;
    t.add_locals(&func.locals);

    // Nesting depth of the wasm structure (the two translator blocks
    // of an `if` count once here). `end` at depth 0 ends the function.
    let mut depth: u32 = 0;
    // Dead-code skip after br/return/unreachable: counts block opens
    // until the enclosing else/end resumes translation.
    let mut skip: Option<u32> = None;

    for op in &func.body.ops {
        log::trace!("fn{func_idx}: {op:?}");

        if let Some(n) = skip {
            match op {
                Op::Block(_) | Op::Loop(_) | Op::If(_) => {
                    skip = Some(n + 1);
                    continue;
                }
                Op::End if n > 0 => {
                    skip = Some(n - 1);
                    continue;
                }
                Op::Else if n > 0 => continue,
                Op::End | Op::Else => {
                    skip = None;
                    t.blocks.active_mut().unreachable = true;
                    // fall through to the handler below
                }
                _ => continue,
            }
        }

        match op {
            Op::Nop => {}
            Op::Unreachable => {
                t.masm.trap();
                skip = Some(0);
            }
            Op::Return => {
                t.emit_return();
                skip = Some(0);
            }

            Op::Block(bt) => {
                let (in_arity, out_arity) = t.block_arity(bt)?;
                t.start_block(BlockKind::Block, in_arity, out_arity);
                depth += 1;
            }
            Op::Loop(bt) => {
                let (in_arity, out_arity) = t.block_arity(bt)?;
                t.start_block(BlockKind::Loop, in_arity, out_arity);
                depth += 1;
            }
            Op::If(bt) => {
                t.start_if(bt)?;
                depth += 1;
            }
            Op::Else => t.else_()?,
            Op::End => {
                if depth == 0 {
                    t.end_function();
                    return Ok(());
                }
                t.end_block();
                depth -= 1;
            }
            Op::Br(d) => {
                t.br(*d)?;
                skip = Some(0);
            }
            Op::BrIf(d) => t.br_if(*d)?,
            Op::Call(f) => t.call(*f)?,

            Op::Drop => {
                t.blocks.active_mut().stack.pop();
            }
            Op::LocalGet(i) => t.local_get(*i),
            Op::LocalSet(i) => t.local_set(*i),
            Op::LocalTee(i) => t.local_tee(*i),
            Op::GlobalGet(i) => t.global_get(*i)?,

            Op::I32Load { offset } => t.i32_load(*offset),
            Op::I32Store { offset } => t.i32_store(*offset),

            Op::I32Const(v) => t.i32_const(*v),
            Op::I64Const(v) => t.i64_const(*v),

            Op::I32Eqz => t.i32_eqz(),
            Op::I32Eq => t.cmp(Cc::Eq),
            Op::I32Ne => t.cmp(Cc::Ne),
            Op::I32LtS => t.cmp(Cc::LtS),
            Op::I32LtU => t.cmp(Cc::LtU),
            Op::I32GtS => t.cmp(Cc::GtS),
            Op::I32GtU => t.cmp(Cc::GtU),
            Op::I32LeS => t.cmp(Cc::LeS),
            Op::I32LeU => t.cmp(Cc::LeU),
            Op::I32GeS => t.cmp(Cc::GeS),
            Op::I32GeU => t.cmp(Cc::GeU),

            Op::I32Add => t.add(),
            Op::I32Sub => t.alu(AluOp::Sub),
            Op::I32Mul => t.alu(AluOp::Mul),
            Op::I32And => t.alu(AluOp::And),
            Op::I32Or => t.alu(AluOp::Or),
            Op::I32Xor => t.alu(AluOp::Xor),

            Op::Unsupported(name) => {
                return Err(CompileError::Unsupported(format!(
                    "opcode {name} in fn{func_idx}"
                )));
            }
        }
    }

    Err(CompileError::InvalidBinary(format!(
        "fn{func_idx}: body ended without a closing end"
    )))
}

struct FuncTranslator<'a> {
    masm: &'a mut Assembler,
    ctx: &'a ModuleCtx<'a>,
    func_idx: u32,
    blocks: BlockManager,
    /// Function-scoped locals (params first). The handle mapping never
    /// rebinds; `local.set` moves into the handle's location.
    locals: Vec<RegHandle>,
    ret: ValKind,
}

impl FuncTranslator<'_> {
    fn start_function(&mut self, sig: &FuncSig) -> Result<(), CompileError> {
        self.masm.bind(self.ctx.fn_labels[self.func_idx as usize]);
        let params: Vec<RegHandle> = sig
            .params
            .iter()
            .map(|k| self.masm.new_reg(k.width()))
            .collect();
        self.masm.begin_function(&params)?;
        self.locals = params;

        let ret_arity = sig.ret.arity() as u32;
        // Synthetic function frame: its label is the return point, its
        // stack receives the function's result values.
        let frame_label = self.masm.new_label();
        self.blocks
            .push(Block::new(BlockKind::Func, frame_label, 0, ret_arity));
        // Function body block.
        self.start_block(BlockKind::Block, 0, ret_arity);
        Ok(())
    }

    /// Declared locals start as zero.
    fn add_locals(&mut self, kinds: &[ValKind]) {
        for kind in kinds {
            let h = self.masm.new_reg(kind.width());
            self.masm.mov_imm(h, 0);
            self.locals.push(h);
        }
    }

    fn end_function(&mut self) {
        self.end_block();
        debug_assert_eq!(
            self.blocks.len(),
            1,
            "block stack not collapsed at end of function"
        );
        let frame_label = self.blocks.active().label;
        self.masm.bind(frame_label);
        if self.ret == ValKind::Void {
            self.masm.ret(None);
        } else if self.blocks.active().stack.size() >= 1 {
            let r = self.blocks.active_mut().stack.pop();
            self.masm.ret(Some(r));
        } else {
            // No path produced a value — every exit trapped or
            // returned early. Nothing reaches this point.
            self.masm.trap();
        }
        self.masm.end_function();
        self.blocks.clear();
    }

    fn emit_return(&mut self) {
        if self.ret == ValKind::Void {
            self.masm.ret(None);
        } else {
            let r = self.blocks.active_mut().stack.pop();
            self.masm.ret(Some(r));
        }
    }

    /// Block types are void or a single value kind in this subset;
    /// type-section references work as long as they add no inputs.
    fn block_arity(&self, bt: &BlockType) -> Result<(u32, u32), CompileError> {
        match bt {
            BlockType::Empty => Ok((0, 0)),
            BlockType::Value(_) => Ok((0, 1)),
            BlockType::Func(type_idx) => {
                let sig = self
                    .ctx
                    .module
                    .types
                    .get(*type_idx as usize)
                    .ok_or_else(|| {
                        CompileError::InvalidBinary(format!("block type index {type_idx}"))
                    })?;
                if !sig.params.is_empty() {
                    return Err(CompileError::Unsupported(format!(
                        "block with {} parameters in fn{}",
                        sig.params.len(),
                        self.func_idx
                    )));
                }
                Ok((0, sig.ret.arity() as u32))
            }
        }
    }

    fn start_block(&mut self, kind: BlockKind, in_arity: u32, out_arity: u32) {
        let label = self.masm.new_label();
        let mut stack = OperandStack::new();
        let parent = self.blocks.active_mut();
        stack.init_from(&mut parent.stack, in_arity as usize);
        parent.stack.freeze();
        self.blocks.push(Block {
            kind,
            label,
            in_arity,
            out_arity,
            stack,
            unreachable: false,
        });
        // A loop's label is its header: branches to this depth go
        // backwards.
        if kind == BlockKind::Loop {
            self.masm.bind(label);
        }
    }

    /// `if` opens the join block and the then-block, then branches over
    /// the then-region when the condition is zero.
    fn start_if(&mut self, bt: &BlockType) -> Result<(), CompileError> {
        let (_, out_arity) = self.block_arity(bt)?;
        let cond = self.blocks.active_mut().stack.pop();
        self.start_block(BlockKind::Block, 0, out_arity);
        self.start_block(BlockKind::IfThen, 0, out_arity);
        let skip_label = self.blocks.active().label;
        self.masm.jmp_if_zero(cond, skip_label);
        Ok(())
    }

    /// The then-region is over. Its exit behaves exactly like a `br 0`
    /// targeting the `if`: merge the results where every edge into the
    /// join deposits them — the pinned region of the block *enclosing*
    /// the join block — then jump to the join. After that, bind the
    /// else entry and continue as the else region.
    fn else_(&mut self) -> Result<(), CompileError> {
        let inner = self.blocks.pop();
        if inner.kind != BlockKind::IfThen {
            return Err(CompileError::InvalidBinary(format!(
                "else without if in fn{}",
                self.func_idx
            )));
        }
        let out = inner.out_arity as usize;
        let mut inner_stack = inner.stack;
        let reachable = !inner.unreachable;

        if reachable {
            if inner_stack.size() >= out {
                // Copies from deduplication belong to the then-path, so
                // they come before the jump.
                inner_stack.deduplicate(self.masm, &self.locals);
                self.merge_into_join_parent(&inner_stack, out);
            }
            let join = self.blocks.active().label;
            self.masm.jmp(join);
        }
        self.masm.bind(inner.label);

        let label = self.masm.new_label();
        self.blocks.push(Block {
            kind: BlockKind::IfElse,
            label,
            in_arity: inner.in_arity,
            out_arity: inner.out_arity,
            stack: OperandStack::new(),
            unreachable: false,
        });
        Ok(())
    }

    fn end_block(&mut self) {
        let child = self.blocks.pop();
        match child.kind {
            // A single wasm `end` closes both halves of an `if`. The
            // arm's fall-through merges past the join block, like the
            // then-exit in `else_`.
            BlockKind::IfThen | BlockKind::IfElse => {
                let out = child.out_arity as usize;
                let mut child_stack = child.stack;
                if !child.unreachable && child_stack.size() >= out {
                    child_stack.deduplicate(self.masm, &self.locals);
                    self.merge_into_join_parent(&child_stack, out);
                }
                self.masm.bind(child.label);
                let join = self.blocks.pop();
                self.close_block(join);
            }
            _ => self.close_block(child),
        }
    }

    /// Merge an if-arm's results into the pinned region of the block
    /// enclosing the join block (the active block here, with the arm
    /// already popped).
    fn merge_into_join_parent(&mut self, arm_stack: &OperandStack, count: usize) {
        debug_assert!(self.blocks.len() >= 2);
        let parent_idx = self.blocks.len() - 2;
        let parent = self.blocks.get_mut(parent_idx);
        parent.stack.transfer_from(self.masm, arm_stack, count);
    }

    /// Merge the block's results into its parent, unfreeze the parent,
    /// and bind the exit label (loops bound theirs at entry).
    fn close_block(&mut self, child: Block) {
        let out = child.out_arity as usize;
        let mut child_stack = child.stack;
        if !child.unreachable && child_stack.size() >= out {
            child_stack.deduplicate(self.masm, &self.locals);
            let parent = self.blocks.active_mut();
            parent.stack.transfer_from(self.masm, &child_stack, out);
        }
        // If every path into the join was dead, pad the parent with
        // fresh handles so following (equally dead) code keeps its
        // stack shape.
        loop {
            let parent = self.blocks.active_mut();
            if parent.stack.size() - parent.stack.frozen_depth() >= out {
                break;
            }
            let h = self.masm.new_reg(Width::W32);
            self.blocks.active_mut().stack.push(h);
        }
        self.blocks.active_mut().stack.unfreeze();
        if child.kind != BlockKind::Loop {
            self.masm.bind(child.label);
        }
    }

    /// Resolve a wasm-relative branch depth to a block index. The
    /// synthetic inner if-blocks are invisible to wasm depths.
    fn resolve_depth(&self, d: u32) -> Result<usize, CompileError> {
        let mut seen = 0;
        for rel in 0..self.blocks.len() {
            let b = self.blocks.relative(rel);
            match b.kind {
                BlockKind::IfThen | BlockKind::IfElse => continue,
                BlockKind::Func => break,
                _ => {}
            }
            if seen == d {
                return Ok(self.blocks.len() - 1 - rel);
            }
            seen += 1;
        }
        Err(CompileError::InvalidBinary(format!(
            "branch depth {d} out of range in fn{}",
            self.func_idx
        )))
    }

    /// Values carried by a branch: a loop header receives the loop's
    /// inputs, every other target its results.
    fn branch_arity(&self, target_idx: usize) -> usize {
        let target = self.blocks.get(target_idx);
        if target.kind == BlockKind::Loop {
            target.in_arity as usize
        } else {
            target.out_arity as usize
        }
    }

    /// Copy out aliased stack entries before a merge pins handles.
    fn dedup_active(&mut self) {
        let active = self.blocks.active_mut();
        active.stack.deduplicate(self.masm, &self.locals);
    }

    /// Deposit the branch values where the target's own exit merge will
    /// leave them — the stack of the block enclosing the target — then
    /// jump. The caller has already run deduplication.
    fn emit_branch(&mut self, target_idx: usize) {
        let arity = self.branch_arity(target_idx);
        if arity > 0 {
            debug_assert!(target_idx >= 1, "branch transfer into the frame's parent");
            let last = self.blocks.len() - 1;
            let (receiver, active) = self.blocks.two_mut(target_idx - 1, last);
            receiver
                .stack
                .transfer_from(self.masm, &active.stack, arity);
        }
        let target_label = self.blocks.get(target_idx).label;
        self.masm.jmp(target_label);
    }

    fn br(&mut self, d: u32) -> Result<(), CompileError> {
        let target_idx = self.resolve_depth(d)?;
        if self.branch_arity(target_idx) > 0 {
            self.dedup_active();
        }
        self.emit_branch(target_idx);
        Ok(())
    }

    /// Branch taken on non-zero: fall through when the condition is
    /// zero, otherwise merge and jump.
    ///
    /// The branch values stay live on both paths, so the deduplication
    /// copies are emitted before the conditional skip — they must
    /// execute no matter which way it goes.
    fn br_if(&mut self, d: u32) -> Result<(), CompileError> {
        let target_idx = self.resolve_depth(d)?;
        let cond = self.blocks.active_mut().stack.pop();
        if self.branch_arity(target_idx) > 0 {
            self.dedup_active();
        }
        let skip = self.masm.new_label();
        self.masm.jmp_if_zero(cond, skip);
        self.emit_branch(target_idx);
        self.masm.bind(skip);
        Ok(())
    }

    fn call(&mut self, f: u32) -> Result<(), CompileError> {
        let module = self.ctx.module;
        if f >= module.num_funcs() {
            return Err(CompileError::InvalidBinary(format!(
                "call to unknown fn{f} in fn{}",
                self.func_idx
            )));
        }
        let sig = module.sig_of(f).clone();
        if sig.params.len() > 6 {
            return Err(CompileError::Unsupported(format!(
                "call to fn{f} with {} register arguments in fn{}",
                sig.params.len(),
                self.func_idx
            )));
        }
        let mut args = Vec::with_capacity(sig.params.len());
        {
            let active = self.blocks.active_mut();
            for _ in 0..sig.params.len() {
                args.push(active.stack.pop());
            }
        }
        args.reverse();

        let target = if f < module.num_imports() {
            CallTarget::Ptr(self.ctx.import_ptrs[f as usize])
        } else {
            CallTarget::Label(self.ctx.fn_labels[f as usize])
        };
        let ret = match sig.ret {
            ValKind::Void => None,
            kind => Some(self.masm.new_reg(kind.width())),
        };
        self.masm.call(target, args, ret);
        if let Some(r) = ret {
            self.blocks.active_mut().stack.push(r);
        }
        Ok(())
    }

    /// Push the local's handle — an alias, no move. See the
    /// deduplication contract on `OperandStack`.
    fn local_get(&mut self, idx: u32) {
        let h = self.locals[idx as usize];
        self.blocks.active_mut().stack.push(h);
    }

    fn local_set(&mut self, idx: u32) {
        let src = self.blocks.active_mut().stack.pop();
        let local = self.locals[idx as usize];
        if src == local {
            return;
        }
        self.spill_local_aliases(local);
        self.masm.mov(local, src);
    }

    fn local_tee(&mut self, idx: u32) {
        let src = *self.blocks.active().stack.peek();
        let local = self.locals[idx as usize];
        if src == local {
            return;
        }
        self.spill_local_aliases(local);
        self.masm.mov(local, src);
    }

    /// Writing a local must not retroactively change stack entries that
    /// alias it: copy those out first.
    fn spill_local_aliases(&mut self, local: RegHandle) {
        for block in self.blocks.iter_mut() {
            for slot in block.stack.slots_mut() {
                if *slot == local {
                    let copy = self.masm.new_reg(slot.width());
                    self.masm.mov(copy, *slot);
                    *slot = copy;
                }
            }
        }
    }

    /// Globals are materialized as constant-pool loads (correct for the
    /// immutable globals this subset mutates never).
    fn global_get(&mut self, idx: u32) -> Result<(), CompileError> {
        let imported = self.ctx.module.num_imported_globals;
        if idx < imported {
            return Err(CompileError::Unsupported(format!(
                "imported global {idx} in fn{}",
                self.func_idx
            )));
        }
        let local_idx = (idx - imported) as usize;
        let global = self
            .ctx
            .module
            .globals
            .get(local_idx)
            .ok_or_else(|| {
                CompileError::InvalidBinary(format!("global index {idx} out of range"))
            })?;
        let cid = self.ctx.globals[local_idx];
        let dst = self.masm.new_reg(global.kind.width());
        self.masm.load_const(dst, cid);
        self.blocks.active_mut().stack.push(dst);
        Ok(())
    }

    fn i32_const(&mut self, v: i32) {
        let dst = self.masm.new_reg(Width::W32);
        self.masm.mov_imm(dst, v as i64);
        self.blocks.active_mut().stack.push(dst);
    }

    fn i64_const(&mut self, v: i64) {
        let dst = self.masm.new_reg(Width::W64);
        self.masm.mov_imm(dst, v);
        self.blocks.active_mut().stack.push(dst);
    }

    /// The static memarg offset is folded into the embedded base, so
    /// the emitted address is `(mem_base + offset) + popped`.
    fn i32_load(&mut self, offset: u64) {
        let index = self.blocks.active_mut().stack.pop();
        let base = self.masm.new_reg(Width::W64);
        self.masm
            .mov_imm(base, (self.ctx.mem_base + offset) as i64);
        let dst = self.masm.new_reg(Width::W32);
        self.masm.load(dst, base, index);
        self.blocks.active_mut().stack.push(dst);
    }

    fn i32_store(&mut self, offset: u64) {
        let value = self.blocks.active_mut().stack.pop();
        let index = self.blocks.active_mut().stack.pop();
        let base = self.masm.new_reg(Width::W64);
        self.masm
            .mov_imm(base, (self.ctx.mem_base + offset) as i64);
        self.masm.store(base, index, value);
    }

    fn add(&mut self) {
        let (rhs, lhs) = self.pop2();
        let dst = self.masm.new_reg(Width::W32);
        self.masm.add(dst, lhs, rhs);
        self.blocks.active_mut().stack.push(dst);
    }

    fn alu(&mut self, op: AluOp) {
        let (rhs, lhs) = self.pop2();
        let dst = self.masm.new_reg(Width::W32);
        self.masm.alu(op, dst, lhs, rhs);
        self.blocks.active_mut().stack.push(dst);
    }

    fn cmp(&mut self, cc: Cc) {
        let (rhs, lhs) = self.pop2();
        let dst = self.masm.new_reg(Width::W32);
        self.masm.cmp_set(cc, dst, lhs, rhs);
        self.blocks.active_mut().stack.push(dst);
    }

    fn i32_eqz(&mut self) {
        let lhs = self.blocks.active_mut().stack.pop();
        let zero = self.masm.new_reg(Width::W32);
        self.masm.mov_imm(zero, 0);
        let dst = self.masm.new_reg(Width::W32);
        self.masm.cmp_set(Cc::Eq, dst, lhs, zero);
        self.blocks.active_mut().stack.push(dst);
    }

    fn pop2(&mut self) -> (RegHandle, RegHandle) {
        let active = self.blocks.active_mut();
        let rhs = active.stack.pop();
        let lhs = active.stack.pop();
        (rhs, lhs)
    }
}
