//! Recording assembler.
//!
//! The front end requests virtual registers and labels, records
//! instructions against them, and calls `finalize()` once every function
//! has been emitted. Register assignment and byte encoding happen at
//! finalize time (regalloc.rs / lower.rs) — until then the program is a
//! flat instruction list over handles, split into per-function regions
//! by `begin_function` / `end_function` markers.

use crate::CodegenError;
use crate::lower::{self, CodeImage};

/// Operand width of a virtual register.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Width {
    W32,
    W64,
}

/// An opaque identity for a virtual register.
///
/// Handles are freely copyable references to a single underlying
/// location; two handles with the same id alias that location. Equality
/// is by id.
#[derive(Debug, Clone, Copy)]
pub struct RegHandle {
    id: u32,
    width: Width,
}

impl PartialEq for RegHandle {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for RegHandle {}

impl RegHandle {
    pub fn id(self) -> u32 {
        self.id
    }

    pub fn width(self) -> Width {
        self.width
    }
}

/// An unresolved code address, bound to a concrete offset during
/// encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Label(pub u32);

/// Index of an entry in the image's constant pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConstId(pub u32);

/// Comparison conditions producing a 0/1 result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cc {
    Eq,
    Ne,
    LtS,
    LtU,
    GtS,
    GtU,
    LeS,
    LeU,
    GeS,
    GeU,
}

/// Two-operand ALU operations (`i32.add` gets its own three-operand
/// lea-based instruction instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AluOp {
    Sub,
    Mul,
    And,
    Or,
    Xor,
}

/// Call destination: an intra-module label or a raw host function
/// pointer.
#[derive(Debug, Clone, Copy)]
pub enum CallTarget {
    Label(Label),
    Ptr(usize),
}

/// A recorded virtual-register instruction.
#[derive(Debug, Clone)]
pub(crate) enum Inst {
    /// Start of a function region. Parameters arrive in the System V
    /// argument registers and are moved to their homes by the prologue.
    FuncBegin { params: Vec<RegHandle> },
    /// End of a function region.
    FuncEnd,
    /// Bind a label to the current position.
    Bind { label: Label },
    /// `dst := imm`.
    MovImm { dst: RegHandle, val: i64 },
    /// `dst := src`.
    Mov { dst: RegHandle, src: RegHandle },
    /// Three-operand add: `dst := lhs + rhs` (lea form when dst and lhs
    /// land in different registers).
    Add {
        dst: RegHandle,
        lhs: RegHandle,
        rhs: RegHandle,
    },
    /// `dst := lhs op rhs`.
    Alu {
        op: AluOp,
        dst: RegHandle,
        lhs: RegHandle,
        rhs: RegHandle,
    },
    /// `dst := (lhs cc rhs) ? 1 : 0` — cmp, setcc on a scratch byte,
    /// zero-extend into dst.
    CmpSet {
        cc: Cc,
        dst: RegHandle,
        lhs: RegHandle,
        rhs: RegHandle,
    },
    /// 32-bit load: `dst := [base + index]`.
    Load {
        dst: RegHandle,
        base: RegHandle,
        index: RegHandle,
    },
    /// 32-bit store: `[base + index] := src`.
    Store {
        base: RegHandle,
        index: RegHandle,
        src: RegHandle,
    },
    /// RIP-relative load from the constant pool.
    LoadConst { dst: RegHandle, cid: ConstId },
    /// Unconditional jump.
    Jmp { target: Label },
    /// `test cond, cond; jz target`.
    JmpIfZero { cond: RegHandle, target: Label },
    /// Call with register-passed arguments; single optional result.
    Call {
        target: CallTarget,
        args: Vec<RegHandle>,
        ret: Option<RegHandle>,
    },
    /// Return (expands to the function epilogue).
    Ret { val: Option<RegHandle> },
    /// `ud2`.
    Trap,
}

impl Inst {
    /// Visit every handle mentioned by this instruction.
    pub(crate) fn for_each_reg(&self, mut f: impl FnMut(RegHandle)) {
        match self {
            Inst::FuncBegin { params } => params.iter().copied().for_each(&mut f),
            Inst::FuncEnd | Inst::Bind { .. } | Inst::Jmp { .. } | Inst::Trap => {}
            Inst::MovImm { dst, .. } => f(*dst),
            Inst::Mov { dst, src } => {
                f(*dst);
                f(*src);
            }
            Inst::Add { dst, lhs, rhs }
            | Inst::Alu { dst, lhs, rhs, .. }
            | Inst::CmpSet { dst, lhs, rhs, .. } => {
                f(*dst);
                f(*lhs);
                f(*rhs);
            }
            Inst::Load { dst, base, index } => {
                f(*dst);
                f(*base);
                f(*index);
            }
            Inst::Store { base, index, src } => {
                f(*base);
                f(*index);
                f(*src);
            }
            Inst::LoadConst { dst, .. } => f(*dst),
            Inst::JmpIfZero { cond, .. } => f(*cond),
            Inst::Call { args, ret, .. } => {
                args.iter().copied().for_each(&mut f);
                if let Some(r) = ret {
                    f(*r);
                }
            }
            Inst::Ret { val } => {
                if let Some(v) = val {
                    f(*v);
                }
            }
        }
    }
}

/// The recording assembler.
pub struct Assembler {
    pub(crate) insts: Vec<Inst>,
    /// Width of each issued handle, indexed by id.
    pub(crate) widths: Vec<Width>,
    /// Bound position (instruction index) of each label.
    pub(crate) label_inst: Vec<Option<usize>>,
    /// Constant pool contents (8 bytes per entry in the image).
    pub(crate) consts: Vec<i64>,
    /// Whether a function region is currently open.
    in_function: bool,
}

impl Assembler {
    pub fn new() -> Self {
        Assembler {
            insts: Vec::with_capacity(256),
            widths: Vec::new(),
            label_inst: Vec::new(),
            consts: Vec::new(),
            in_function: false,
        }
    }

    /// Request a fresh virtual register of the given width.
    pub fn new_reg(&mut self, width: Width) -> RegHandle {
        let id = self.widths.len() as u32;
        self.widths.push(width);
        RegHandle { id, width }
    }

    /// Allocate a forward-referenceable label.
    pub fn new_label(&mut self) -> Label {
        let l = Label(self.label_inst.len() as u32);
        self.label_inst.push(None);
        l
    }

    /// Bind a label to the current position. A label is bound at most
    /// once.
    pub fn bind(&mut self, label: Label) {
        let slot = &mut self.label_inst[label.0 as usize];
        assert!(slot.is_none(), "label L{} bound twice", label.0);
        *slot = Some(self.insts.len());
        self.insts.push(Inst::Bind { label });
    }

    pub fn is_bound(&self, label: Label) -> bool {
        self.label_inst[label.0 as usize].is_some()
    }

    /// Append a value to the constant pool, returning its id.
    pub fn add_const(&mut self, val: i64) -> ConstId {
        let id = ConstId(self.consts.len() as u32);
        self.consts.push(val);
        id
    }

    /// Open a function region. Parameters are bound to the calling
    /// convention's argument registers by the prologue.
    pub fn begin_function(&mut self, params: &[RegHandle]) -> Result<(), CodegenError> {
        assert!(!self.in_function, "begin_function inside an open function");
        if params.len() > crate::encode::ARG_REGS.len() {
            return Err(CodegenError::TooManyParams(params.len()));
        }
        self.in_function = true;
        self.insts.push(Inst::FuncBegin {
            params: params.to_vec(),
        });
        Ok(())
    }

    /// Close the current function region.
    pub fn end_function(&mut self) {
        assert!(self.in_function, "end_function outside a function");
        self.in_function = false;
        self.insts.push(Inst::FuncEnd);
    }

    pub fn mov_imm(&mut self, dst: RegHandle, val: i64) {
        self.insts.push(Inst::MovImm { dst, val });
    }

    pub fn mov(&mut self, dst: RegHandle, src: RegHandle) {
        self.insts.push(Inst::Mov { dst, src });
    }

    pub fn add(&mut self, dst: RegHandle, lhs: RegHandle, rhs: RegHandle) {
        self.insts.push(Inst::Add { dst, lhs, rhs });
    }

    pub fn alu(&mut self, op: AluOp, dst: RegHandle, lhs: RegHandle, rhs: RegHandle) {
        self.insts.push(Inst::Alu { op, dst, lhs, rhs });
    }

    pub fn cmp_set(&mut self, cc: Cc, dst: RegHandle, lhs: RegHandle, rhs: RegHandle) {
        self.insts.push(Inst::CmpSet { cc, dst, lhs, rhs });
    }

    pub fn load(&mut self, dst: RegHandle, base: RegHandle, index: RegHandle) {
        self.insts.push(Inst::Load { dst, base, index });
    }

    pub fn store(&mut self, base: RegHandle, index: RegHandle, src: RegHandle) {
        self.insts.push(Inst::Store { base, index, src });
    }

    pub fn load_const(&mut self, dst: RegHandle, cid: ConstId) {
        self.insts.push(Inst::LoadConst { dst, cid });
    }

    pub fn jmp(&mut self, target: Label) {
        self.insts.push(Inst::Jmp { target });
    }

    pub fn jmp_if_zero(&mut self, cond: RegHandle, target: Label) {
        self.insts.push(Inst::JmpIfZero { cond, target });
    }

    pub fn call(&mut self, target: CallTarget, args: Vec<RegHandle>, ret: Option<RegHandle>) {
        self.insts.push(Inst::Call { target, args, ret });
    }

    pub fn ret(&mut self, val: Option<RegHandle>) {
        self.insts.push(Inst::Ret { val });
    }

    pub fn trap(&mut self) {
        self.insts.push(Inst::Trap);
    }

    pub(crate) fn num_labels(&self) -> usize {
        self.label_inst.len()
    }

    /// Number of handles issued so far.
    pub fn num_regs(&self) -> usize {
        self.widths.len()
    }

    /// Assign registers, encode, and produce the executable image.
    pub fn finalize(self) -> Result<CodeImage, CodegenError> {
        assert!(!self.in_function, "finalize with an open function");
        lower::finalize(self)
    }
}

impl Default for Assembler {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for RegHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.width {
            Width::W32 => write!(f, "v{}", self.id),
            Width::W64 => write!(f, "v{}q", self.id),
        }
    }
}

impl std::fmt::Display for Label {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "L{}", self.0)
    }
}

impl std::fmt::Display for Cc {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Cc::Eq => "eq",
            Cc::Ne => "ne",
            Cc::LtS => "lt_s",
            Cc::LtU => "lt_u",
            Cc::GtS => "gt_s",
            Cc::GtU => "gt_u",
            Cc::LeS => "le_s",
            Cc::LeU => "le_u",
            Cc::GeS => "ge_s",
            Cc::GeU => "ge_u",
        };
        f.write_str(s)
    }
}

// Rendering of the recorded program, one instruction per line — used by
// the CLI inspect pipeline and by tests that assert on emitted moves.
impl std::fmt::Display for Inst {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Inst::FuncBegin { params } => {
                write!(f, "func(")?;
                for (i, p) in params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{p}")?;
                }
                write!(f, "):")
            }
            Inst::FuncEnd => write!(f, "endfunc"),
            Inst::Bind { label } => write!(f, "{label}:"),
            Inst::MovImm { dst, val } => write!(f, "  {dst} = {val}"),
            Inst::Mov { dst, src } => write!(f, "  {dst} = {src}"),
            Inst::Add { dst, lhs, rhs } => write!(f, "  {dst} = add {lhs}, {rhs}"),
            Inst::Alu { op, dst, lhs, rhs } => {
                let name = match op {
                    AluOp::Sub => "sub",
                    AluOp::Mul => "mul",
                    AluOp::And => "and",
                    AluOp::Or => "or",
                    AluOp::Xor => "xor",
                };
                write!(f, "  {dst} = {name} {lhs}, {rhs}")
            }
            Inst::CmpSet { cc, dst, lhs, rhs } => {
                write!(f, "  {dst} = cmp.{cc} {lhs}, {rhs}")
            }
            Inst::Load { dst, base, index } => write!(f, "  {dst} = [{base} + {index}]"),
            Inst::Store { base, index, src } => write!(f, "  [{base} + {index}] = {src}"),
            Inst::LoadConst { dst, cid } => write!(f, "  {dst} = pool[{}]", cid.0),
            Inst::Jmp { target } => write!(f, "  jmp {target}"),
            Inst::JmpIfZero { cond, target } => write!(f, "  jz {cond}, {target}"),
            Inst::Call { target, args, ret } => {
                write!(f, "  ")?;
                if let Some(r) = ret {
                    write!(f, "{r} = ")?;
                }
                match target {
                    CallTarget::Label(l) => write!(f, "call {l}(")?,
                    CallTarget::Ptr(p) => write!(f, "call {p:#x}(")?,
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{a}")?;
                }
                write!(f, ")")
            }
            Inst::Ret { val } => match val {
                Some(v) => write!(f, "  ret {v}"),
                None => write!(f, "  ret"),
            },
            Inst::Trap => write!(f, "  trap"),
        }
    }
}

impl std::fmt::Display for Assembler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for inst in &self.insts {
            writeln!(f, "{inst}")?;
        }
        Ok(())
    }
}
