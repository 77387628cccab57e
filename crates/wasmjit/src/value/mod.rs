use wasmjit_codegen::masm::Width;

use crate::error::CompileError;

/// Wasm value kinds supported by the subset, plus `Void` for absent
/// results.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValKind {
    I32,
    I64,
    F32,
    F64,
    Void,
}

impl ValKind {
    /// Back-end register class for this kind.
    ///
    /// Float kinds route through the integer class of matching width;
    /// a real float path would use xmm registers and distinct emits.
    pub(crate) fn width(self) -> Width {
        match self {
            ValKind::I32 | ValKind::F32 => Width::W32,
            ValKind::I64 | ValKind::F64 => Width::W64,
            ValKind::Void => panic!("void has no register class"),
        }
    }

    /// Number of stack values this kind occupies (0 or 1).
    pub(crate) fn arity(self) -> usize {
        if self == ValKind::Void { 0 } else { 1 }
    }

    pub(crate) fn from_valtype(ty: wasmparser::ValType) -> Result<Self, CompileError> {
        match ty {
            wasmparser::ValType::I32 => Ok(ValKind::I32),
            wasmparser::ValType::I64 => Ok(ValKind::I64),
            wasmparser::ValType::F32 => Ok(ValKind::F32),
            wasmparser::ValType::F64 => Ok(ValKind::F64),
            other => Err(CompileError::Unsupported(format!("value type {other:?}"))),
        }
    }
}

impl std::fmt::Display for ValKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ValKind::I32 => "i32",
            ValKind::I64 => "i64",
            ValKind::F32 => "f32",
            ValKind::F64 => "f64",
            ValKind::Void => "void",
        };
        f.write_str(s)
    }
}

/// Dynamic value for untyped calls through [`crate::CompiledModule::call`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Val {
    I32(i32),
    I64(i64),
}

impl Val {
    pub(crate) fn kind(self) -> ValKind {
        match self {
            Val::I32(_) => ValKind::I32,
            Val::I64(_) => ValKind::I64,
        }
    }

    /// Raw ABI representation (what lands in an argument register).
    pub(crate) fn to_raw(self) -> u64 {
        match self {
            Val::I32(v) => v as u32 as u64,
            Val::I64(v) => v as u64,
        }
    }

    /// Reconstruct a result value of the given kind from raw rax bits.
    pub(crate) fn from_raw(kind: ValKind, raw: u64) -> Option<Val> {
        match kind {
            ValKind::I32 => Some(Val::I32(raw as u32 as i32)),
            ValKind::I64 => Some(Val::I64(raw as i64)),
            _ => None,
        }
    }

    pub fn unwrap_i32(self) -> i32 {
        match self {
            Val::I32(v) => v,
            other => panic!("expected i32, got {other:?}"),
        }
    }

    pub fn unwrap_i64(self) -> i64 {
        match self {
            Val::I64(v) => v,
            other => panic!("expected i64, got {other:?}"),
        }
    }
}
