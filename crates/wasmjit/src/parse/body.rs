use wasmparser::{FunctionBody, Operator};

use crate::error::CompileError;
use crate::value::ValKind;

/// Block type of a `block`/`loop`/`if`: void, a single value kind, or a
/// reference into the type section.
#[derive(Debug, Clone, Copy, PartialEq)]
pub(crate) enum BlockType {
    Empty,
    Value(ValKind),
    Func(u32),
}

/// One pre-decoded instruction of the supported subset.
///
/// `Unsupported` carries the opcode name so the translator can surface
/// it together with the function index.
#[derive(Debug, Clone)]
pub(crate) enum Op {
    Unreachable,
    Nop,

    Block(BlockType),
    Loop(BlockType),
    If(BlockType),
    Else,
    End,
    Br(u32),
    BrIf(u32),
    Return,
    Call(u32),

    Drop,
    LocalGet(u32),
    LocalSet(u32),
    LocalTee(u32),
    GlobalGet(u32),

    I32Load { offset: u64 },
    I32Store { offset: u64 },

    I32Const(i32),
    I64Const(i64),

    I32Eqz,
    I32Eq,
    I32Ne,
    I32LtS,
    I32LtU,
    I32GtS,
    I32GtU,
    I32LeS,
    I32LeU,
    I32GeS,
    I32GeU,

    I32Add,
    I32Sub,
    I32Mul,
    I32And,
    I32Or,
    I32Xor,

    Unsupported(String),
}

/// A parsed function body, pre-decoded from raw wasm bytes.
///
/// The translator streams this list one opcode at a time in source
/// order; the raw bytes are never revisited.
#[derive(Debug, Clone, Default)]
pub(crate) struct ParsedBody {
    pub(crate) ops: Vec<Op>,
}

impl ParsedBody {
    /// Pre-decode a body's operators.
    pub(crate) fn parse(body: &FunctionBody) -> Result<Self, CompileError> {
        let mut ops = Vec::new();
        let reader = body
            .get_operators_reader()
            .map_err(|e| CompileError::InvalidBinary(e.to_string()))?;
        for op in reader {
            let op = op.map_err(|e| CompileError::InvalidBinary(e.to_string()))?;
            ops.push(convert(op)?);
        }
        Ok(ParsedBody { ops })
    }
}

fn block_type(bt: wasmparser::BlockType) -> Result<BlockType, CompileError> {
    match bt {
        wasmparser::BlockType::Empty => Ok(BlockType::Empty),
        wasmparser::BlockType::Type(ty) => Ok(BlockType::Value(ValKind::from_valtype(ty)?)),
        wasmparser::BlockType::FuncType(idx) => Ok(BlockType::Func(idx)),
    }
}

fn convert(op: Operator) -> Result<Op, CompileError> {
    Ok(match op {
        Operator::Unreachable => Op::Unreachable,
        Operator::Nop => Op::Nop,

        Operator::Block { blockty } => Op::Block(block_type(blockty)?),
        Operator::Loop { blockty } => Op::Loop(block_type(blockty)?),
        Operator::If { blockty } => Op::If(block_type(blockty)?),
        Operator::Else => Op::Else,
        Operator::End => Op::End,
        Operator::Br { relative_depth } => Op::Br(relative_depth),
        Operator::BrIf { relative_depth } => Op::BrIf(relative_depth),
        Operator::Return => Op::Return,
        Operator::Call { function_index } => Op::Call(function_index),

        Operator::Drop => Op::Drop,
        Operator::LocalGet { local_index } => Op::LocalGet(local_index),
        Operator::LocalSet { local_index } => Op::LocalSet(local_index),
        Operator::LocalTee { local_index } => Op::LocalTee(local_index),
        Operator::GlobalGet { global_index } => Op::GlobalGet(global_index),

        // The static memarg offset folds into the embedded base address.
        Operator::I32Load { memarg } => Op::I32Load {
            offset: memarg.offset,
        },
        Operator::I32Store { memarg } => Op::I32Store {
            offset: memarg.offset,
        },

        Operator::I32Const { value } => Op::I32Const(value),
        Operator::I64Const { value } => Op::I64Const(value),

        Operator::I32Eqz => Op::I32Eqz,
        Operator::I32Eq => Op::I32Eq,
        Operator::I32Ne => Op::I32Ne,
        Operator::I32LtS => Op::I32LtS,
        Operator::I32LtU => Op::I32LtU,
        Operator::I32GtS => Op::I32GtS,
        Operator::I32GtU => Op::I32GtU,
        Operator::I32LeS => Op::I32LeS,
        Operator::I32LeU => Op::I32LeU,
        Operator::I32GeS => Op::I32GeS,
        Operator::I32GeU => Op::I32GeU,

        Operator::I32Add => Op::I32Add,
        Operator::I32Sub => Op::I32Sub,
        Operator::I32Mul => Op::I32Mul,
        Operator::I32And => Op::I32And,
        Operator::I32Or => Op::I32Or,
        Operator::I32Xor => Op::I32Xor,

        other => Op::Unsupported(op_name(&other)),
    })
}

/// Opcode name for diagnostics: the variant name of the operator.
fn op_name(op: &Operator) -> String {
    let dbg = format!("{op:?}");
    dbg.split([' ', '{'])
        .next()
        .unwrap_or("unknown")
        .to_string()
}
