use thiserror::Error;

use wasmjit_codegen::CodegenError;

/// Errors surfaced by the compile entry points.
///
/// Each variant is a stable kind; the message carries the function
/// index and opcode name where one applies. Internal invariant
/// violations (operand-stack underflow, a label bound twice) are bugs
/// and panic with diagnostic context instead of returning one of these.
#[derive(Debug, Error)]
pub enum CompileError {
    /// Magic/version/section framing problems, or a body the decoder
    /// rejects.
    #[error("invalid wasm binary: {0}")]
    InvalidBinary(String),
    /// The module uses something outside this subset.
    #[error("unsupported: {0}")]
    Unsupported(String),
    /// Signature mismatch at a call site or an unresolved import.
    #[error("type error: {0}")]
    Type(String),
    /// The back end refused an emission.
    #[error("codegen failed: {0}")]
    Codegen(String),
    #[error("out of memory: {0}")]
    OutOfMemory(String),
}

impl From<CodegenError> for CompileError {
    fn from(e: CodegenError) -> Self {
        match e {
            CodegenError::OutOfMemory(msg) => CompileError::OutOfMemory(msg),
            other => CompileError::Codegen(other.to_string()),
        }
    }
}
