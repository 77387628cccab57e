pub mod code_buffer;
pub mod encode;
pub mod lower;
pub mod masm;
pub mod regalloc;

use thiserror::Error;

/// Errors surfaced by the back end to the compiler driving it.
///
/// Internal invariant violations (unbound labels, operand mismatches)
/// are bugs and panic with context instead of returning an error.
#[derive(Debug, Error)]
pub enum CodegenError {
    #[error("out of memory: {0}")]
    OutOfMemory(String),
    #[error("too many parameters: {0} (at most 6 register arguments)")]
    TooManyParams(usize),
}
