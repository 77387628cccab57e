mod engine;
mod error;
mod jit;
mod linker;
mod memory;
mod module;
mod parse;
mod translate;
mod value;

pub use engine::Engine;
pub use error::CompileError;
pub use jit::{CompiledModule, JitCompiler};
pub use linker::Linker;
pub use memory::LinearMemory;
pub use module::Module;
pub use value::{Val, ValKind};
