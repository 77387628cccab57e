//! JIT compilation driver.
//!
//! Pre-allocates one label per function (imports included) so bodies
//! can call later-indexed functions, translates every body in source
//! order, then finalizes the assembler into an executable image and
//! hands out entry pointers computed from label offsets.

use std::collections::HashMap;

use wasmjit_codegen::lower::CodeImage;
use wasmjit_codegen::masm::{Assembler, ConstId, Label};

use crate::error::CompileError;
use crate::linker::Linker;
use crate::memory::LinearMemory;
use crate::module::Module;
use crate::parse::FuncSig;
use crate::translate;
use crate::value::{Val, ValKind};

/// Module-wide context threaded through body translation.
pub(crate) struct ModuleCtx<'a> {
    pub(crate) module: &'a Module,
    pub(crate) fn_labels: &'a [Label],
    pub(crate) import_ptrs: &'a [usize],
    pub(crate) globals: &'a [ConstId],
    /// Host base address of linear memory (0 when the module has none).
    pub(crate) mem_base: u64,
}

/// Builder for JIT compilation.
///
/// # Examples
///
/// ```ignore
/// let compiled = JitCompiler::new(&module).compile()?;
/// let ret = compiled.call("main", &[])?;
/// ```
pub struct JitCompiler<'a> {
    module: &'a Module,
    linker: Option<&'a Linker>,
}

impl<'a> JitCompiler<'a> {
    pub fn new(module: &'a Module) -> Self {
        JitCompiler {
            module,
            linker: None,
        }
    }

    /// Provide the host import registry.
    pub fn linker(mut self, linker: &'a Linker) -> Self {
        self.linker = Some(linker);
        self
    }

    /// Compile all functions and finalize the executable image.
    pub fn compile(self) -> Result<CompiledModule, CompileError> {
        let module = self.module;
        let (masm, fn_labels, memory) = self.build()?;
        let image = masm.finalize()?;
        log::debug!(
            "compiled {} functions into {} bytes",
            module.funcs.len(),
            image.len()
        );
        let sigs = (0..module.num_funcs())
            .map(|i| module.sig_of(i).clone())
            .collect();
        Ok(CompiledModule {
            image,
            fn_labels,
            memory,
            exports: module.exports.clone(),
            sigs,
        })
    }

    /// Render the recorded virtual-register program without finalizing
    /// (the CLI inspect pipeline).
    pub fn render(self) -> Result<String, CompileError> {
        let (masm, _, _) = self.build()?;
        Ok(masm.to_string())
    }

    fn build(&self) -> Result<(Assembler, Vec<Label>, Option<LinearMemory>), CompileError> {
        let module = self.module;
        let mut masm = Assembler::new();

        // Linear memory is mapped before translation: its base address
        // is an immediate in every load and store.
        let memory = match module.memory_pages {
            Some(pages) => Some(LinearMemory::new(pages.max(1))?),
            None => None,
        };
        let mem_base = memory.as_ref().map(|m| m.base() as u64).unwrap_or(0);

        // Globals live in the image's constant pool.
        let globals: Vec<ConstId> = module
            .globals
            .iter()
            .map(|g| masm.add_const(g.value))
            .collect();

        // One forward label per function, imports included.
        let fn_labels: Vec<Label> = (0..module.num_funcs()).map(|_| masm.new_label()).collect();

        let import_ptrs = self.resolve_imports()?;

        let ctx = ModuleCtx {
            module,
            fn_labels: &fn_labels,
            import_ptrs: &import_ptrs,
            globals: &globals,
            mem_base,
        };
        for i in 0..module.funcs.len() {
            translate::translate_func(&mut masm, &ctx, i as u32)?;
        }
        Ok((masm, fn_labels, memory))
    }

    fn resolve_imports(&self) -> Result<Vec<usize>, CompileError> {
        self.module
            .imports
            .iter()
            .map(|imp| {
                self.linker
                    .and_then(|l| l.resolve(&imp.module, &imp.field))
                    .ok_or_else(|| {
                        CompileError::Type(format!(
                            "unresolved import {}.{}",
                            imp.module, imp.field
                        ))
                    })
            })
            .collect()
    }
}

/// A compiled module: executable image, entry lookup, and the linear
/// memory it addresses.
///
/// The image is read-only and executable from finalize on; entries may
/// be invoked from any thread.
#[derive(Debug)]
pub struct CompiledModule {
    image: CodeImage,
    fn_labels: Vec<Label>,
    memory: Option<LinearMemory>,
    exports: HashMap<String, u32>,
    sigs: Vec<FuncSig>,
}

impl CompiledModule {
    /// Raw entry pointer of a function: image base + label offset.
    pub fn entry_ptr(&self, func_idx: u32) -> *const u8 {
        self.image.entry_of(self.fn_labels[func_idx as usize])
    }

    /// Typed entry pointer.
    ///
    /// # Safety
    ///
    /// `F` must be an `extern "C"` function pointer type matching the
    /// function's signature.
    pub unsafe fn entry<F: Copy>(&self, func_idx: u32) -> F {
        assert_eq!(
            std::mem::size_of::<F>(),
            std::mem::size_of::<*const u8>(),
            "entry::<F> requires a function pointer type"
        );
        let ptr = self.entry_ptr(func_idx);
        unsafe { std::mem::transmute_copy(&ptr) }
    }

    pub fn export_index(&self, name: &str) -> Option<u32> {
        self.exports.get(name).copied()
    }

    /// Invoke an exported function with dynamically-typed arguments.
    pub fn call(&self, name: &str, args: &[Val]) -> Result<Option<Val>, CompileError> {
        let func_idx = self
            .export_index(name)
            .ok_or_else(|| CompileError::Type(format!("export {name} not found")))?;
        let sig = &self.sigs[func_idx as usize];
        if args.len() != sig.params.len() {
            return Err(CompileError::Type(format!(
                "{name} expects {} arguments, got {}",
                sig.params.len(),
                args.len()
            )));
        }
        for (i, (arg, param)) in args.iter().zip(&sig.params).enumerate() {
            if arg.kind() != *param {
                return Err(CompileError::Type(format!(
                    "argument {i} of {name}: expected {param}, got {}",
                    arg.kind()
                )));
            }
        }
        if matches!(sig.ret, ValKind::F32 | ValKind::F64) {
            return Err(CompileError::Unsupported(format!(
                "float result of {name} via dynamic call"
            )));
        }

        let raw: Vec<u64> = args.iter().map(|a| a.to_raw()).collect();
        let ptr = self.entry_ptr(func_idx);
        let ret = unsafe { dispatch(ptr, &raw)? };
        Ok(Val::from_raw(sig.ret, ret))
    }

    pub fn memory(&self) -> Option<&LinearMemory> {
        self.memory.as_ref()
    }

    pub fn memory_mut(&mut self) -> Option<&mut LinearMemory> {
        self.memory.as_mut()
    }
}

/// Enter compiled code with raw System V integer arguments. Results of
/// 32-bit kinds are truncated by the caller; the upper rax bits are
/// unspecified then.
unsafe fn dispatch(ptr: *const u8, args: &[u64]) -> Result<u64, CompileError> {
    use std::mem::transmute;
    type F0 = unsafe extern "C" fn() -> u64;
    type F1 = unsafe extern "C" fn(u64) -> u64;
    type F2 = unsafe extern "C" fn(u64, u64) -> u64;
    type F3 = unsafe extern "C" fn(u64, u64, u64) -> u64;
    type F4 = unsafe extern "C" fn(u64, u64, u64, u64) -> u64;
    type F5 = unsafe extern "C" fn(u64, u64, u64, u64, u64) -> u64;
    type F6 = unsafe extern "C" fn(u64, u64, u64, u64, u64, u64) -> u64;

    unsafe {
        Ok(match *args {
            [] => transmute::<*const u8, F0>(ptr)(),
            [a] => transmute::<*const u8, F1>(ptr)(a),
            [a, b] => transmute::<*const u8, F2>(ptr)(a, b),
            [a, b, c] => transmute::<*const u8, F3>(ptr)(a, b, c),
            [a, b, c, d] => transmute::<*const u8, F4>(ptr)(a, b, c, d),
            [a, b, c, d, e] => transmute::<*const u8, F5>(ptr)(a, b, c, d, e),
            [a, b, c, d, e, f] => transmute::<*const u8, F6>(ptr)(a, b, c, d, e, f),
            _ => {
                return Err(CompileError::Unsupported(format!(
                    "{} arguments via dynamic call",
                    args.len()
                )));
            }
        })
    }
}
