use std::collections::HashMap;
use std::fmt::Write as _;

use crate::engine::Engine;
use crate::error::CompileError;
use crate::parse::{self, FuncSig, GlobalInit, ImportedFunc, ParsedFunction};

/// A parsed WASM module (immutable).
///
/// Function indices follow the wasm convention: imports first, then
/// defined functions.
#[derive(Debug)]
pub struct Module {
    pub(crate) types: Vec<FuncSig>,
    pub(crate) imports: Vec<ImportedFunc>,
    pub(crate) funcs: Vec<ParsedFunction>,
    pub(crate) globals: Vec<GlobalInit>,
    pub(crate) num_imported_globals: u32,
    pub(crate) memory_pages: Option<u64>,
    pub(crate) exports: HashMap<String, u32>,
}

impl Module {
    /// Parse a WAT string into a module.
    pub fn new(engine: &Engine, wat: &str) -> Result<Self, CompileError> {
        let bytes =
            wat::parse_str(wat).map_err(|e| CompileError::InvalidBinary(e.to_string()))?;
        Self::from_bytes(engine, &bytes)
    }

    /// Create a module from raw WASM bytes.
    pub fn from_bytes(engine: &Engine, bytes: &[u8]) -> Result<Self, CompileError> {
        let parsed = parse::parse(engine, bytes)?;
        Ok(Module {
            types: parsed.types,
            imports: parsed.imports,
            funcs: parsed.funcs,
            globals: parsed.globals,
            num_imported_globals: parsed.num_imported_globals,
            memory_pages: parsed.memory_pages,
            exports: parsed.exports,
        })
    }

    /// Number of imported functions.
    pub(crate) fn num_imports(&self) -> u32 {
        self.imports.len() as u32
    }

    /// Total function count (imports + defined).
    pub(crate) fn num_funcs(&self) -> u32 {
        (self.imports.len() + self.funcs.len()) as u32
    }

    /// Signature of a function by module-wide index.
    pub(crate) fn sig_of(&self, func_idx: u32) -> &FuncSig {
        let type_idx = if func_idx < self.num_imports() {
            self.imports[func_idx as usize].type_idx
        } else {
            self.funcs[(func_idx - self.num_imports()) as usize].type_idx
        };
        &self.types[type_idx as usize]
    }

    /// Function index of a named export.
    pub fn export_index(&self, name: &str) -> Option<u32> {
        self.exports.get(name).copied()
    }

    /// Human-readable module summary (for the CLI inspect pipeline).
    pub fn dump(&self) -> String {
        let mut out = String::new();
        for (i, imp) in self.imports.iter().enumerate() {
            let sig = &self.types[imp.type_idx as usize];
            let _ = writeln!(
                out,
                "import fn{}: {}.{} {}",
                i,
                imp.module,
                imp.field,
                render_sig(sig)
            );
        }
        for (i, func) in self.funcs.iter().enumerate() {
            let idx = self.num_imports() as usize + i;
            let sig = &self.types[func.type_idx as usize];
            let _ = writeln!(
                out,
                "fn{}: {} — {} locals, {} ops",
                idx,
                render_sig(sig),
                func.locals.len(),
                func.body.ops.len()
            );
        }
        for (i, g) in self.globals.iter().enumerate() {
            let idx = self.num_imported_globals as usize + i;
            let m = if g.mutable { "mut " } else { "" };
            let _ = writeln!(out, "global{}: {}{} = {}", idx, m, g.kind, g.value);
        }
        if let Some(pages) = self.memory_pages {
            let _ = writeln!(out, "memory: {pages} pages");
        }
        let mut exports: Vec<_> = self.exports.iter().collect();
        exports.sort();
        for (name, idx) in exports {
            let _ = writeln!(out, "export \"{name}\" = fn{idx}");
        }
        out
    }
}

fn render_sig(sig: &FuncSig) -> String {
    let params: Vec<String> = sig.params.iter().map(|p| p.to_string()).collect();
    format!("({}) -> {}", params.join(", "), sig.ret)
}
