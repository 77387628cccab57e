pub(crate) mod body;

use std::collections::HashMap;

use wasmparser::{
    BinaryReaderError, Export, ExternalKind, FunctionBody, Global, Import, Operator, Parser,
    Payload, TypeRef,
};

use crate::engine::Engine;
use crate::error::CompileError;
use crate::value::ValKind;
use body::ParsedBody;

/// A function signature. This subset allows at most one result.
#[derive(Debug, Clone)]
pub(crate) struct FuncSig {
    pub(crate) params: Vec<ValKind>,
    pub(crate) ret: ValKind,
}

/// A function import awaiting resolution against the host registry.
#[derive(Debug, Clone)]
pub(crate) struct ImportedFunc {
    pub(crate) module: String,
    pub(crate) field: String,
    pub(crate) type_idx: u32,
}

/// A defined function: its signature reference, declared locals
/// (params excluded), and pre-decoded body.
#[derive(Debug, Clone)]
pub(crate) struct ParsedFunction {
    pub(crate) type_idx: u32,
    pub(crate) locals: Vec<ValKind>,
    pub(crate) body: ParsedBody,
}

/// A global with its evaluated constant initializer. For float kinds
/// the raw bit pattern is stored.
#[derive(Debug, Clone, Copy)]
pub(crate) struct GlobalInit {
    pub(crate) kind: ValKind,
    pub(crate) value: i64,
    pub(crate) mutable: bool,
}

pub(crate) struct ParsedModule {
    pub(crate) types: Vec<FuncSig>,
    pub(crate) imports: Vec<ImportedFunc>,
    pub(crate) funcs: Vec<ParsedFunction>,
    pub(crate) globals: Vec<GlobalInit>,
    pub(crate) num_imported_globals: u32,
    pub(crate) memory_pages: Option<u64>,
    /// Function exports: name → function index.
    pub(crate) exports: HashMap<String, u32>,
}

fn invalid(e: BinaryReaderError) -> CompileError {
    CompileError::InvalidBinary(e.to_string())
}

pub(crate) fn parse(engine: &Engine, bytes: &[u8]) -> Result<ParsedModule, CompileError> {
    let mut validator = engine.new_validator();
    validator.validate_all(bytes).map_err(invalid)?;

    let mut builder = ModuleBuilder::default();
    for payload in Parser::new(0).parse_all(bytes) {
        builder.process_payload(payload.map_err(invalid)?)?;
    }
    builder.finish()
}

#[derive(Default)]
struct ModuleBuilder {
    types: Vec<FuncSig>,
    imports: Vec<ImportedFunc>,
    /// Type index of each defined function, in declaration order.
    func_type_idx: Vec<u32>,
    funcs: Vec<ParsedFunction>,
    globals: Vec<GlobalInit>,
    num_imported_globals: u32,
    memory_pages: Option<u64>,
    exports: HashMap<String, u32>,
}

impl ModuleBuilder {
    fn process_payload(&mut self, payload: Payload) -> Result<(), CompileError> {
        match payload {
            Payload::TypeSection(reader) => {
                for ty in reader.into_iter_err_on_gc_types() {
                    let ty = ty.map_err(invalid)?;
                    self.types.push(convert_sig(&ty)?);
                }
                Ok(())
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    self.parse_import(import.map_err(invalid)?)?;
                }
                Ok(())
            }
            Payload::FunctionSection(reader) => {
                for type_idx in reader {
                    self.func_type_idx.push(type_idx.map_err(invalid)?);
                }
                Ok(())
            }
            Payload::MemorySection(reader) => {
                for mem in reader {
                    let mem = mem.map_err(invalid)?;
                    self.memory_pages = Some(mem.initial);
                }
                Ok(())
            }
            Payload::GlobalSection(reader) => {
                for global in reader {
                    self.parse_global(global.map_err(invalid)?)?;
                }
                Ok(())
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    self.parse_export(export.map_err(invalid)?);
                }
                Ok(())
            }
            Payload::CodeSectionEntry(body) => self.parse_body(body),
            _ => Ok(()),
        }
    }

    fn parse_import(&mut self, import: Import) -> Result<(), CompileError> {
        match import.ty {
            TypeRef::Func(type_idx) => {
                self.imports.push(ImportedFunc {
                    module: import.module.to_string(),
                    field: import.name.to_string(),
                    type_idx,
                });
            }
            // Memory/global/table imports are accepted structurally;
            // imported globals occupy their index space.
            TypeRef::Memory(mem) => {
                self.memory_pages = Some(mem.initial);
            }
            TypeRef::Global(_) => {
                self.num_imported_globals += 1;
            }
            _ => {}
        }
        Ok(())
    }

    fn parse_global(&mut self, global: Global) -> Result<(), CompileError> {
        let kind = ValKind::from_valtype(global.ty.content_type)?;
        let mut reader = global.init_expr.get_operators_reader();
        let value = match reader.read().map_err(invalid)? {
            Operator::I32Const { value } => value as i64,
            Operator::I64Const { value } => value,
            Operator::F32Const { value } => value.bits() as i64,
            Operator::F64Const { value } => value.bits() as i64,
            other => {
                return Err(CompileError::Unsupported(format!(
                    "global initializer {other:?}"
                )));
            }
        };
        self.globals.push(GlobalInit {
            kind,
            value,
            mutable: global.ty.mutable,
        });
        Ok(())
    }

    fn parse_export(&mut self, export: Export) {
        if export.kind == ExternalKind::Func {
            self.exports.insert(export.name.to_string(), export.index);
        }
    }

    fn parse_body(&mut self, body: FunctionBody) -> Result<(), CompileError> {
        let mut locals = Vec::new();
        for local in body.get_locals_reader().map_err(invalid)? {
            let (count, val_type) = local.map_err(invalid)?;
            let kind = ValKind::from_valtype(val_type)?;
            for _ in 0..count {
                locals.push(kind);
            }
        }
        let parsed = ParsedBody::parse(&body)?;
        let type_idx = *self
            .func_type_idx
            .get(self.funcs.len())
            .ok_or_else(|| CompileError::InvalidBinary("code entry without declaration".into()))?;
        self.funcs.push(ParsedFunction {
            type_idx,
            locals,
            body: parsed,
        });
        Ok(())
    }

    fn finish(self) -> Result<ParsedModule, CompileError> {
        if self.funcs.len() != self.func_type_idx.len() {
            return Err(CompileError::InvalidBinary(format!(
                "{} function declarations but {} bodies",
                self.func_type_idx.len(),
                self.funcs.len()
            )));
        }
        Ok(ParsedModule {
            types: self.types,
            imports: self.imports,
            funcs: self.funcs,
            globals: self.globals,
            num_imported_globals: self.num_imported_globals,
            memory_pages: self.memory_pages,
            exports: self.exports,
        })
    }
}

fn convert_sig(ty: &wasmparser::FuncType) -> Result<FuncSig, CompileError> {
    if ty.results().len() > 1 {
        return Err(CompileError::Unsupported(format!(
            "{} results (multi-value)",
            ty.results().len()
        )));
    }
    let params = ty
        .params()
        .iter()
        .map(|p| ValKind::from_valtype(*p))
        .collect::<Result<Vec<_>, _>>()?;
    let ret = match ty.results().first() {
        Some(r) => ValKind::from_valtype(*r)?,
        None => ValKind::Void,
    };
    Ok(FuncSig { params, ret })
}
