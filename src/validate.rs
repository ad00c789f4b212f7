//! Static validation of submitted modules.
//!
//! Runs before anything else touches a module:
//! - descriptor checks (names, unique parameters, typed defaults, return types)
//! - full WebAssembly validation via `wasmparser`
//! - sandbox checks: only host-ABI function imports, bounded initial memory
//! - the entry point's WebAssembly signature matches the declared one
//!
//! The expected entry signature is `(i64 ctx, positional params...) -> (returns...)`
//! where positional params are the non-string parameters in declaration order.

use std::collections::HashSet;
use std::fmt::Write as _;

use serde::Serialize;
use wasmparser::{ExternalKind, FuncType, Parser, Payload, TypeRef, ValType, Validator};

use crate::abi::{host_function, HOST_MODULE, MEMORY_EXPORT};
use crate::descriptor::ModuleDescriptor;
use crate::error::{ValidationError, ValidationResult};
use crate::value::{ValueType, WasmType};

/// An exported function and its scalar signature (`None` if it uses
/// non-scalar types such as `v128` or references).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ExportedFunction {
    pub name: String,
    #[serde(skip)]
    pub signature: Option<(Vec<WasmType>, Vec<WasmType>)>,
    pub display: String,
}

/// What static analysis learned about a module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ModuleShape {
    pub imports: Vec<String>,
    pub functions: Vec<ExportedFunction>,
    pub exports_memory: bool,
    pub initial_memory_pages: u64,
}

impl ModuleShape {
    pub fn function(&self, name: &str) -> Option<&ExportedFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}

fn malformed(e: impl std::fmt::Display) -> ValidationError {
    ValidationError::MalformedBytecode(e.to_string())
}

fn scalar(ty: &ValType) -> Option<WasmType> {
    match ty {
        ValType::I32 => Some(WasmType::I32),
        ValType::I64 => Some(WasmType::I64),
        ValType::F32 => Some(WasmType::F32),
        ValType::F64 => Some(WasmType::F64),
        _ => None,
    }
}

fn scalar_signature(ty: &FuncType) -> Option<(Vec<WasmType>, Vec<WasmType>)> {
    let params = ty.params().iter().map(scalar).collect::<Option<Vec<_>>>()?;
    let results = ty.results().iter().map(scalar).collect::<Option<Vec<_>>>()?;
    Some((params, results))
}

/// Render `(i64, f64) -> (f64)`.
pub fn render_signature(params: &[WasmType], results: &[WasmType]) -> String {
    let mut out = String::from("(");
    for (i, p) in params.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{p}");
    }
    out.push_str(") -> (");
    for (i, r) in results.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        let _ = write!(out, "{r}");
    }
    out.push(')');
    out
}

fn render_func_type(ty: &FuncType) -> String {
    let list = |types: &[ValType]| {
        types
            .iter()
            .map(|t| format!("{t:?}").to_lowercase())
            .collect::<Vec<_>>()
            .join(", ")
    };
    format!("({}) -> ({})", list(ty.params()), list(ty.results()))
}

/// Validate raw bytecode and enforce the sandbox rules.
pub fn validate_bytecode(bytes: &[u8], max_memory_pages: u32) -> ValidationResult<ModuleShape> {
    if bytes.is_empty() {
        return Err(ValidationError::EmptyBytecode);
    }
    Validator::new().validate_all(bytes).map_err(malformed)?;

    let mut shape = ModuleShape::default();
    let mut types: Vec<FuncType> = Vec::new();
    // Type index of every function, imports first.
    let mut func_types: Vec<u32> = Vec::new();
    let mut exported_funcs: Vec<(String, u32)> = Vec::new();

    for payload in Parser::new(0).parse_all(bytes) {
        match payload.map_err(malformed)? {
            Payload::TypeSection(reader) => {
                for ty in reader.into_iter_err_on_gc_types() {
                    types.push(ty.map_err(malformed)?);
                }
            }
            Payload::ImportSection(reader) => {
                for import in reader {
                    let import = import.map_err(malformed)?;
                    let forbidden = || ValidationError::ForbiddenImport {
                        module: import.module.to_owned(),
                        name: import.name.to_owned(),
                    };
                    let TypeRef::Func(type_index) = import.ty else {
                        return Err(forbidden());
                    };
                    if import.module != HOST_MODULE {
                        return Err(forbidden());
                    }
                    let host = host_function(import.name).ok_or_else(forbidden)?;
                    let ty = types.get(type_index as usize).ok_or_else(|| malformed("import type index out of range"))?;
                    if scalar_signature(ty) != Some((host.params.to_vec(), host.results.to_vec())) {
                        return Err(ValidationError::ImportSignatureMismatch {
                            name: import.name.to_owned(),
                            expected: render_signature(host.params, host.results),
                            found: render_func_type(ty),
                        });
                    }
                    func_types.push(type_index);
                    shape.imports.push(format!("{}.{}", import.module, import.name));
                }
            }
            Payload::FunctionSection(reader) => {
                for type_index in reader {
                    func_types.push(type_index.map_err(malformed)?);
                }
            }
            Payload::MemorySection(reader) => {
                for memory in reader {
                    let memory = memory.map_err(malformed)?;
                    if memory.initial > u64::from(max_memory_pages) {
                        return Err(ValidationError::MemoryLimitExceeded {
                            requested: memory.initial,
                            limit: max_memory_pages,
                        });
                    }
                    shape.initial_memory_pages = memory.initial;
                }
            }
            Payload::ExportSection(reader) => {
                for export in reader {
                    let export = export.map_err(malformed)?;
                    match export.kind {
                        ExternalKind::Func => exported_funcs.push((export.name.to_owned(), export.index)),
                        ExternalKind::Memory if export.name == MEMORY_EXPORT => shape.exports_memory = true,
                        _ => {}
                    }
                }
            }
            _ => {}
        }
    }

    for (name, func_index) in exported_funcs {
        let ty = func_types
            .get(func_index as usize)
            .and_then(|t| types.get(*t as usize))
            .ok_or_else(|| malformed("export refers to unknown function"))?;
        shape.functions.push(ExportedFunction {
            name,
            signature: scalar_signature(ty),
            display: render_func_type(ty),
        });
    }
    Ok(shape)
}

/// Signature the entry point must have for this descriptor.
pub fn expected_entry_signature(desc: &ModuleDescriptor) -> (Vec<WasmType>, Vec<WasmType>) {
    let params = std::iter::once(WasmType::I64)
        .chain(desc.params().iter().filter_map(|p| p.ty.wasm_type()))
        .collect();
    let results = desc.returns().iter().filter_map(|r| r.wasm_type()).collect();
    (params, results)
}

fn validate_fields(desc: &ModuleDescriptor) -> ValidationResult<()> {
    if desc.name().trim().is_empty() {
        return Err(ValidationError::EmptyField("name"));
    }
    if desc.version().trim().is_empty() {
        return Err(ValidationError::EmptyField("version"));
    }
    if desc.entry_point().trim().is_empty() {
        return Err(ValidationError::EmptyField("entry point"));
    }
    if desc.bytecode().is_empty() {
        return Err(ValidationError::EmptyBytecode);
    }
    if desc.limits().fuel == Some(0) {
        return Err(ValidationError::ZeroFuel);
    }

    let mut seen = HashSet::new();
    for (i, param) in desc.params().iter().enumerate() {
        if param.name.trim().is_empty() {
            return Err(ValidationError::EmptyParameterName(i));
        }
        if !seen.insert(param.name.as_str()) {
            return Err(ValidationError::DuplicateParameter(param.name.clone()));
        }
        if let Some(default) = &param.default {
            if default.coerce_default(param.ty).is_none() {
                return Err(ValidationError::DefaultTypeMismatch {
                    name: param.name.clone(),
                    expected: param.ty,
                    found: default.value_type(),
                });
            }
        }
    }

    if desc.returns().is_empty() {
        return Err(ValidationError::NoReturnType);
    }
    if let Some(ty) = desc.returns().iter().find(|t| **t == ValueType::String) {
        return Err(ValidationError::UnsupportedReturnType(*ty));
    }
    Ok(())
}

/// A per-module fuel limit can only be enforced by a metering engine.
pub fn validate_limits(desc: &ModuleDescriptor, fuel_metering: bool) -> ValidationResult<()> {
    if desc.limits().fuel.is_some() && !fuel_metering {
        return Err(ValidationError::FuelWithoutMetering(desc.key().clone()));
    }
    Ok(())
}

/// Full registration-time validation of a descriptor.
pub fn validate_descriptor(desc: &ModuleDescriptor, max_memory_pages: u32) -> ValidationResult<ModuleShape> {
    validate_fields(desc)?;
    let shape = validate_bytecode(desc.bytecode(), max_memory_pages)?;

    let entry = desc.entry_point();
    let func = shape
        .function(entry)
        .ok_or_else(|| ValidationError::MissingEntryPoint(entry.to_owned()))?;
    let (params, results) = expected_entry_signature(desc);
    if func.signature.as_ref() != Some(&(params.clone(), results.clone())) {
        return Err(ValidationError::SignatureMismatch {
            entry: entry.to_owned(),
            expected: render_signature(&params, &results),
            found: func.display.clone(),
        });
    }
    Ok(shape)
}
