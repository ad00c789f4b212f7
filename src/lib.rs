//! Quidditch UDF - tiered WebAssembly execution for user-defined functions
//!
//! Runs user-supplied scoring and filtering functions inside a search data
//! node. A module is callable the moment it is registered (interpreter tier)
//! and is promoted to natively compiled code in the background, without
//! stopping traffic. Native artifacts are kept in a content-addressed cache so
//! restarts and redeployments of identical bytecode skip compilation.
//!
//! # Architecture
//!
//! ```text
//!   register ──> validate ──> cache hit? ──yes──> Native
//!                                 │no
//!                                 └──> Interpreted ──(rayon)──> Compiling ──> Native
//!
//!   invoke ──> bind params ──> register context ──> mode (atomic load)
//!          ──> pooled instance ──> entry(ctx_id, args...) ──> typed results
//! ```
//!
//! - **Validation** (`validate`): WebAssembly validity via `wasmparser`, the
//!   declared signature, and a sandbox that only admits host-ABI imports
//! - **Interpreter tier** (`tier::interp`): `wasmi` with fuel metering
//! - **Native tier** (`tier::native`, feature `native`): `wasmtime`/Cranelift
//! - **Native code cache** (`cache`): SHA-256 keyed, LRU with refcounts,
//!   persisted as `<hex>.cwasm` + `<hex>.json`
//! - **Hot swap** (`module`, `compiler`): atomic mode byte plus a write-once
//!   native pool, coalesced compiles per content hash
//! - **Context bridge** (`context`, `abi`): per-call document contexts behind
//!   opaque ids; guests read fields through `env.*` host functions
//!
//! # Example
//!
//! ```rust,no_run
//! use quidditch_udf::{
//!     DocumentContext, EngineConfig, ModuleDescriptor, ParamSpec, ParameterMap, UdfEngine, Value, ValueType,
//! };
//!
//! let engine = UdfEngine::new(EngineConfig::in_memory())?;
//! let wasm = std::fs::read("boost.wasm")?;
//! engine.register(
//!     ModuleDescriptor::builder("boost", "1.0.0", "score", wasm)
//!         .param(ParamSpec::optional("boost", ValueType::F64).with_default(1.0))
//!         .returns(ValueType::F64)
//!         .build(),
//! )?;
//!
//! let params: ParameterMap = [("boost".to_string(), Value::F64(1.5))].into_iter().collect();
//! let out = engine.invoke("boost", "1.0.0", DocumentContext::bare("doc-1", 2.0), &params)?;
//! assert_eq!(out, vec![Value::F64(3.0)]);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod abi;
pub mod binding;
pub mod cache;
mod compiler;
pub mod config;
pub mod context;
pub mod descriptor;
pub mod engine;
pub mod error;
pub mod manifest;
mod module;
pub mod pool;
pub mod stats;
pub mod tier;
pub mod validate;
pub mod value;

pub use binding::ParameterMap;
pub use cache::{CacheStats, NativeCodeCache};
pub use config::EngineConfig;
pub use context::{DocumentContext, DocumentFields, FieldValue};
pub use descriptor::{
    ContentHash, ModuleDescriptor, ModuleDescriptorBuilder, ModuleKey, ModuleLimits, ModuleMetadata,
    ModuleQuery, ParamSpec,
};
pub use engine::{UdfEngine, UdfEngineBuilder};
pub use error::{
    CacheError, CompileError, ConfigError, EngineError, ExecError, ExecResult, ManifestError,
    NotFoundError, TrapKind, UnregisterError, ValidationError, ValidationResult,
};
pub use manifest::UdfManifest;
pub use module::{Invocation, ModuleInfo};
pub use stats::{CompileDiagnostics, CompileStatus, EngineStats, ExecutionStats, TierStats};
pub use tier::{ExecutionMode, NativeBackend, Tier};
pub use value::{Value, ValueType};
