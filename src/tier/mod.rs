//! Execution tiers and the seams between them and the dispatcher.
//!
//! ```text
//! Interpreted ──(registration)──> Compiling ──(artifact installed)──> Native
//!      │                                                               ▲
//!      └──────────────── cache hit at registration ────────────────────┘
//! ```
//!
//! The mode lives in a single `AtomicU8` ([`ModeCell`]). The dispatcher reads
//! it with one acquire load per call; the compiler publishes `Native` with a
//! release store only after the native instance pool is fully built, so a
//! reader that observes `Native` also observes the pool.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use serde::Serialize;
use smallvec::SmallVec;

use crate::context::ContextRegistry;
use crate::error::{CompileError, ExecError};
use crate::value::WasmValue;

pub mod interp;
#[cfg(feature = "native")]
pub mod native;

/// Per-module execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum ExecutionMode {
    /// Served by the interpreter, no compilation scheduled yet
    Interpreted = 0,
    /// Served by the interpreter while native code is being produced
    Compiling = 1,
    /// Served by native code; terminal
    Native = 2,
}

impl From<u8> for ExecutionMode {
    fn from(v: u8) -> Self {
        match v {
            1 => ExecutionMode::Compiling,
            2 => ExecutionMode::Native,
            _ => ExecutionMode::Interpreted,
        }
    }
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Interpreted => "interpreted",
            ExecutionMode::Compiling => "compiling",
            ExecutionMode::Native => "native",
        })
    }
}

impl ExecutionMode {
    /// Tier that serves calls in this mode.
    #[inline]
    pub fn tier(self) -> Tier {
        match self {
            ExecutionMode::Native => Tier::Native,
            _ => Tier::Interpreter,
        }
    }
}

/// Single-writer, many-reader mode flag.
#[derive(Debug)]
pub struct ModeCell(AtomicU8);

impl ModeCell {
    pub fn new(mode: ExecutionMode) -> Self {
        ModeCell(AtomicU8::new(mode as u8))
    }

    #[inline]
    pub fn load(&self) -> ExecutionMode {
        ExecutionMode::from(self.0.load(Ordering::Acquire))
    }

    /// `Interpreted -> Compiling`. Returns false if another transition won.
    pub fn begin_compile(&self) -> bool {
        self.0
            .compare_exchange(
                ExecutionMode::Interpreted as u8,
                ExecutionMode::Compiling as u8,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Publish `Native`. The caller must have installed the native pool first.
    ///
    /// Returns false if the module was already native.
    pub fn publish_native(&self) -> bool {
        self.0.swap(ExecutionMode::Native as u8, Ordering::Release) != ExecutionMode::Native as u8
    }
}

/// The two execution strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    Interpreter,
    Native,
}

impl Tier {
    pub fn as_str(self) -> &'static str {
        match self {
            Tier::Interpreter => "interpreter",
            Tier::Native => "native",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw results of one guest call. UDFs rarely return more than one value.
pub type RawResults = SmallVec<[WasmValue; 2]>;

/// Everything a factory needs to produce callable instances of one module.
#[derive(Clone)]
pub struct InstanceSpec {
    pub entry_point: String,
    pub result_count: usize,
    /// Instruction budget per call; `None` when metering is off.
    pub fuel: Option<u64>,
    pub max_memory_bytes: usize,
    pub contexts: Arc<ContextRegistry>,
}

/// A ready-to-call module instance. Used by one call at a time.
pub trait TierInstance: Send {
    /// Call the entry point. `args[0]` is the context id.
    fn call(&mut self, args: &[WasmValue]) -> Result<RawResults, ExecError>;
}

/// Produces instances of one module on one tier.
pub trait InstanceFactory: Send + Sync {
    fn tier(&self) -> Tier;
    fn instantiate(&self) -> Result<Box<dyn TierInstance>, ExecError>;
}

/// Ahead-of-time compiler for the native tier.
///
/// `compile` produces a self-contained artifact suitable for the native code
/// cache; `load` turns an artifact (fresh or cached) into an instance factory.
pub trait NativeBackend: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    fn compile(&self, wasm: &[u8]) -> Result<Vec<u8>, CompileError>;

    fn load(&self, artifact: &[u8], spec: InstanceSpec) -> Result<Arc<dyn InstanceFactory>, CompileError>;
}

/// Default native backend for this build, if any.
pub fn default_native_backend(
    config: &crate::config::EngineConfig,
) -> Result<Option<Arc<dyn NativeBackend>>, crate::error::EngineError> {
    #[cfg(feature = "native")]
    {
        let backend = native::WasmtimeBackend::new(config.default_fuel.is_some())?;
        Ok(Some(Arc::new(backend)))
    }
    #[cfg(not(feature = "native"))]
    {
        let _ = config;
        Ok(None)
    }
}
