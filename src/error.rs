//! Error taxonomy for the UDF engine.
//!
//! - [`ValidationError`]: rejected synchronously at registration, nothing scheduled
//! - [`CompileError`]: raised inside the background compiler, never seen by callers
//! - [`ExecError`]: everything that can go wrong during a single `invoke`
//! - [`CacheError`]: native artifact persistence failures
//! - [`ConfigError`], [`ManifestError`], [`EngineError`]: setup

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::descriptor::ModuleKey;
use crate::value::ValueType;

/// Result type for registration and validation.
pub type ValidationResult<T> = Result<T, ValidationError>;

/// Result type for module invocation.
pub type ExecResult<T> = Result<T, ExecError>;

/// A descriptor or its bytecode failed validation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("module {0} must not be empty")]
    EmptyField(&'static str),

    #[error("module bytecode is empty")]
    EmptyBytecode,

    #[error("malformed WebAssembly module: {0}")]
    MalformedBytecode(String),

    #[error("parameter #{0} has an empty name")]
    EmptyParameterName(usize),

    #[error("duplicate parameter name '{0}'")]
    DuplicateParameter(String),

    #[error("default for parameter '{name}' is {found}, expected {expected}")]
    DefaultTypeMismatch {
        name: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("module must declare at least one return type")]
    NoReturnType,

    #[error("return type {0} cannot be produced by a WebAssembly function")]
    UnsupportedReturnType(ValueType),

    #[error("entry point '{0}' is not an exported function")]
    MissingEntryPoint(String),

    #[error("entry point '{entry}' has signature {found}, expected {expected}")]
    SignatureMismatch {
        entry: String,
        expected: String,
        found: String,
    },

    #[error("import '{module}.{name}' is not part of the host ABI")]
    ForbiddenImport { module: String, name: String },

    #[error("import '{name}' has signature {found}, expected {expected}")]
    ImportSignatureMismatch {
        name: String,
        expected: String,
        found: String,
    },

    #[error("module requests {requested} memory pages, limit is {limit}")]
    MemoryLimitExceeded { requested: u64, limit: u32 },

    #[error("module fuel limit must be positive")]
    ZeroFuel,

    #[error("module {0} declares a fuel limit but the engine runs without fuel metering")]
    FuelWithoutMetering(ModuleKey),

    #[error("module {0} is already registered")]
    Duplicate(ModuleKey),

    #[error("interpreter rejected module: {0}")]
    Interpreter(String),

    #[error("failed to install cached native artifact: {0}")]
    CachedArtifact(String),
}

/// Background compilation failed. Logged and recorded in stats only.
#[derive(Debug, Clone, Error)]
pub enum CompileError {
    #[error("native compilation failed: {0}")]
    Codegen(String),

    #[error("native artifact could not be loaded: {0}")]
    Load(String),

    #[error("native tier is not available in this build")]
    Unavailable,
}

/// Classification of a guest trap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapKind {
    DivisionByZero,
    IntegerOverflow,
    MemoryOutOfBounds,
    Unreachable,
    StackOverflow,
    OutOfFuel,
    Other,
}

impl std::fmt::Display for TrapKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TrapKind::DivisionByZero => "integer division by zero",
            TrapKind::IntegerOverflow => "integer overflow",
            TrapKind::MemoryOutOfBounds => "out-of-bounds memory access",
            TrapKind::Unreachable => "unreachable executed",
            TrapKind::StackOverflow => "call stack exhausted",
            TrapKind::OutOfFuel => "instruction budget exhausted",
            TrapKind::Other => "trap",
        };
        f.write_str(s)
    }
}

/// Failure of a single invocation.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ExecError {
    #[error("module {0} is not registered")]
    NotFound(ModuleKey),

    #[error("module {0} is being unregistered")]
    Draining(ModuleKey),

    #[error("required parameter '{0}' is missing")]
    MissingParameter(String),

    #[error("unknown parameter '{0}'")]
    UnknownParameter(String),

    #[error("parameter '{name}' expects {expected}, got {found}")]
    ParameterType {
        name: String,
        expected: ValueType,
        found: ValueType,
    },

    #[error("no instance of {key} became available within {timeout:?}")]
    PoolExhausted { key: ModuleKey, timeout: Duration },

    #[error("instantiation failed: {0}")]
    Instantiation(String),

    #[error("{kind}: {message}")]
    Trap { kind: TrapKind, message: String },

    #[error("host call failed: {0}")]
    Host(String),

    #[error("module returned {found} values, declared {expected}")]
    ResultArity { expected: usize, found: usize },

    #[error("return #{index} is {found}, declared {expected}")]
    ResultType {
        index: usize,
        expected: ValueType,
        found: ValueType,
    },
}

impl ExecError {
    /// True for errors detected while binding arguments, before any guest code ran.
    pub fn is_binding_error(&self) -> bool {
        matches!(
            self,
            ExecError::MissingParameter(_)
                | ExecError::UnknownParameter(_)
                | ExecError::ParameterType { .. }
        )
    }

    /// The trap classification, if the guest trapped.
    pub fn trap_kind(&self) -> Option<TrapKind> {
        match self {
            ExecError::Trap { kind, .. } => Some(*kind),
            _ => None,
        }
    }
}

/// Lookup of a module that is not registered.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("module {0} is not registered")]
pub struct NotFoundError(pub ModuleKey);

/// Failure of the strict unregister variant.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UnregisterError {
    #[error(transparent)]
    NotFound(#[from] NotFoundError),

    #[error("module {key} has {in_flight} calls in flight")]
    Busy { key: ModuleKey, in_flight: usize },
}

/// Native cache persistence failure.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O on '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cache metadata '{path}': {source}")]
    Metadata {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("cache artifact '{path}' does not match its recorded checksum")]
    Corrupt { path: PathBuf },
}

impl CacheError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        CacheError::Io {
            path: path.into(),
            source,
        }
    }
}

/// Engine configuration could not be loaded or is inconsistent.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// A `udf.toml` manifest could not be turned into a descriptor.
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("failed to read '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid manifest TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("parameter '{0}' has a default that is not a scalar")]
    UnsupportedDefault(String),
}

/// Engine construction failure.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("failed to start compile pool: {0}")]
    CompilePool(String),

    #[error("failed to initialise {tier} engine: {message}")]
    Backend { tier: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_binding_errors_are_classified() {
        assert!(ExecError::MissingParameter("boost".into()).is_binding_error());
        assert!(ExecError::UnknownParameter("x".into()).is_binding_error());
        assert!(!ExecError::Instantiation("boom".into()).is_binding_error());
    }

    #[test]
    fn test_trap_display() {
        let err = ExecError::Trap {
            kind: TrapKind::DivisionByZero,
            message: "wasm trap".into(),
        };
        assert_eq!(err.trap_kind(), Some(TrapKind::DivisionByZero));
        assert_eq!(err.to_string(), "integer division by zero: wasm trap");
    }
}
