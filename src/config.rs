//! Engine configuration.
//!
//! ```toml
//! cache_dir = "/var/lib/quidditch/udf-native"
//! cache_budget_bytes = 268435456
//! compile_threads = 2
//! default_pool_size = 4
//! max_instances_per_module = 64
//! checkout_timeout_ms = 10
//! default_fuel = 10000000
//! max_memory_pages = 256
//! background_compilation = true
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;

/// Idle instances kept per tier when a module does not override it.
pub const DEFAULT_POOL_SIZE: usize = 4;

/// Upper bound for any pool size, engine default or per module.
pub const MAX_POOL_SIZE: usize = 64;

/// Live instances (idle + checked out) allowed per module and tier.
pub const DEFAULT_MAX_INSTANCES: usize = 64;

pub const DEFAULT_CHECKOUT_TIMEOUT_MS: u64 = 10;

/// Instruction budget per call.
pub const DEFAULT_FUEL: u64 = 10_000_000;

/// 256 pages of 64 KiB = 16 MiB of guest memory.
pub const DEFAULT_MAX_MEMORY_PAGES: u32 = 256;

pub const DEFAULT_CACHE_BUDGET_BYTES: u64 = 256 * 1024 * 1024;

pub const WASM_PAGE_SIZE: usize = 64 * 1024;

/// Engine-wide settings.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Directory of the native code cache. `None` keeps the cache in memory.
    pub cache_dir: Option<PathBuf>,
    /// Size budget for cached native artifacts.
    pub cache_budget_bytes: u64,
    /// Threads dedicated to background compilation.
    pub compile_threads: usize,
    pub default_pool_size: usize,
    pub max_instances_per_module: usize,
    pub checkout_timeout_ms: u64,
    /// Instruction budget per call. `None` disables metering.
    pub default_fuel: Option<u64>,
    pub max_memory_pages: u32,
    /// When false modules stay on the interpreter tier.
    pub background_compilation: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            cache_budget_bytes: DEFAULT_CACHE_BUDGET_BYTES,
            compile_threads: (num_cpus::get() / 2).max(1),
            default_pool_size: DEFAULT_POOL_SIZE,
            max_instances_per_module: DEFAULT_MAX_INSTANCES,
            checkout_timeout_ms: DEFAULT_CHECKOUT_TIMEOUT_MS,
            default_fuel: Some(DEFAULT_FUEL),
            max_memory_pages: DEFAULT_MAX_MEMORY_PAGES,
            background_compilation: true,
        }
    }
}

/// `<user cache dir>/quidditch/udf-native`, if the platform has one.
pub fn default_cache_dir() -> Option<PathBuf> {
    dirs::cache_dir().map(|d| d.join("quidditch").join("udf-native"))
}

impl EngineConfig {
    /// Config with an in-memory native cache, for tests and ephemeral nodes.
    pub fn in_memory() -> Self {
        Self {
            cache_dir: None,
            ..Self::default()
        }
    }

    /// Config persisting native artifacts under `dir`.
    pub fn with_cache_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.compile_threads == 0 {
            return Err(ConfigError::Invalid("compile_threads must be at least 1".into()));
        }
        if self.default_pool_size == 0 || self.default_pool_size > MAX_POOL_SIZE {
            return Err(ConfigError::Invalid(format!(
                "default_pool_size must be in 1..={MAX_POOL_SIZE}"
            )));
        }
        if self.max_instances_per_module < self.default_pool_size {
            return Err(ConfigError::Invalid(
                "max_instances_per_module must be >= default_pool_size".into(),
            ));
        }
        if self.max_memory_pages == 0 || self.max_memory_pages > 65_536 {
            return Err(ConfigError::Invalid(
                "max_memory_pages must be in 1..=65536".into(),
            ));
        }
        if self.default_fuel == Some(0) {
            return Err(ConfigError::Invalid(
                "default_fuel must be positive; omit it to disable metering".into(),
            ));
        }
        Ok(())
    }

    #[inline]
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    #[inline]
    pub fn max_memory_bytes(&self) -> usize {
        self.max_memory_pages as usize * WASM_PAGE_SIZE
    }

    /// Pool size for a module, clamped to the engine bounds.
    pub fn pool_size_for(&self, requested: Option<usize>) -> usize {
        requested
            .unwrap_or(self.default_pool_size)
            .clamp(1, MAX_POOL_SIZE.min(self.max_instances_per_module))
    }
}
