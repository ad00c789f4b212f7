//! The UDF registry: register, invoke, inspect, unregister.
//!
//! ```text
//!   register ──> validate ──> cache.lookup(hash)
//!                                │hit                       │miss
//!                                ▼                          ▼
//!                         load + native pool        interpreter pool
//!                         mode = Native             mode = Interpreted
//!                                                   ──> Compiling (background)
//! ```
//!
//! Registered modules live in a `DashMap` keyed by `name@version`. A call
//! clones the module's `Arc` out of the map and never holds a shard lock
//! while guest code runs.

use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::binding::ParameterMap;
use crate::cache::{CacheStats, NativeCodeCache};
use crate::compiler::{BackgroundCompiler, Provisioner};
use crate::config::EngineConfig;
use crate::context::{ContextRegistry, DocumentContext};
use crate::descriptor::{ModuleDescriptor, ModuleKey, ModuleQuery};
use crate::error::{
    EngineError, ExecError, ExecResult, NotFoundError, UnregisterError, ValidationError, ValidationResult,
};
use crate::module::{Invocation, LoadedModule, ModuleInfo};
use crate::stats::{CompileDiagnostics, CompileStatus, EngineCounters, EngineStats, ExecutionStats};
use crate::tier::interp::Interpreter;
use crate::tier::{default_native_backend, ExecutionMode, NativeBackend};
use crate::validate::{validate_descriptor, validate_limits};
use crate::value::Value;

/// Builder for [`UdfEngine`] with injectable cache and native backend.
pub struct UdfEngineBuilder {
    config: EngineConfig,
    cache: Option<Arc<NativeCodeCache>>,
    backend: Option<Option<Arc<dyn NativeBackend>>>,
}

impl UdfEngineBuilder {
    /// Use an existing (possibly pre-seeded) cache instead of opening one.
    pub fn cache(mut self, cache: Arc<NativeCodeCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Replace the default native backend.
    pub fn backend(mut self, backend: Arc<dyn NativeBackend>) -> Self {
        self.backend = Some(Some(backend));
        self
    }

    /// Run every module on the interpreter.
    pub fn interpreter_only(mut self) -> Self {
        self.backend = Some(None);
        self
    }

    pub fn build(self) -> Result<UdfEngine, EngineError> {
        let config = self.config;
        config.validate()?;

        let cache = match self.cache {
            Some(cache) => cache,
            None => Arc::new(match &config.cache_dir {
                Some(dir) => NativeCodeCache::open(dir, config.cache_budget_bytes)?,
                None => NativeCodeCache::in_memory(config.cache_budget_bytes),
            }),
        };
        let backend = match self.backend {
            Some(backend) => backend,
            None => default_native_backend(&config)?,
        };

        let contexts = Arc::new(ContextRegistry::new());
        let counters = Arc::new(EngineCounters::default());
        let provisioner = Arc::new(Provisioner::new(config.clone(), Arc::clone(&contexts)));
        let compiler = match &backend {
            Some(backend) if config.background_compilation => Some(BackgroundCompiler::new(
                config.compile_threads,
                Arc::clone(backend),
                Arc::clone(&cache),
                Arc::clone(&counters),
                Arc::clone(&provisioner),
            )?),
            _ => None,
        };

        info!(
            target: "quidditch_udf::registry",
            backend = backend.as_ref().map_or("none", |b| b.name()),
            cache_dir = ?cache.dir(),
            background_compilation = compiler.is_some(),
            "UDF engine started"
        );

        Ok(UdfEngine {
            interpreter: Interpreter::new(config.default_fuel.is_some()),
            config,
            modules: DashMap::new(),
            contexts,
            cache,
            backend,
            compiler,
            provisioner,
            counters,
        })
    }
}

/// Tiered WebAssembly UDF engine.
pub struct UdfEngine {
    config: EngineConfig,
    modules: DashMap<ModuleKey, Arc<LoadedModule>>,
    contexts: Arc<ContextRegistry>,
    interpreter: Interpreter,
    cache: Arc<NativeCodeCache>,
    backend: Option<Arc<dyn NativeBackend>>,
    compiler: Option<BackgroundCompiler>,
    provisioner: Arc<Provisioner>,
    counters: Arc<EngineCounters>,
}

impl UdfEngine {
    pub fn new(config: EngineConfig) -> Result<Self, EngineError> {
        Self::builder(config).build()
    }

    pub fn builder(config: EngineConfig) -> UdfEngineBuilder {
        UdfEngineBuilder {
            config,
            cache: None,
            backend: None,
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // ========================================================================
    // Registration
    // ========================================================================

    /// Validate and register a module. Returns the mode it starts in:
    /// `Native` on a cache hit, otherwise `Interpreted` or `Compiling`.
    pub fn register(&self, descriptor: ModuleDescriptor) -> ValidationResult<ExecutionMode> {
        validate_descriptor(&descriptor, self.config.max_memory_pages)?;
        validate_limits(&descriptor, self.config.default_fuel.is_some())?;
        let key = descriptor.key().clone();
        if self.modules.contains_key(&key) {
            return Err(ValidationError::Duplicate(key));
        }
        let descriptor = Arc::new(descriptor);

        let module = match self.load_cached(&descriptor) {
            Some(module) => module,
            None => self.load_interpreted(&descriptor)?,
        };
        let module = Arc::new(module);

        match self.modules.entry(key.clone()) {
            Entry::Occupied(_) => {
                module.begin_drain();
                return Err(ValidationError::Duplicate(key));
            }
            Entry::Vacant(slot) => {
                slot.insert(Arc::clone(&module));
            }
        }
        EngineCounters::bump(&self.counters.registrations);

        if let Some(compiler) = &self.compiler {
            if module.begin_compile() {
                compiler.schedule(&module);
            }
        }

        let mode = module.mode();
        info!(
            target: "quidditch_udf::registry",
            module = %key,
            hash = %descriptor.content_hash().short(),
            %mode,
            "Module registered"
        );
        Ok(mode)
    }

    /// Cache hit path: the module never touches the interpreter.
    fn load_cached(&self, descriptor: &Arc<ModuleDescriptor>) -> Option<LoadedModule> {
        let backend = self.backend.as_ref()?;
        let hash = descriptor.content_hash();
        let Some(artifact) = self.cache.lookup(&hash) else {
            EngineCounters::bump(&self.counters.cache_misses);
            return None;
        };

        let pool = match self
            .provisioner
            .native_pool(backend.as_ref(), descriptor, &artifact.bytes)
        {
            Ok(pool) => pool,
            Err(e) => {
                warn!(target: "quidditch_udf::registry", module = %descriptor.key(), error = %e, "Cached native artifact unusable, recompiling");
                self.cache.invalidate(&hash);
                EngineCounters::bump(&self.counters.cache_misses);
                return None;
            }
        };
        let cache_ref = self
            .cache
            .store_and_acquire(hash, &artifact.bytes, &artifact.origin, backend.name())
            .is_ok();
        EngineCounters::bump(&self.counters.cache_hits);
        debug!(target: "quidditch_udf::registry", module = %descriptor.key(), origin = %artifact.origin, "Native artifact reused from cache");

        let mut compile = CompileDiagnostics::new(CompileStatus::Succeeded, Some(backend.name()));
        compile.from_cache = true;
        Some(LoadedModule::native(
            Arc::clone(descriptor),
            pool,
            Arc::clone(&self.cache),
            compile,
            cache_ref,
        ))
    }

    fn load_interpreted(&self, descriptor: &Arc<ModuleDescriptor>) -> ValidationResult<LoadedModule> {
        let factory = self
            .interpreter
            .load(descriptor.bytecode(), self.provisioner.instance_spec(descriptor))?;
        let pool = self.provisioner.pool(descriptor, Arc::new(factory));
        // Surfaces start-function traps and link errors at registration.
        pool.prefill(1)
            .map_err(|e| ValidationError::Interpreter(e.to_string()))?;

        let compiles = self.compiler.is_some();
        let compile = CompileDiagnostics::new(
            if compiles {
                CompileStatus::Pending
            } else {
                CompileStatus::Disabled
            },
            self.backend.as_ref().map(|b| b.name()),
        );
        Ok(LoadedModule::interpreted(
            Arc::clone(descriptor),
            pool,
            Arc::clone(&self.cache),
            compile,
            !compiles,
        ))
    }

    /// Remove a module. New calls are refused immediately; pools close and
    /// the cache reference is released once in-flight calls complete.
    pub fn unregister(&self, name: &str, version: &str) -> Result<(), NotFoundError> {
        let key = ModuleKey::new(name, version);
        let (_, module) = self.modules.remove(&key).ok_or(NotFoundError(key))?;
        self.retire(&module);
        Ok(())
    }

    /// Like [`unregister`](Self::unregister) but refuses while calls are in flight.
    pub fn try_unregister(&self, name: &str, version: &str) -> Result<(), UnregisterError> {
        let key = ModuleKey::new(name, version);
        match self.modules.entry(key) {
            Entry::Vacant(slot) => Err(NotFoundError(slot.into_key()).into()),
            Entry::Occupied(slot) => {
                let in_flight = slot.get().in_flight();
                if in_flight > 0 {
                    return Err(UnregisterError::Busy {
                        key: slot.key().clone(),
                        in_flight,
                    });
                }
                let (_, module) = slot.remove_entry();
                self.retire(&module);
                Ok(())
            }
        }
    }

    fn retire(&self, module: &LoadedModule) {
        module.begin_drain();
        EngineCounters::bump(&self.counters.unregistrations);
        info!(
            target: "quidditch_udf::registry",
            module = %module.key(),
            in_flight = module.in_flight(),
            "Module unregistered"
        );
    }

    // ========================================================================
    // Invocation
    // ========================================================================

    /// Call a module's entry point for one document.
    pub fn invoke(
        &self,
        name: &str,
        version: &str,
        document: DocumentContext,
        params: &ParameterMap,
    ) -> ExecResult<Vec<Value>> {
        self.invoke_traced(name, version, document, params)
            .map(|invocation| invocation.values)
    }

    /// [`invoke`](Self::invoke), also reporting the tier that served the call.
    pub fn invoke_traced(
        &self,
        name: &str,
        version: &str,
        document: DocumentContext,
        params: &ParameterMap,
    ) -> ExecResult<Invocation> {
        let key = ModuleKey::new(name, version);
        let module = self.module(&key).ok_or(ExecError::NotFound(key))?;
        module.invoke(&self.contexts, document, params)
    }

    fn module(&self, key: &ModuleKey) -> Option<Arc<LoadedModule>> {
        self.modules.get(key).map(|m| Arc::clone(m.value()))
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    pub fn stats(&self, name: &str, version: &str) -> Result<ExecutionStats, NotFoundError> {
        let key = ModuleKey::new(name, version);
        self.module(&key)
            .map(|m| m.snapshot())
            .ok_or(NotFoundError(key))
    }

    pub fn all_stats(&self) -> Vec<ExecutionStats> {
        let mut all: Vec<_> = self.modules.iter().map(|m| m.snapshot()).collect();
        all.sort_by(|a, b| a.key.cmp(&b.key));
        all
    }

    pub fn list_modules(&self) -> Vec<ModuleInfo> {
        self.query(&ModuleQuery::default())
    }

    /// Modules matching a metadata filter, ordered by key.
    pub fn query(&self, query: &ModuleQuery) -> Vec<ModuleInfo> {
        let mut found: Vec<_> = self
            .modules
            .iter()
            .filter(|m| query.matches(m.descriptor()))
            .map(|m| m.info())
            .collect();
        found.sort_by(|a, b| a.key.cmp(&b.key));
        found
    }

    /// Highest registered version of `name`. Versions are compared as semver
    /// when any of them parse; otherwise the newest registration wins.
    pub fn latest(&self, name: &str) -> Option<ModuleInfo> {
        let versions = self.query(&ModuleQuery::new().name(name));
        let semver_max = versions
            .iter()
            .filter_map(|info| {
                semver::Version::parse(&info.key.version)
                    .ok()
                    .map(|v| (v, info))
            })
            .max_by(|a, b| a.0.cmp(&b.0))
            .map(|(_, info)| info.clone());
        semver_max.or_else(|| {
            versions
                .into_iter()
                .max_by_key(|info| info.registered_at_unix_ms)
        })
    }

    pub fn descriptor(&self, name: &str, version: &str) -> Option<Arc<ModuleDescriptor>> {
        self.module(&ModuleKey::new(name, version))
            .map(|m| Arc::clone(m.descriptor()))
    }

    pub fn mode(&self, name: &str, version: &str) -> Option<ExecutionMode> {
        self.module(&ModuleKey::new(name, version)).map(|m| m.mode())
    }

    /// Wait until background compilation for a module has settled (promoted,
    /// failed or disabled) or `timeout` elapses; returns the mode either way.
    pub fn wait_for_compilation(
        &self,
        name: &str,
        version: &str,
        timeout: Duration,
    ) -> Result<ExecutionMode, NotFoundError> {
        let key = ModuleKey::new(name, version);
        let module = self.module(&key).ok_or(NotFoundError(key))?;
        module.wait_settled(timeout);
        Ok(module.mode())
    }

    pub fn len(&self) -> usize {
        self.modules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.modules.is_empty()
    }

    /// Hashes with a compile job queued or running.
    pub fn pending_compilations(&self) -> usize {
        self.compiler.as_ref().map_or(0, |c| c.pending())
    }

    pub fn native_backend(&self) -> Option<&'static str> {
        self.compiler
            .as_ref()
            .map(|c| c.backend().name())
            .or_else(|| self.backend.as_ref().map(|b| b.name()))
    }

    pub fn engine_stats(&self) -> EngineStats {
        self.counters.snapshot()
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Evict unreferenced cache entries down to `target_bytes`; returns bytes freed.
    pub fn evict_cache(&self, target_bytes: u64) -> u64 {
        self.cache.evict(target_bytes)
    }

    /// Contexts currently registered (calls in flight across all modules).
    pub fn active_contexts(&self) -> usize {
        self.contexts.len()
    }
}

impl std::fmt::Debug for UdfEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdfEngine")
            .field("modules", &self.modules.len())
            .field("backend", &self.backend.as_ref().map(|b| b.name()))
            .field("cache_dir", &self.cache.dir())
            .finish()
    }
}
