//! Background native compilation and hot swap.
//!
//! ```text
//!   schedule(module) ──> in_flight[hash] exists? ──yes──> join waiters (coalesced)
//!                              │no
//!                              ▼
//!                     rayon pool: cache lookup ──hit──┐
//!                              │miss                  │
//!                              ▼                      │
//!                     backend.compile ──> cache.store ┤
//!                                                     ▼
//!                     take waiters ──> per module: acquire ref, load,
//!                                      prefill native pool, install_native
//! ```
//!
//! Compiles run on a dedicated `rayon` pool so they never compete with the
//! threads serving calls. At most one job per content hash is in flight;
//! registrations of byte-identical bytecode that arrive meanwhile wait for
//! that job instead of compiling again.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info, warn};

use crate::cache::NativeCodeCache;
use crate::config::EngineConfig;
use crate::context::ContextRegistry;
use crate::descriptor::{ContentHash, ModuleDescriptor};
use crate::error::{CompileError, EngineError};
use crate::module::LoadedModule;
use crate::pool::InstancePool;
use crate::stats::{CompileStatus, EngineCounters};
use crate::tier::{InstanceFactory, InstanceSpec, NativeBackend};

/// Builds instance specs and pools from engine settings.
pub(crate) struct Provisioner {
    config: EngineConfig,
    contexts: Arc<ContextRegistry>,
}

impl Provisioner {
    pub(crate) fn new(config: EngineConfig, contexts: Arc<ContextRegistry>) -> Self {
        Self { config, contexts }
    }

    /// Per-module fuel overrides only apply when metering is enabled.
    pub(crate) fn instance_spec(&self, desc: &ModuleDescriptor) -> InstanceSpec {
        InstanceSpec {
            entry_point: desc.entry_point().to_owned(),
            result_count: desc.returns().len(),
            fuel: self
                .config
                .default_fuel
                .map(|default| desc.limits().fuel.unwrap_or(default)),
            max_memory_bytes: self.config.max_memory_bytes(),
            contexts: Arc::clone(&self.contexts),
        }
    }

    pub(crate) fn pool_size(&self, desc: &ModuleDescriptor) -> usize {
        self.config.pool_size_for(desc.limits().pool_size)
    }

    pub(crate) fn pool(&self, desc: &ModuleDescriptor, factory: Arc<dyn InstanceFactory>) -> Arc<InstancePool> {
        Arc::new(InstancePool::new(
            desc.key().clone(),
            factory,
            self.pool_size(desc),
            self.config.max_instances_per_module,
            self.config.checkout_timeout(),
        ))
    }

    /// Load an artifact and warm a full native pool for `desc`.
    pub(crate) fn native_pool(
        &self,
        backend: &dyn NativeBackend,
        desc: &ModuleDescriptor,
        artifact: &[u8],
    ) -> Result<Arc<InstancePool>, CompileError> {
        let factory = backend.load(artifact, self.instance_spec(desc))?;
        let pool = self.pool(desc, factory);
        pool.prefill(self.pool_size(desc))
            .map_err(|e| CompileError::Load(e.to_string()))?;
        Ok(pool)
    }
}

struct CompilerShared {
    backend: Arc<dyn NativeBackend>,
    cache: Arc<NativeCodeCache>,
    counters: Arc<EngineCounters>,
    provisioner: Arc<Provisioner>,
    /// Modules waiting on the job currently running for each hash.
    in_flight: Mutex<HashMap<ContentHash, Vec<Weak<LoadedModule>>>>,
}

/// Owner of the compile thread pool.
pub(crate) struct BackgroundCompiler {
    pool: ThreadPool,
    shared: Arc<CompilerShared>,
}

impl BackgroundCompiler {
    pub(crate) fn new(
        threads: usize,
        backend: Arc<dyn NativeBackend>,
        cache: Arc<NativeCodeCache>,
        counters: Arc<EngineCounters>,
        provisioner: Arc<Provisioner>,
    ) -> Result<Self, EngineError> {
        let pool = ThreadPoolBuilder::new()
            .num_threads(threads.max(1))
            .thread_name(|i| format!("udf-compile-{i}"))
            .build()
            .map_err(|e| EngineError::CompilePool(e.to_string()))?;
        Ok(Self {
            pool,
            shared: Arc::new(CompilerShared {
                backend,
                cache,
                counters,
                provisioner,
                in_flight: Mutex::new(HashMap::new()),
            }),
        })
    }

    pub(crate) fn backend(&self) -> &Arc<dyn NativeBackend> {
        &self.shared.backend
    }

    /// Queue native compilation for a module already in `Compiling`.
    pub(crate) fn schedule(&self, module: &Arc<LoadedModule>) {
        let hash = module.descriptor().content_hash();
        {
            let mut in_flight = self.shared.in_flight.lock();
            if let Some(waiters) = in_flight.get_mut(&hash) {
                waiters.push(Arc::downgrade(module));
                EngineCounters::bump(&self.shared.counters.compilations_coalesced);
                debug!(target: "quidditch_udf::compile", module = %module.key(), hash = %hash.short(), "Joined in-flight compilation");
                return;
            }
            in_flight.insert(hash, vec![Arc::downgrade(module)]);
        }

        let shared = Arc::clone(&self.shared);
        let bytecode = Arc::clone(module.descriptor().bytecode());
        let origin = module.key().to_string();
        debug!(target: "quidditch_udf::compile", module = %origin, hash = %hash.short(), "Compilation scheduled");
        self.pool.spawn(move || shared.run(hash, &bytecode, &origin));
    }

    /// Number of hashes with a job queued or running.
    pub(crate) fn pending(&self) -> usize {
        self.shared.in_flight.lock().len()
    }
}

impl CompilerShared {
    fn run(&self, hash: ContentHash, bytecode: &[u8], origin: &str) {
        let started = Instant::now();
        let backend = self.backend.name();

        // An earlier job for this hash may have finished after the
        // registration's own lookup missed.
        let (artifact, from_cache): (Arc<[u8]>, bool) = match self.cache.lookup(&hash) {
            Some(cached) => (cached.bytes, true),
            None => {
                EngineCounters::bump(&self.counters.compilations_started);
                match self.backend.compile(bytecode) {
                    Ok(bytes) => {
                        EngineCounters::bump(&self.counters.compilations_succeeded);
                        let bytes: Arc<[u8]> = bytes.into();
                        if let Err(e) = self.cache.store(hash, &bytes, origin, backend) {
                            warn!(target: "quidditch_udf::compile", module = %origin, error = %e, "Failed to persist native artifact");
                        }
                        (bytes, false)
                    }
                    Err(e) => {
                        EngineCounters::bump(&self.counters.compilations_failed);
                        let elapsed_ms = started.elapsed().as_millis() as u64;
                        for module in self.take_waiters(&hash) {
                            warn!(target: "quidditch_udf::compile", module = %module.key(), error = %e, "Native compilation failed, staying on interpreter");
                            Self::mark_failed(&module, &e, elapsed_ms);
                        }
                        return;
                    }
                }
            }
        };

        let elapsed_ms = started.elapsed().as_millis() as u64;
        for module in self.take_waiters(&hash) {
            self.install(&module, hash, &artifact, origin, from_cache, elapsed_ms);
        }
    }

    fn take_waiters(&self, hash: &ContentHash) -> Vec<Arc<LoadedModule>> {
        self.in_flight
            .lock()
            .remove(hash)
            .unwrap_or_default()
            .iter()
            .filter_map(Weak::upgrade)
            .collect()
    }

    fn install(
        &self,
        module: &LoadedModule,
        hash: ContentHash,
        artifact: &[u8],
        origin: &str,
        from_cache: bool,
        elapsed_ms: u64,
    ) {
        if module.is_finalized() {
            module.settle();
            return;
        }
        let backend = self.backend.name();
        let cache_ref = match self.cache.store_and_acquire(hash, artifact, origin, backend) {
            Ok(_) => true,
            Err(e) => {
                warn!(target: "quidditch_udf::compile", module = %module.key(), error = %e, "Native artifact not cached");
                false
            }
        };

        match self
            .provisioner
            .native_pool(self.backend.as_ref(), module.descriptor(), artifact)
        {
            Ok(pool) => {
                if module.install_native(pool, cache_ref) {
                    EngineCounters::bump(&self.counters.hot_swaps);
                    info!(target: "quidditch_udf::compile", module = %module.key(), backend, elapsed_ms, from_cache, "Module promoted to native tier");
                }
                module.stats().update_compile(|c| {
                    c.status = CompileStatus::Succeeded;
                    c.duration_ms = Some(elapsed_ms);
                    c.from_cache = from_cache;
                    c.error = None;
                });
            }
            Err(e) => {
                if cache_ref {
                    self.cache.release(&hash);
                }
                warn!(target: "quidditch_udf::compile", module = %module.key(), error = %e, "Native artifact failed to load, staying on interpreter");
                Self::mark_failed(module, &e, elapsed_ms);
            }
        }
        module.settle();
    }

    fn mark_failed(module: &LoadedModule, error: &CompileError, elapsed_ms: u64) {
        module.stats().update_compile(|c| {
            c.status = CompileStatus::Failed;
            c.duration_ms = Some(elapsed_ms);
            c.error = Some(error.to_string());
        });
        module.settle();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ModuleDescriptor;
    use crate::error::ExecError;
    use crate::stats::CompileDiagnostics;
    use crate::tier::{ExecutionMode, RawResults, Tier, TierInstance};
    use crate::value::{ValueType, WasmValue};
    use parking_lot::Mutex as PlMutex;
    use smallvec::smallvec;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct Const;

    impl TierInstance for Const {
        fn call(&mut self, _args: &[WasmValue]) -> Result<RawResults, ExecError> {
            Ok(smallvec![WasmValue::F64(1.0)])
        }
    }

    impl InstanceFactory for Const {
        fn tier(&self) -> Tier {
            Tier::Native
        }

        fn instantiate(&self) -> Result<Box<dyn TierInstance>, ExecError> {
            Ok(Box::new(Const))
        }
    }

    /// Counts compiles; blocks each compile until the gate opens.
    struct GatedBackend {
        compiles: AtomicUsize,
        gate: PlMutex<()>,
        fail: bool,
    }

    impl NativeBackend for GatedBackend {
        fn name(&self) -> &'static str {
            "gated"
        }

        fn compile(&self, wasm: &[u8]) -> Result<Vec<u8>, CompileError> {
            let _open = self.gate.lock();
            self.compiles.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(CompileError::Codegen("refused".into()));
            }
            Ok(wasm.to_vec())
        }

        fn load(&self, _artifact: &[u8], _spec: InstanceSpec) -> Result<Arc<dyn InstanceFactory>, CompileError> {
            Ok(Arc::new(Const))
        }
    }

    fn interp_factory() -> Arc<dyn InstanceFactory> {
        struct Interp;
        impl InstanceFactory for Interp {
            fn tier(&self) -> Tier {
                Tier::Interpreter
            }
            fn instantiate(&self) -> Result<Box<dyn TierInstance>, ExecError> {
                Ok(Box::new(Const))
            }
        }
        Arc::new(Interp)
    }

    struct Fixture {
        compiler: BackgroundCompiler,
        backend: Arc<GatedBackend>,
        cache: Arc<NativeCodeCache>,
        counters: Arc<EngineCounters>,
        provisioner: Arc<Provisioner>,
    }

    fn fixture(fail: bool) -> Fixture {
        let backend = Arc::new(GatedBackend {
            compiles: AtomicUsize::new(0),
            gate: PlMutex::new(()),
            fail,
        });
        let cache = Arc::new(NativeCodeCache::in_memory(1 << 20));
        let counters = Arc::new(EngineCounters::default());
        let provisioner = Arc::new(Provisioner::new(
            EngineConfig::in_memory(),
            Arc::new(ContextRegistry::new()),
        ));
        let compiler = BackgroundCompiler::new(
            2,
            Arc::clone(&backend) as Arc<dyn NativeBackend>,
            Arc::clone(&cache),
            Arc::clone(&counters),
            Arc::clone(&provisioner),
        )
        .unwrap();
        Fixture {
            compiler,
            backend,
            cache,
            counters,
            provisioner,
        }
    }

    fn module(f: &Fixture, name: &str) -> Arc<LoadedModule> {
        let desc = Arc::new(
            ModuleDescriptor::builder(name, "1", "run", b"\0asm same bytes".to_vec())
                .returns(ValueType::F64)
                .build(),
        );
        let pool = f.provisioner.pool(&desc, interp_factory());
        let m = Arc::new(LoadedModule::interpreted(
            desc,
            pool,
            Arc::clone(&f.cache),
            CompileDiagnostics::new(CompileStatus::Pending, Some("gated")),
            false,
        ));
        assert!(m.begin_compile());
        m
    }

    #[test]
    fn test_identical_bytecode_compiles_once() {
        let f = fixture(false);
        let gate = f.backend.gate.lock();
        let a = module(&f, "a");
        let b = module(&f, "b");
        f.compiler.schedule(&a);
        f.compiler.schedule(&b);
        drop(gate);

        assert!(a.wait_settled(Duration::from_secs(10)));
        assert!(b.wait_settled(Duration::from_secs(10)));
        assert_eq!(a.mode(), ExecutionMode::Native);
        assert_eq!(b.mode(), ExecutionMode::Native);
        assert_eq!(f.backend.compiles.load(Ordering::SeqCst), 1);

        let stats = f.counters.snapshot();
        assert_eq!(stats.compilations_started, 1);
        assert_eq!(stats.compilations_coalesced, 1);
        assert_eq!(stats.hot_swaps, 2);
        assert_eq!(f.cache.refcount(&a.descriptor().content_hash()), 2);
        assert_eq!(f.compiler.pending(), 0);
    }

    #[test]
    fn test_failure_keeps_interpreter() {
        let f = fixture(true);
        let m = module(&f, "a");
        f.compiler.schedule(&m);
        assert!(m.wait_settled(Duration::from_secs(10)));
        assert_eq!(m.mode(), ExecutionMode::Compiling);
        let diag = m.stats().compile_diagnostics();
        assert_eq!(diag.status, CompileStatus::Failed);
        assert!(diag.error.unwrap().contains("refused"));
        assert!(!f.cache.contains(&m.descriptor().content_hash()));
        assert_eq!(f.counters.snapshot().compilations_failed, 1);
    }

    #[test]
    fn test_cached_artifact_skips_compile() {
        let f = fixture(false);
        let m = module(&f, "a");
        f.cache
            .store(m.descriptor().content_hash(), b"prebuilt", "other@1", "gated")
            .unwrap();
        f.compiler.schedule(&m);
        assert!(m.wait_settled(Duration::from_secs(10)));
        assert_eq!(m.mode(), ExecutionMode::Native);
        assert_eq!(f.backend.compiles.load(Ordering::SeqCst), 0);
        assert!(m.stats().compile_diagnostics().from_cache);
    }
}
