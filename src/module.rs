//! A registered module version and its hot-swap dispatcher.
//!
//! ```text
//!   invoke ──> enter (in_flight += 1, refuse if draining)
//!                │
//!                ├─ mode.load(Acquire) == Native ──> native pool (OnceLock)
//!                └─ otherwise ─────────────────────> interpreter pool
//!
//!   compiler ──> native.set(pool) ──> mode.publish_native() (Release)
//!                                 ──> interpreter.close()
//! ```
//!
//! The live pool is never mutated in place: the native pool is fully built
//! before the mode byte flips, and the interpreter pool is only retired after.
//! Calls already running on the interpreter finish normally and their
//! instances are dropped on return.
//!
//! Teardown is deferred: `begin_drain` refuses new calls and whichever of the
//! drainer or the last in-flight call observes `in_flight == 0` runs the
//! (idempotent) finalizer.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;
use tracing::{debug, trace};

use crate::binding::{bind, convert_results, ParameterMap};
use crate::cache::NativeCodeCache;
use crate::context::{CallContext, ContextRegistry, DocumentContext};
use crate::descriptor::{ContentHash, ModuleDescriptor, ModuleKey, ModuleMetadata, ParamSpec};
use crate::error::{ExecError, ExecResult};
use crate::pool::InstancePool;
use crate::stats::{unix_millis, CompileDiagnostics, ExecutionStats, ModuleStats};
use crate::tier::{ExecutionMode, ModeCell, Tier};
use crate::value::{Value, ValueType};

/// Result of one invocation with routing details.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Invocation {
    pub values: Vec<Value>,
    pub tier: Tier,
    pub elapsed: Duration,
}

/// Discovery view of a registered module.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ModuleInfo {
    pub key: ModuleKey,
    pub entry_point: String,
    pub params: Vec<ParamSpec>,
    pub returns: Vec<ValueType>,
    pub content_hash: ContentHash,
    pub bytecode_len: usize,
    pub metadata: ModuleMetadata,
    pub mode: ExecutionMode,
    pub registered_at_unix_ms: u64,
}

pub(crate) struct LoadedModule {
    descriptor: Arc<ModuleDescriptor>,
    mode: ModeCell,
    /// `None` when the module went straight to native from the cache.
    interpreter: Option<Arc<InstancePool>>,
    native: OnceLock<Arc<InstancePool>>,
    stats: ModuleStats,
    cache: Arc<NativeCodeCache>,

    in_flight: AtomicUsize,
    draining: AtomicBool,
    finalized: AtomicBool,
    /// This registration holds a reference on its cache entry.
    holds_cache_ref: AtomicBool,

    /// Set once compilation can no longer change the mode.
    settled: Mutex<bool>,
    settled_cv: Condvar,
}

impl LoadedModule {
    /// A module served by the interpreter until background compilation lands.
    pub(crate) fn interpreted(
        descriptor: Arc<ModuleDescriptor>,
        pool: Arc<InstancePool>,
        cache: Arc<NativeCodeCache>,
        compile: CompileDiagnostics,
        settled: bool,
    ) -> Self {
        Self::new(descriptor, ExecutionMode::Interpreted, Some(pool), cache, compile, settled)
    }

    /// A module whose native artifact was already cached. `cache_ref` says
    /// whether the caller took a cache reference on its behalf.
    pub(crate) fn native(
        descriptor: Arc<ModuleDescriptor>,
        pool: Arc<InstancePool>,
        cache: Arc<NativeCodeCache>,
        compile: CompileDiagnostics,
        cache_ref: bool,
    ) -> Self {
        let module = Self::new(descriptor, ExecutionMode::Native, None, cache, compile, true);
        let _ = module.native.set(pool);
        module.holds_cache_ref.store(cache_ref, Ordering::SeqCst);
        module
    }

    fn new(
        descriptor: Arc<ModuleDescriptor>,
        mode: ExecutionMode,
        interpreter: Option<Arc<InstancePool>>,
        cache: Arc<NativeCodeCache>,
        compile: CompileDiagnostics,
        settled: bool,
    ) -> Self {
        Self {
            descriptor,
            mode: ModeCell::new(mode),
            interpreter,
            native: OnceLock::new(),
            stats: ModuleStats::new(compile),
            cache,
            in_flight: AtomicUsize::new(0),
            draining: AtomicBool::new(false),
            finalized: AtomicBool::new(false),
            holds_cache_ref: AtomicBool::new(false),
            settled: Mutex::new(settled),
            settled_cv: Condvar::new(),
        }
    }

    #[inline]
    pub(crate) fn descriptor(&self) -> &Arc<ModuleDescriptor> {
        &self.descriptor
    }

    #[inline]
    pub(crate) fn key(&self) -> &ModuleKey {
        self.descriptor.key()
    }

    #[inline]
    pub(crate) fn mode(&self) -> ExecutionMode {
        self.mode.load()
    }

    pub(crate) fn stats(&self) -> &ModuleStats {
        &self.stats
    }

    pub(crate) fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Claim the `Interpreted → Compiling` transition.
    pub(crate) fn begin_compile(&self) -> bool {
        self.mode.begin_compile()
    }

    // ========================================================================
    // Dispatch
    // ========================================================================

    /// Run one call against whichever tier is live.
    pub(crate) fn invoke(
        &self,
        contexts: &ContextRegistry,
        document: DocumentContext,
        params: &ParameterMap,
    ) -> ExecResult<Invocation> {
        let _call = self.enter()?;

        let mut bound = match bind(&self.descriptor, params) {
            Ok(bound) => bound,
            Err(e) => {
                self.stats.record_rejection(&e.to_string());
                return Err(e);
            }
        };

        let pool = self
            .live_pool()
            .inspect_err(|e| self.stats.record_rejection(&e.to_string()))?;
        let mut instance = match pool.checkout() {
            Ok(instance) => instance,
            Err(e @ ExecError::PoolExhausted { .. }) if pool.is_closed() => {
                // Retired mid-checkout by a hot swap; the native pool is installed.
                trace!(target: "quidditch_udf::pool", module = %self.key(), error = %e, "Retrying checkout after swap");
                match self.native.get() {
                    Some(native) => native.checkout().inspect_err(|e| self.stats.record_rejection(&e.to_string()))?,
                    None => {
                        self.stats.record_rejection(&e.to_string());
                        return Err(e);
                    }
                }
            }
            Err(e) => {
                self.stats.record_rejection(&e.to_string());
                return Err(e);
            }
        };
        let tier = instance.tier();

        let guard = contexts.register(CallContext::new(document, std::mem::take(&mut bound.strings)));
        let args = bound.arguments(guard.id());
        let started = Instant::now();
        let raw = instance.call(&args);
        let elapsed = started.elapsed();
        let field_reads = guard.context().field_reads();
        drop(guard);
        drop(instance);

        let result = raw.and_then(|raw| convert_results(self.descriptor.returns(), &raw));
        match &result {
            Ok(_) => self.stats.record_execution(tier, elapsed, field_reads, None),
            Err(e) => {
                trace!(target: "quidditch_udf::registry", module = %self.key(), %tier, error = %e, "Call failed");
                self.stats
                    .record_execution(tier, elapsed, field_reads, Some(&e.to_string()))
            }
        }
        result.map(|values| Invocation { values, tier, elapsed })
    }

    fn live_pool(&self) -> ExecResult<&Arc<InstancePool>> {
        let native = || self.native.get();
        let pool = match self.mode.load() {
            ExecutionMode::Native => native().or(self.interpreter.as_ref()),
            _ => match &self.interpreter {
                Some(interp) if interp.is_closed() => native().or(Some(interp)),
                Some(interp) => Some(interp),
                None => native(),
            },
        };
        pool.ok_or_else(|| ExecError::Instantiation(format!("module {} has no live tier", self.key())))
    }

    fn enter(&self) -> ExecResult<CallGuard<'_>> {
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let guard = CallGuard { module: self };
        if self.draining.load(Ordering::SeqCst) {
            let err = ExecError::Draining(self.key().clone());
            self.stats.record_rejection(&err.to_string());
            return Err(err);
        }
        Ok(guard)
    }

    fn exit(&self) {
        if self.in_flight.fetch_sub(1, Ordering::SeqCst) == 1 && self.draining.load(Ordering::SeqCst) {
            self.finalize();
        }
    }

    // ========================================================================
    // Hot swap
    // ========================================================================

    /// Install a fully built native pool and flip the mode.
    ///
    /// `cache_ref` says whether a cache reference was taken for this module;
    /// it is released at finalization (or right away if the module is
    /// already gone).
    pub(crate) fn install_native(&self, pool: Arc<InstancePool>, cache_ref: bool) -> bool {
        if cache_ref {
            self.holds_cache_ref.store(true, Ordering::SeqCst);
        }
        let installed = self.native.set(Arc::clone(&pool)).is_ok() && self.mode.publish_native();
        if let Some(interp) = &self.interpreter {
            interp.close();
        }
        if self.finalized.load(Ordering::SeqCst) {
            pool.close();
            self.release_cache_ref();
        }
        installed
    }

    /// Record that the mode will not change any more and wake waiters.
    pub(crate) fn settle(&self) {
        let mut settled = self.settled.lock();
        *settled = true;
        self.settled_cv.notify_all();
    }

    /// Block until compilation settles or `timeout` elapses.
    pub(crate) fn wait_settled(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut settled = self.settled.lock();
        while !*settled {
            if self.settled_cv.wait_until(&mut settled, deadline).timed_out() {
                return *settled;
            }
        }
        true
    }

    // ========================================================================
    // Teardown
    // ========================================================================

    /// Refuse new calls; finalize now if nothing is running.
    pub(crate) fn begin_drain(&self) {
        self.draining.store(true, Ordering::SeqCst);
        if self.in_flight.load(Ordering::SeqCst) == 0 {
            self.finalize();
        }
    }

    fn finalize(&self) {
        if self.finalized.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(interp) = &self.interpreter {
            interp.close();
        }
        if let Some(native) = self.native.get() {
            native.close();
        }
        self.release_cache_ref();
        self.settle();
        debug!(target: "quidditch_udf::registry", module = %self.key(), "Module finalized");
    }

    fn release_cache_ref(&self) {
        if self.holds_cache_ref.swap(false, Ordering::SeqCst) {
            self.cache.release(&self.descriptor.content_hash());
        }
    }

    pub(crate) fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::SeqCst)
    }

    // ========================================================================
    // Views
    // ========================================================================

    pub(crate) fn snapshot(&self) -> ExecutionStats {
        let mut stats = self
            .stats
            .snapshot(self.key(), self.descriptor.content_hash(), self.mode());
        stats.interpreter_pool = self.interpreter.as_ref().map(|p| p.stats());
        stats.native_pool = self.native.get().map(|p| p.stats());
        stats
    }

    pub(crate) fn info(&self) -> ModuleInfo {
        let desc = &self.descriptor;
        ModuleInfo {
            key: desc.key().clone(),
            entry_point: desc.entry_point().to_owned(),
            params: desc.params().to_vec(),
            returns: desc.returns().to_vec(),
            content_hash: desc.content_hash(),
            bytecode_len: desc.bytecode().len(),
            metadata: desc.metadata().clone(),
            mode: self.mode(),
            registered_at_unix_ms: unix_millis(self.stats.registered_at()),
        }
    }
}

struct CallGuard<'a> {
    module: &'a LoadedModule,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.module.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ParamSpec;
    use crate::stats::CompileStatus;
    use crate::tier::{InstanceFactory, RawResults, TierInstance};
    use crate::value::WasmValue;
    use smallvec::smallvec;

    /// Returns `args[1] * tier_factor` so tests can tell tiers apart.
    struct Scale(f64);

    impl TierInstance for Scale {
        fn call(&mut self, args: &[WasmValue]) -> Result<RawResults, ExecError> {
            match args.get(1) {
                Some(WasmValue::F64(v)) => Ok(smallvec![WasmValue::F64(v * self.0)]),
                _ => Err(ExecError::Host("bad args".into())),
            }
        }
    }

    struct ScaleFactory(Tier, f64);

    impl InstanceFactory for ScaleFactory {
        fn tier(&self) -> Tier {
            self.0
        }

        fn instantiate(&self) -> Result<Box<dyn TierInstance>, ExecError> {
            Ok(Box::new(Scale(self.1)))
        }
    }

    fn pool(tier: Tier, factor: f64) -> Arc<InstancePool> {
        Arc::new(InstancePool::new(
            ModuleKey::new("m", "1"),
            Arc::new(ScaleFactory(tier, factor)),
            2,
            4,
            Duration::from_millis(5),
        ))
    }

    fn module() -> LoadedModule {
        let desc = ModuleDescriptor::builder("m", "1", "run", b"\0asm".to_vec())
            .param(ParamSpec::required("x", ValueType::F64))
            .returns(ValueType::F64)
            .build();
        LoadedModule::interpreted(
            Arc::new(desc),
            pool(Tier::Interpreter, 1.0),
            Arc::new(NativeCodeCache::in_memory(1 << 20)),
            CompileDiagnostics::new(CompileStatus::Pending, Some("test")),
            false,
        )
    }

    fn x(v: f64) -> ParameterMap {
        [("x".to_string(), Value::F64(v))].into_iter().collect()
    }

    #[test]
    fn test_dispatch_follows_mode() {
        let contexts = ContextRegistry::new();
        let m = module();
        let out = m.invoke(&contexts, DocumentContext::bare("d", 0.0), &x(2.0)).unwrap();
        assert_eq!(out.tier, Tier::Interpreter);
        assert_eq!(out.values, vec![Value::F64(2.0)]);

        assert!(m.begin_compile());
        assert!(m.install_native(pool(Tier::Native, 10.0), false));
        assert_eq!(m.mode(), ExecutionMode::Native);
        let out = m.invoke(&contexts, DocumentContext::bare("d", 0.0), &x(2.0)).unwrap();
        assert_eq!(out.tier, Tier::Native);
        assert_eq!(out.values, vec![Value::F64(20.0)]);

        let stats = m.snapshot();
        assert_eq!(stats.call_count, 2);
        assert_eq!(stats.interpreter.calls, 1);
        assert_eq!(stats.native.calls, 1);
        assert!(stats.interpreter_pool.is_some());
        assert!(contexts.is_empty());
    }

    #[test]
    fn test_binding_error_counts_once() {
        let contexts = ContextRegistry::new();
        let m = module();
        let err = m
            .invoke(&contexts, DocumentContext::bare("d", 0.0), &ParameterMap::new())
            .unwrap_err();
        assert_eq!(err, ExecError::MissingParameter("x".into()));
        let stats = m.snapshot();
        assert_eq!(stats.call_count, 1);
        assert_eq!(stats.error_count, 1);
        assert_eq!(stats.interpreter.calls, 0);
        assert_eq!(m.in_flight(), 0);
    }

    #[test]
    fn test_drain_refuses_new_calls() {
        let contexts = ContextRegistry::new();
        let m = module();
        m.begin_drain();
        assert!(m.is_finalized());
        assert_eq!(
            m.invoke(&contexts, DocumentContext::bare("d", 0.0), &x(1.0)),
            Err(ExecError::Draining(ModuleKey::new("m", "1")))
        );
        assert_eq!(m.in_flight(), 0);
        let stats = m.snapshot();
        assert_eq!(stats.call_count, 1);
        assert_eq!(stats.error_count, 1);
        assert!(stats.last_error.unwrap().message.contains("being unregistered"));
    }

    #[test]
    fn test_finalize_waits_for_in_flight_call() {
        let m = module();
        let call = m.enter().unwrap();
        m.begin_drain();
        assert!(!m.is_finalized());
        drop(call);
        assert!(m.is_finalized());
        assert!(m.wait_settled(Duration::ZERO));
    }

    #[test]
    fn test_cache_ref_released_once() {
        let cache = Arc::new(NativeCodeCache::in_memory(1 << 20));
        let desc = Arc::new(
            ModuleDescriptor::builder("m", "1", "run", b"\0asm".to_vec())
                .returns(ValueType::F64)
                .build(),
        );
        let hash = desc.content_hash();
        cache.store_and_acquire(hash, b"artifact", "m@1", "test").unwrap();
        let m = LoadedModule::native(
            desc,
            pool(Tier::Native, 1.0),
            Arc::clone(&cache),
            CompileDiagnostics::new(CompileStatus::Succeeded, Some("test")),
            true,
        );
        assert_eq!(cache.refcount(&hash), 1);
        m.begin_drain();
        m.begin_drain();
        assert_eq!(cache.refcount(&hash), 0);
        assert!(cache.contains(&hash));
    }

    #[test]
    fn test_wait_settled_times_out() {
        let m = module();
        assert!(!m.wait_settled(Duration::from_millis(5)));
        m.settle();
        assert!(m.wait_settled(Duration::from_millis(5)));
    }
}
