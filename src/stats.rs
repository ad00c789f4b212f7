//! Per-module execution statistics and engine-wide counters.
//!
//! Counters are plain atomics updated after every call. The last-error slot
//! is a short mutex taken only on the error path.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;
use serde::Serialize;

use crate::descriptor::{ContentHash, ModuleKey};
use crate::pool::PoolStats;
use crate::tier::{ExecutionMode, Tier};

pub(crate) fn unix_millis(t: SystemTime) -> u64 {
    t.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

pub(crate) fn now_millis() -> u64 {
    unix_millis(SystemTime::now())
}

/// Most recent failure of a module.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LastError {
    pub message: String,
    pub at_unix_ms: u64,
}

/// Outcome of background compilation for one registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompileStatus {
    /// No native backend or background compilation switched off
    Disabled,
    /// Queued or running
    Pending,
    Succeeded,
    /// Stuck on the interpreter for this registration
    Failed,
}

/// What operators need to spot a module that never reached native code.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompileDiagnostics {
    pub status: CompileStatus,
    pub backend: Option<&'static str>,
    /// Artifact came from the native code cache.
    pub from_cache: bool,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

impl CompileDiagnostics {
    pub(crate) fn new(status: CompileStatus, backend: Option<&'static str>) -> Self {
        Self {
            status,
            backend,
            from_cache: false,
            duration_ms: None,
            error: None,
        }
    }
}

#[derive(Debug, Default)]
struct TierCounters {
    calls: AtomicU64,
    total_ns: AtomicU64,
}

/// Live counters of one registered module.
#[derive(Debug)]
pub struct ModuleStats {
    calls: AtomicU64,
    errors: AtomicU64,
    total_ns: AtomicU64,
    min_ns: AtomicU64,
    max_ns: AtomicU64,
    last_call_ms: AtomicU64,
    field_reads: AtomicU64,
    interpreter: TierCounters,
    native: TierCounters,
    last_error: Mutex<Option<LastError>>,
    compile: Mutex<CompileDiagnostics>,
    registered_at: SystemTime,
}

impl ModuleStats {
    pub fn new(compile: CompileDiagnostics) -> Self {
        Self {
            calls: AtomicU64::new(0),
            errors: AtomicU64::new(0),
            total_ns: AtomicU64::new(0),
            min_ns: AtomicU64::new(u64::MAX),
            max_ns: AtomicU64::new(0),
            last_call_ms: AtomicU64::new(0),
            field_reads: AtomicU64::new(0),
            interpreter: TierCounters::default(),
            native: TierCounters::default(),
            last_error: Mutex::new(None),
            compile: Mutex::new(compile),
            registered_at: SystemTime::now(),
        }
    }

    pub fn registered_at(&self) -> SystemTime {
        self.registered_at
    }

    /// Record a call that reached a tier.
    pub fn record_execution(&self, tier: Tier, elapsed: Duration, field_reads: u64, error: Option<&str>) {
        let ns = elapsed.as_nanos().min(u64::MAX as u128) as u64;
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.min_ns.fetch_min(ns, Ordering::Relaxed);
        self.max_ns.fetch_max(ns, Ordering::Relaxed);
        self.field_reads.fetch_add(field_reads, Ordering::Relaxed);
        let counters = match tier {
            Tier::Interpreter => &self.interpreter,
            Tier::Native => &self.native,
        };
        counters.calls.fetch_add(1, Ordering::Relaxed);
        counters.total_ns.fetch_add(ns, Ordering::Relaxed);
        self.last_call_ms.store(now_millis(), Ordering::Relaxed);
        if let Some(message) = error {
            self.record_error_only(message);
        }
    }

    /// Record a call rejected before any guest code ran.
    pub fn record_rejection(&self, message: &str) {
        self.calls.fetch_add(1, Ordering::Relaxed);
        self.last_call_ms.store(now_millis(), Ordering::Relaxed);
        self.record_error_only(message);
    }

    fn record_error_only(&self, message: &str) {
        self.errors.fetch_add(1, Ordering::Relaxed);
        *self.last_error.lock() = Some(LastError {
            message: message.to_owned(),
            at_unix_ms: now_millis(),
        });
    }

    pub(crate) fn update_compile(&self, f: impl FnOnce(&mut CompileDiagnostics)) {
        f(&mut self.compile.lock());
    }

    pub fn compile_diagnostics(&self) -> CompileDiagnostics {
        self.compile.lock().clone()
    }

    pub fn snapshot(&self, key: &ModuleKey, content_hash: ContentHash, mode: ExecutionMode) -> ExecutionStats {
        let calls = self.calls.load(Ordering::Relaxed);
        let errors = self.errors.load(Ordering::Relaxed);
        let interpreter = TierStats::from_counters(&self.interpreter);
        let native = TierStats::from_counters(&self.native);
        let timed = interpreter.calls + native.calls;
        let total_ns = self.total_ns.load(Ordering::Relaxed);
        let last_call = self.last_call_ms.load(Ordering::Relaxed);
        ExecutionStats {
            key: key.clone(),
            content_hash,
            mode,
            call_count: calls,
            error_count: errors,
            error_rate: if calls == 0 { 0.0 } else { errors as f64 / calls as f64 },
            total_ns,
            min_ns: if timed == 0 { 0 } else { self.min_ns.load(Ordering::Relaxed) },
            max_ns: self.max_ns.load(Ordering::Relaxed),
            avg_ns: if timed == 0 { 0 } else { total_ns / timed },
            last_call_unix_ms: (last_call != 0).then_some(last_call),
            last_error: self.last_error.lock().clone(),
            field_reads: self.field_reads.load(Ordering::Relaxed),
            registered_at_unix_ms: unix_millis(self.registered_at),
            interpreter,
            native,
            compile: self.compile_diagnostics(),
            interpreter_pool: None,
            native_pool: None,
        }
    }
}

/// Per-tier share of the traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TierStats {
    pub calls: u64,
    pub avg_ns: u64,
}

impl TierStats {
    fn from_counters(c: &TierCounters) -> Self {
        let calls = c.calls.load(Ordering::Relaxed);
        let total = c.total_ns.load(Ordering::Relaxed);
        Self {
            calls,
            avg_ns: if calls == 0 { 0 } else { total / calls },
        }
    }
}

/// Snapshot returned by `UdfEngine::stats`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecutionStats {
    pub key: ModuleKey,
    pub content_hash: ContentHash,
    pub mode: ExecutionMode,
    pub call_count: u64,
    pub error_count: u64,
    pub error_rate: f64,
    pub total_ns: u64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub avg_ns: u64,
    pub last_call_unix_ms: Option<u64>,
    pub last_error: Option<LastError>,
    pub field_reads: u64,
    pub registered_at_unix_ms: u64,
    pub interpreter: TierStats,
    pub native: TierStats,
    pub compile: CompileDiagnostics,
    pub interpreter_pool: Option<PoolStats>,
    pub native_pool: Option<PoolStats>,
}

impl ExecutionStats {
    pub fn avg_duration(&self) -> Duration {
        Duration::from_nanos(self.avg_ns)
    }

    pub fn tier(&self, tier: Tier) -> TierStats {
        match tier {
            Tier::Interpreter => self.interpreter,
            Tier::Native => self.native,
        }
    }
}

/// Engine-wide counters, lock-free.
#[derive(Debug, Default)]
pub struct EngineCounters {
    pub(crate) registrations: AtomicU64,
    pub(crate) unregistrations: AtomicU64,
    pub(crate) compilations_started: AtomicU64,
    pub(crate) compilations_succeeded: AtomicU64,
    pub(crate) compilations_failed: AtomicU64,
    pub(crate) compilations_coalesced: AtomicU64,
    pub(crate) cache_hits: AtomicU64,
    pub(crate) cache_misses: AtomicU64,
    pub(crate) hot_swaps: AtomicU64,
}

impl EngineCounters {
    #[inline]
    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> EngineStats {
        EngineStats {
            registrations: self.registrations.load(Ordering::Relaxed),
            unregistrations: self.unregistrations.load(Ordering::Relaxed),
            compilations_started: self.compilations_started.load(Ordering::Relaxed),
            compilations_succeeded: self.compilations_succeeded.load(Ordering::Relaxed),
            compilations_failed: self.compilations_failed.load(Ordering::Relaxed),
            compilations_coalesced: self.compilations_coalesced.load(Ordering::Relaxed),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            hot_swaps: self.hot_swaps.load(Ordering::Relaxed),
        }
    }
}

/// Snapshot of [`EngineCounters`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub registrations: u64,
    pub unregistrations: u64,
    pub compilations_started: u64,
    pub compilations_succeeded: u64,
    pub compilations_failed: u64,
    /// Registrations that joined a compile already running for the same hash.
    pub compilations_coalesced: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
    pub hot_swaps: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snapshot(stats: &ModuleStats) -> ExecutionStats {
        stats.snapshot(&ModuleKey::new("m", "1"), ContentHash::of(b"m"), ExecutionMode::Interpreted)
    }

    #[test]
    fn test_empty_stats() {
        let stats = ModuleStats::new(CompileDiagnostics::new(CompileStatus::Pending, None));
        let snap = snapshot(&stats);
        assert_eq!(snap.call_count, 0);
        assert_eq!(snap.min_ns, 0);
        assert_eq!(snap.avg_ns, 0);
        assert_eq!(snap.error_rate, 0.0);
        assert_eq!(snap.last_call_unix_ms, None);
        assert_eq!(snap.compile.status, CompileStatus::Pending);
    }

    #[test]
    fn test_aggregates() {
        let stats = ModuleStats::new(CompileDiagnostics::new(CompileStatus::Pending, None));
        stats.record_execution(Tier::Interpreter, Duration::from_micros(30), 2, None);
        stats.record_execution(Tier::Interpreter, Duration::from_micros(10), 1, None);
        stats.record_execution(Tier::Native, Duration::from_micros(2), 0, Some("trap"));
        stats.record_rejection("missing parameter 'boost'");

        let snap = snapshot(&stats);
        assert_eq!(snap.call_count, 4);
        assert_eq!(snap.error_count, 2);
        assert_eq!(snap.error_rate, 0.5);
        assert_eq!(snap.min_ns, 2_000);
        assert_eq!(snap.max_ns, 30_000);
        assert_eq!(snap.total_ns, 42_000);
        assert_eq!(snap.avg_ns, 14_000);
        assert_eq!(snap.field_reads, 3);
        assert_eq!(snap.interpreter, TierStats { calls: 2, avg_ns: 20_000 });
        assert_eq!(snap.native, TierStats { calls: 1, avg_ns: 2_000 });
        assert_eq!(
            snap.last_error.map(|e| e.message),
            Some("missing parameter 'boost'".to_string())
        );
        assert!(snap.last_call_unix_ms.is_some());
    }

    #[test]
    fn test_last_error_survives_contention() {
        let stats = std::sync::Arc::new(ModuleStats::new(CompileDiagnostics::new(CompileStatus::Pending, None)));
        stats.record_rejection("first");

        // A reader is holding the slot while the error arrives.
        let held = stats.last_error.lock();
        let writer = {
            let stats = std::sync::Arc::clone(&stats);
            std::thread::spawn(move || stats.record_rejection("second"))
        };
        std::thread::sleep(Duration::from_millis(20));
        drop(held);
        writer.join().unwrap();

        let snap = snapshot(&stats);
        assert_eq!(snap.error_count, 2);
        assert_eq!(snap.last_error.map(|e| e.message), Some("second".to_string()));
    }

    #[test]
    fn test_compile_diagnostics_update() {
        let stats = ModuleStats::new(CompileDiagnostics::new(CompileStatus::Pending, Some("test")));
        stats.update_compile(|d| {
            d.status = CompileStatus::Failed;
            d.error = Some("unsupported".into());
        });
        let diag = stats.compile_diagnostics();
        assert_eq!(diag.status, CompileStatus::Failed);
        assert_eq!(diag.backend, Some("test"));
        assert_eq!(diag.error.as_deref(), Some("unsupported"));
    }
}
