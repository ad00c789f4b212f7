//! Shared fixtures for the integration tests.
//!
//! Every guest module is written in WAT and assembled with the `wat` crate.
//! Entry points take the context id as their first (`i64`) argument.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use quidditch_udf::tier::{InstanceFactory, InstanceSpec};
use quidditch_udf::{
    CompileError, EngineConfig, ModuleDescriptor, NativeBackend, ParamSpec, ParameterMap, UdfEngine, Value,
    ValueType,
};

// ============================================================
// Guest modules
// ============================================================

/// `score(ctx, boost) = get_score(ctx) * boost`
pub const SCORE_BOOST: &str = r#"(module
    (import "env" "get_score" (func $score (param i64) (result f64)))
    (memory (export "memory") 1)
    (func (export "score") (param $ctx i64) (param $boost f64) (result f64)
        (f64.mul (call $score (local.get $ctx)) (local.get $boost))))"#;

/// Returns the document's `value` field after spinning `spin` iterations,
/// so concurrent calls overlap.
pub const FIELD_ECHO: &str = r#"(module
    (import "env" "get_field_f64" (func $field (param i64 i32 i32) (result f64)))
    (memory (export "memory") 1)
    (data (i32.const 0) "value")
    (func (export "echo") (param $ctx i64) (param $spin i32) (result f64)
        (local $i i32)
        (block $done
            (loop $again
                (br_if $done (i32.ge_s (local.get $i) (local.get $spin)))
                (local.set $i (i32.add (local.get $i) (i32.const 1)))
                (br $again)))
        (call $field (local.get $ctx) (i32.const 0) (i32.const 5))))"#;

/// Spin count that keeps a `FIELD_ECHO` call busy for a while on the interpreter.
pub const BUSY_SPIN: i32 = 50_000_000;

/// Reads nested fields: `price.amount * quantity` plus 1.0 if `flags[1]` is true.
pub const NESTED_FIELDS: &str = r#"(module
    (import "env" "get_field_f64" (func $f64 (param i64 i32 i32) (result f64)))
    (import "env" "get_field_i64" (func $i64 (param i64 i32 i32) (result i64)))
    (import "env" "get_field_bool" (func $bool (param i64 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "price.amount")
    (data (i32.const 16) "quantity")
    (data (i32.const 32) "flags[1]")
    (func (export "total") (param $ctx i64) (result f64)
        (f64.add
            (f64.mul
                (call $f64 (local.get $ctx) (i32.const 0) (i32.const 12))
                (f64.convert_i64_s (call $i64 (local.get $ctx) (i32.const 16) (i32.const 8))))
            (f64.convert_i32_s (call $bool (local.get $ctx) (i32.const 32) (i32.const 8))))))"#;

/// Returns the byte length of the `lang` string parameter (or the status code).
pub const STRING_PARAM: &str = r#"(module
    (import "env" "get_param_string" (func $param (param i64 i32 i32 i32 i32) (result i32)))
    (memory (export "memory") 1)
    (data (i32.const 0) "lang")
    (func (export "lang_len") (param $ctx i64) (param $weight f64) (result i32)
        (call $param (local.get $ctx) (i32.const 0) (i32.const 4) (i32.const 64) (i32.const 32))))"#;

/// `div(ctx, d) = 10 / d`, traps on zero.
pub const DIVIDE: &str = r#"(module
    (func (export "div") (param i64 i32) (result i32)
        (i32.div_s (i32.const 10) (local.get 1))))"#;

/// Never terminates; only fuel stops it.
pub const SPIN_FOREVER: &str = r#"(module
    (func (export "spin") (param i64) (result f64)
        (loop $l (br $l))
        (f64.const 0)))"#;

/// Sums `n` terms of a harmonic-like series; enough work per call to make
/// the tiers' speed difference visible.
pub const SERIES: &str = r#"(module
    (import "env" "get_score" (func $score (param i64) (result f64)))
    (func (export "series") (param $ctx i64) (param $n i64) (result f64)
        (local $i i64)
        (local $acc f64)
        (block $done
            (loop $again
                (br_if $done (i64.ge_s (local.get $i) (local.get $n)))
                (local.set $i (i64.add (local.get $i) (i64.const 1)))
                (local.set $acc
                    (f64.add (local.get $acc)
                        (f64.div (f64.const 1) (f64.convert_i64_s (local.get $i)))))
                (br $again)))
        (f64.mul (local.get $acc) (call $score (local.get $ctx)))))"#;

pub fn wasm(wat: &str) -> Vec<u8> {
    wat::parse_str(wat).expect("fixture WAT must assemble")
}

// ============================================================
// Descriptors
// ============================================================

pub fn score_boost(name: &str, version: &str) -> ModuleDescriptor {
    ModuleDescriptor::builder(name, version, "score", wasm(SCORE_BOOST))
        .param(ParamSpec::optional("boost", ValueType::F64).with_default(1.0))
        .returns(ValueType::F64)
        .tag("ranking")
        .category("scoring")
        .author("search-team")
        .build()
}

pub fn field_echo(name: &str) -> ModuleDescriptor {
    ModuleDescriptor::builder(name, "1", "echo", wasm(FIELD_ECHO))
        .param(ParamSpec::optional("spin", ValueType::I32).with_default(0))
        .returns(ValueType::F64)
        .build()
}

pub fn series(name: &str) -> ModuleDescriptor {
    ModuleDescriptor::builder(name, "1", "series", wasm(SERIES))
        .param(ParamSpec::required("n", ValueType::I64))
        .returns(ValueType::F64)
        .build()
}

pub fn params(entries: &[(&str, Value)]) -> ParameterMap {
    entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
}

// ============================================================
// Engines
// ============================================================

pub fn interpreter_engine() -> UdfEngine {
    UdfEngine::builder(EngineConfig::in_memory())
        .interpreter_only()
        .build()
        .expect("engine")
}

pub fn interpreter_engine_with(config: EngineConfig) -> UdfEngine {
    UdfEngine::builder(config).interpreter_only().build().expect("engine")
}

/// Poll `cond` until it holds or `timeout` elapses.
pub fn eventually(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(1));
    }
    cond()
}

// ============================================================
// Instrumented native backend
// ============================================================

/// Wraps another backend, counting compiles and optionally holding,
/// delaying or failing them.
pub struct InstrumentedBackend {
    inner: Arc<dyn NativeBackend>,
    delay: Duration,
    fail: bool,
    compiles: AtomicUsize,
    /// `true` while compiles are held back.
    held: Mutex<bool>,
    released: Condvar,
}

impl InstrumentedBackend {
    pub fn new(inner: Arc<dyn NativeBackend>) -> Self {
        Self {
            inner,
            delay: Duration::ZERO,
            fail: false,
            compiles: AtomicUsize::new(0),
            held: Mutex::new(false),
            released: Condvar::new(),
        }
    }

    /// Block every compile until [`release`](Self::release) is called.
    pub fn held(self) -> Self {
        *self.held.lock() = true;
        self
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.released.notify_all();
    }

    pub fn delayed(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn failing(mut self) -> Self {
        self.fail = true;
        self
    }

    pub fn compiles(&self) -> usize {
        self.compiles.load(Ordering::SeqCst)
    }
}

impl NativeBackend for InstrumentedBackend {
    fn name(&self) -> &'static str {
        "instrumented"
    }

    fn compile(&self, wasm: &[u8]) -> Result<Vec<u8>, CompileError> {
        self.compiles.fetch_add(1, Ordering::SeqCst);
        {
            let mut held = self.held.lock();
            while *held {
                self.released.wait(&mut held);
            }
        }
        std::thread::sleep(self.delay);
        if self.fail {
            return Err(CompileError::Codegen("injected failure".into()));
        }
        self.inner.compile(wasm)
    }

    fn load(&self, artifact: &[u8], spec: InstanceSpec) -> Result<Arc<dyn InstanceFactory>, CompileError> {
        self.inner.load(artifact, spec)
    }
}

#[cfg(feature = "native")]
pub fn wasmtime_backend(config: &EngineConfig) -> Arc<dyn NativeBackend> {
    Arc::new(
        quidditch_udf::tier::native::WasmtimeBackend::new(config.default_fuel.is_some())
            .expect("wasmtime engine"),
    )
}

/// Engine on the real native backend, wrapped for instrumentation.
#[cfg(feature = "native")]
pub fn native_engine(config: EngineConfig, wrap: impl FnOnce(InstrumentedBackend) -> InstrumentedBackend) -> (UdfEngine, Arc<InstrumentedBackend>) {
    let backend = Arc::new(wrap(InstrumentedBackend::new(wasmtime_backend(&config))));
    let engine = UdfEngine::builder(config)
        .backend(Arc::clone(&backend) as Arc<dyn NativeBackend>)
        .build()
        .expect("engine");
    (engine, backend)
}
