//! Native tier backed by `wasmtime` (Cranelift).
//!
//! Compilation produces a serialized artifact (`Module::serialize`) which the
//! native code cache persists verbatim; loading deserializes it, which is a
//! few milliseconds instead of a full Cranelift compile.

use std::sync::Arc;

use wasmtime::{
    Caller, Config, Engine, Extern, Func, Linker, Memory, Module, OptLevel, Store, StoreLimits,
    StoreLimitsBuilder, Trap, Val,
};

use super::{InstanceFactory, InstanceSpec, NativeBackend, RawResults, Tier, TierInstance};
use crate::abi::{GuestMemory, HostCall, HOST_MODULE, MEMORY_EXPORT};
use crate::context::ContextRegistry;
use crate::error::{CompileError, EngineError, ExecError, TrapKind};
use crate::value::WasmValue;

struct StoreState {
    contexts: Arc<ContextRegistry>,
    limits: StoreLimits,
}

/// Cranelift-backed [`NativeBackend`].
pub struct WasmtimeBackend {
    engine: Engine,
}

impl WasmtimeBackend {
    pub fn new(fuel_metering: bool) -> Result<Self, EngineError> {
        let mut config = Config::new();
        config.consume_fuel(fuel_metering);
        config.cranelift_opt_level(OptLevel::Speed);
        // Compiles already run on the dedicated compile pool.
        config.parallel_compilation(false);
        let engine = Engine::new(&config).map_err(|e| EngineError::Backend {
            tier: "native",
            message: format!("{e:#}"),
        })?;
        Ok(Self { engine })
    }
}

impl NativeBackend for WasmtimeBackend {
    fn name(&self) -> &'static str {
        "wasmtime-cranelift"
    }

    fn compile(&self, wasm: &[u8]) -> Result<Vec<u8>, CompileError> {
        let module =
            Module::new(&self.engine, wasm).map_err(|e| CompileError::Codegen(format!("{e:#}")))?;
        module
            .serialize()
            .map_err(|e| CompileError::Codegen(format!("{e:#}")))
    }

    fn load(&self, artifact: &[u8], spec: InstanceSpec) -> Result<Arc<dyn InstanceFactory>, CompileError> {
        // SAFETY: artifacts come from `compile` above, either directly or via
        // the content-addressed cache directory owned by this engine. wasmtime
        // rejects artifacts produced by an incompatible engine configuration.
        let module = unsafe { Module::deserialize(&self.engine, artifact) }
            .map_err(|e| CompileError::Load(format!("{e:#}")))?;
        let mut linker = Linker::new(&self.engine);
        define_host_functions(&mut linker).map_err(CompileError::Load)?;
        Ok(Arc::new(NativeModule {
            engine: self.engine.clone(),
            module,
            linker,
            spec,
        }))
    }
}

struct NativeModule {
    engine: Engine,
    module: Module,
    linker: Linker<StoreState>,
    spec: InstanceSpec,
}

impl InstanceFactory for NativeModule {
    fn tier(&self) -> Tier {
        Tier::Native
    }

    fn instantiate(&self) -> Result<Box<dyn TierInstance>, ExecError> {
        let state = StoreState {
            contexts: Arc::clone(&self.spec.contexts),
            limits: StoreLimitsBuilder::new()
                .memory_size(self.spec.max_memory_bytes)
                .instances(1)
                .build(),
        };
        let mut store = Store::new(&self.engine, state);
        store.limiter(|state| &mut state.limits);
        if let Some(fuel) = self.spec.fuel {
            store
                .set_fuel(fuel)
                .map_err(|e| ExecError::Instantiation(format!("{e:#}")))?;
        }

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .map_err(|e| ExecError::Instantiation(format!("{e:#}")))?;
        let func = instance
            .get_func(&mut store, &self.spec.entry_point)
            .ok_or_else(|| {
                ExecError::Instantiation(format!("missing export '{}'", self.spec.entry_point))
            })?;

        Ok(Box::new(NativeInstance {
            store,
            func,
            fuel: self.spec.fuel,
            result_count: self.spec.result_count,
        }))
    }
}

struct NativeInstance {
    store: Store<StoreState>,
    func: Func,
    fuel: Option<u64>,
    result_count: usize,
}

impl TierInstance for NativeInstance {
    fn call(&mut self, args: &[WasmValue]) -> Result<RawResults, ExecError> {
        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| ExecError::Host(format!("{e:#}")))?;
        }
        let inputs: smallvec::SmallVec<[Val; 8]> = args.iter().map(|v| to_val(*v)).collect();
        let mut outputs: smallvec::SmallVec<[Val; 2]> =
            (0..self.result_count).map(|_| Val::I32(0)).collect();

        self.func
            .call(&mut self.store, &inputs, &mut outputs)
            .map_err(classify)?;

        outputs
            .iter()
            .map(from_val)
            .collect::<Option<RawResults>>()
            .ok_or_else(|| ExecError::Host("entry point returned a reference type".into()))
    }
}

fn to_val(v: WasmValue) -> Val {
    match v {
        WasmValue::I32(x) => Val::I32(x),
        WasmValue::I64(x) => Val::I64(x),
        WasmValue::F32(x) => Val::F32(x.to_bits()),
        WasmValue::F64(x) => Val::F64(x.to_bits()),
    }
}

fn from_val(v: &Val) -> Option<WasmValue> {
    match v {
        Val::I32(x) => Some(WasmValue::I32(*x)),
        Val::I64(x) => Some(WasmValue::I64(*x)),
        Val::F32(bits) => Some(WasmValue::F32(f32::from_bits(*bits))),
        Val::F64(bits) => Some(WasmValue::F64(f64::from_bits(*bits))),
        _ => None,
    }
}

fn classify(err: wasmtime::Error) -> ExecError {
    let kind = match err.downcast_ref::<Trap>() {
        Some(Trap::IntegerDivisionByZero) => TrapKind::DivisionByZero,
        Some(Trap::IntegerOverflow) => TrapKind::IntegerOverflow,
        Some(Trap::MemoryOutOfBounds) | Some(Trap::TableOutOfBounds) => TrapKind::MemoryOutOfBounds,
        Some(Trap::UnreachableCodeReached) => TrapKind::Unreachable,
        Some(Trap::StackOverflow) => TrapKind::StackOverflow,
        Some(Trap::OutOfFuel) => TrapKind::OutOfFuel,
        _ => TrapKind::Other,
    };
    ExecError::Trap {
        kind,
        message: format!("{err:#}"),
    }
}

struct WasmtimeMemory<'a, 'b> {
    caller: &'a mut Caller<'b, StoreState>,
    memory: Option<Memory>,
}

impl GuestMemory for WasmtimeMemory<'_, '_> {
    fn read(&self, ptr: u32, len: u32) -> Option<Vec<u8>> {
        let memory = self.memory?;
        let mut buf = vec![0u8; len as usize];
        memory.read(&*self.caller, ptr as usize, &mut buf).ok()?;
        Some(buf)
    }

    fn write(&mut self, ptr: u32, data: &[u8]) -> bool {
        match self.memory {
            Some(memory) => memory.write(&mut *self.caller, ptr as usize, data).is_ok(),
            None => false,
        }
    }
}

fn with_host<R>(caller: &mut Caller<'_, StoreState>, f: impl FnOnce(&mut HostCall<'_>) -> R) -> R {
    let contexts = Arc::clone(&caller.data().contexts);
    let memory = caller.get_export(MEMORY_EXPORT).and_then(Extern::into_memory);
    let mut guest = WasmtimeMemory { caller, memory };
    let mut call = HostCall {
        contexts: &contexts,
        memory: &mut guest,
    };
    f(&mut call)
}

fn define_host_functions(linker: &mut Linker<StoreState>) -> Result<(), String> {
    let m = HOST_MODULE;
    let err = |e: wasmtime::Error| format!("{e:#}");

    linker
        .func_wrap(m, "get_score", |caller: Caller<'_, StoreState>, ctx: i64| -> f64 {
            HostCall::get_score(&caller.data().contexts, ctx)
        })
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "get_field_f64",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> f64 {
                with_host(&mut caller, |h| h.get_field_f64(ctx, ptr, len))
            },
        )
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "get_field_i64",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> i64 {
                with_host(&mut caller, |h| h.get_field_i64(ctx, ptr, len))
            },
        )
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "get_field_bool",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> i32 {
                with_host(&mut caller, |h| h.get_field_bool(ctx, ptr, len))
            },
        )
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "has_field",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> i32 {
                with_host(&mut caller, |h| h.has_field(ctx, ptr, len))
            },
        )
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "get_field_string",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32, out: i32, cap: i32| -> i32 {
                with_host(&mut caller, |h| h.get_field_string(ctx, ptr, len, out, cap))
            },
        )
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "get_document_id",
            |mut caller: Caller<'_, StoreState>, ctx: i64, out: i32, cap: i32| -> i32 {
                with_host(&mut caller, |h| h.get_document_id(ctx, out, cap))
            },
        )
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "get_param_string",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32, out: i32, cap: i32| -> i32 {
                with_host(&mut caller, |h| h.get_param_string(ctx, ptr, len, out, cap))
            },
        )
        .map_err(err)?;
    linker
        .func_wrap(
            m,
            "log",
            |mut caller: Caller<'_, StoreState>, level: i32, ptr: i32, len: i32| {
                with_host(&mut caller, |h| h.log(level, ptr, len))
            },
        )
        .map_err(err)?;
    Ok(())
}
