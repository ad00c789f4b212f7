//! Interpreter tier backed by `wasmi`.
//!
//! Translation to wasmi's internal bytecode happens once at registration and
//! takes well under a millisecond for typical scoring functions, which is
//! what makes a module callable before native compilation has even started.

use std::sync::Arc;

use wasmi::core::{TrapCode, F32, F64};
use wasmi::{
    Caller, Config, Engine, Extern, Func, Linker, Memory, Module, Store, StoreLimits,
    StoreLimitsBuilder, Val,
};

use super::{InstanceFactory, InstanceSpec, RawResults, Tier, TierInstance};
use crate::abi::{GuestMemory, HostCall, HOST_MODULE, MEMORY_EXPORT};
use crate::context::ContextRegistry;
use crate::error::{ExecError, TrapKind, ValidationError};
use crate::value::WasmValue;

struct StoreState {
    contexts: Arc<ContextRegistry>,
    limits: StoreLimits,
}

/// Shared wasmi engine. One per [`crate::UdfEngine`].
pub struct Interpreter {
    engine: Engine,
}

impl Interpreter {
    pub fn new(fuel_metering: bool) -> Self {
        let mut config = Config::default();
        config.consume_fuel(fuel_metering);
        Self {
            engine: Engine::new(&config),
        }
    }

    /// Translate a validated module and link it against the host ABI.
    pub fn load(&self, wasm: &[u8], spec: InstanceSpec) -> Result<InterpretedModule, ValidationError> {
        let module =
            Module::new(&self.engine, wasm).map_err(|e| ValidationError::Interpreter(e.to_string()))?;
        let mut linker = Linker::new(&self.engine);
        define_host_functions(&mut linker).map_err(ValidationError::Interpreter)?;
        Ok(InterpretedModule {
            engine: self.engine.clone(),
            module,
            linker,
            spec,
        })
    }
}

/// A translated module; instantiates interpreter instances on demand.
pub struct InterpretedModule {
    engine: Engine,
    module: Module,
    linker: Linker<StoreState>,
    spec: InstanceSpec,
}

impl InstanceFactory for InterpretedModule {
    fn tier(&self) -> Tier {
        Tier::Interpreter
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
                .map_err(|e| ExecError::Instantiation(e.to_string()))?;
        }

        let instance = self
            .linker
            .instantiate(&mut store, &self.module)
            .and_then(|pre| pre.start(&mut store))
            .map_err(|e| ExecError::Instantiation(e.to_string()))?;
        let func = instance
            .get_func(&store, &self.spec.entry_point)
            .ok_or_else(|| {
                ExecError::Instantiation(format!("missing export '{}'", self.spec.entry_point))
            })?;

        Ok(Box::new(InterpretedInstance {
            store,
            func,
            fuel: self.spec.fuel,
            result_count: self.spec.result_count,
        }))
    }
}

struct InterpretedInstance {
    store: Store<StoreState>,
    func: Func,
    fuel: Option<u64>,
    result_count: usize,
}

impl TierInstance for InterpretedInstance {
    fn call(&mut self, args: &[WasmValue]) -> Result<RawResults, ExecError> {
        if let Some(fuel) = self.fuel {
            self.store
                .set_fuel(fuel)
                .map_err(|e| ExecError::Host(e.to_string()))?;
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
        WasmValue::F32(x) => Val::F32(F32::from_bits(x.to_bits())),
        WasmValue::F64(x) => Val::F64(F64::from_bits(x.to_bits())),
    }
}

fn from_val(v: &Val) -> Option<WasmValue> {
    match v {
        Val::I32(x) => Some(WasmValue::I32(*x)),
        Val::I64(x) => Some(WasmValue::I64(*x)),
        Val::F32(x) => Some(WasmValue::F32(f32::from_bits(x.to_bits()))),
        Val::F64(x) => Some(WasmValue::F64(f64::from_bits(x.to_bits()))),
        _ => None,
    }
}

fn classify(err: wasmi::Error) -> ExecError {
    let kind = match err.as_trap_code() {
        Some(TrapCode::IntegerDivisionByZero) => TrapKind::DivisionByZero,
        Some(TrapCode::IntegerOverflow) => TrapKind::IntegerOverflow,
        Some(TrapCode::MemoryOutOfBounds) | Some(TrapCode::TableOutOfBounds) => {
            TrapKind::MemoryOutOfBounds
        }
        Some(TrapCode::UnreachableCodeReached) => TrapKind::Unreachable,
        Some(TrapCode::StackOverflow) => TrapKind::StackOverflow,
        Some(TrapCode::OutOfFuel) => TrapKind::OutOfFuel,
        _ => TrapKind::Other,
    };
    ExecError::Trap {
        kind,
        message: err.to_string(),
    }
}

struct WasmiMemory<'a, 'b> {
    caller: &'a mut Caller<'b, StoreState>,
    memory: Option<Memory>,
}

impl GuestMemory for WasmiMemory<'_, '_> {
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
    let mut guest = WasmiMemory { caller, memory };
    let mut call = HostCall {
        contexts: &contexts,
        memory: &mut guest,
    };
    f(&mut call)
}

fn link_err(e: impl std::fmt::Display) -> String {
    e.to_string()
}

fn define_host_functions(linker: &mut Linker<StoreState>) -> Result<(), String> {
    let m = HOST_MODULE;

    linker
        .func_wrap(m, "get_score", |caller: Caller<'_, StoreState>, ctx: i64| -> f64 {
            HostCall::get_score(&caller.data().contexts, ctx)
        })
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "get_field_f64",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> f64 {
                with_host(&mut caller, |h| h.get_field_f64(ctx, ptr, len))
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "get_field_i64",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> i64 {
                with_host(&mut caller, |h| h.get_field_i64(ctx, ptr, len))
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "get_field_bool",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> i32 {
                with_host(&mut caller, |h| h.get_field_bool(ctx, ptr, len))
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "has_field",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32| -> i32 {
                with_host(&mut caller, |h| h.has_field(ctx, ptr, len))
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "get_field_string",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32, out: i32, cap: i32| -> i32 {
                with_host(&mut caller, |h| h.get_field_string(ctx, ptr, len, out, cap))
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "get_document_id",
            |mut caller: Caller<'_, StoreState>, ctx: i64, out: i32, cap: i32| -> i32 {
                with_host(&mut caller, |h| h.get_document_id(ctx, out, cap))
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "get_param_string",
            |mut caller: Caller<'_, StoreState>, ctx: i64, ptr: i32, len: i32, out: i32, cap: i32| -> i32 {
                with_host(&mut caller, |h| h.get_param_string(ctx, ptr, len, out, cap))
            },
        )
        .map_err(link_err)?;
    linker
        .func_wrap(
            m,
            "log",
            |mut caller: Caller<'_, StoreState>, level: i32, ptr: i32, len: i32| {
                with_host(&mut caller, |h| h.log(level, ptr, len))
            },
        )
        .map_err(link_err)?;
    Ok(())
}
