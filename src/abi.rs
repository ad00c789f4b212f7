//! The host ABI: the only functions a UDF may import.
//!
//! All imports live in the `env` module and take the call's context id as
//! their first argument (except `log`). Strings cross the boundary as
//! `(ptr, len)` pairs in the guest's exported `memory`; results are copied
//! into a guest-provided `(out_ptr, out_cap)` buffer and the function returns
//! the number of bytes written or a negative status:
//!
//! | status | meaning |
//! |---|---|
//! | `-1` | field / parameter / context not found |
//! | `-2` | output buffer too small (nothing written) |
//! | `-3` | guest memory missing or access out of bounds |
//!
//! The engine-specific linkers (`tier::interp`, `tier::native`) only adapt
//! their caller type to [`GuestMemory`]; the semantics live here.

use tracing::{debug, error, info, trace, warn};

use crate::context::ContextRegistry;
use crate::value::WasmType;

/// Import module name of every host function.
pub const HOST_MODULE: &str = "env";

/// Export the host reads strings from and writes results to.
pub const MEMORY_EXPORT: &str = "memory";

pub const STATUS_NOT_FOUND: i32 = -1;
pub const STATUS_BUFFER_TOO_SMALL: i32 = -2;
pub const STATUS_MEMORY_FAULT: i32 = -3;

/// Longest field or parameter name accepted from the guest.
pub const MAX_NAME_LEN: i32 = 1024;

/// Longest log line accepted from the guest.
pub const MAX_LOG_LEN: i32 = 4096;

/// Signature of one host function.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostFunction {
    pub name: &'static str,
    pub params: &'static [WasmType],
    pub results: &'static [WasmType],
}

use WasmType::{F64, I32, I64};

pub const HOST_FUNCTIONS: &[HostFunction] = &[
    HostFunction { name: "get_score", params: &[I64], results: &[F64] },
    HostFunction { name: "get_field_f64", params: &[I64, I32, I32], results: &[F64] },
    HostFunction { name: "get_field_i64", params: &[I64, I32, I32], results: &[I64] },
    HostFunction { name: "get_field_bool", params: &[I64, I32, I32], results: &[I32] },
    HostFunction { name: "has_field", params: &[I64, I32, I32], results: &[I32] },
    HostFunction { name: "get_field_string", params: &[I64, I32, I32, I32, I32], results: &[I32] },
    HostFunction { name: "get_document_id", params: &[I64, I32, I32], results: &[I32] },
    HostFunction { name: "get_param_string", params: &[I64, I32, I32, I32, I32], results: &[I32] },
    HostFunction { name: "log", params: &[I32, I32, I32], results: &[] },
];

pub fn host_function(name: &str) -> Option<&'static HostFunction> {
    HOST_FUNCTIONS.iter().find(|f| f.name == name)
}

/// Byte access to the calling instance's linear memory.
pub trait GuestMemory {
    fn read(&self, ptr: u32, len: u32) -> Option<Vec<u8>>;
    fn write(&mut self, ptr: u32, data: &[u8]) -> bool;
}

fn read_str(mem: &dyn GuestMemory, ptr: i32, len: i32, max: i32) -> Option<String> {
    if ptr < 0 || len < 0 || len > max {
        return None;
    }
    let bytes = mem.read(ptr as u32, len as u32)?;
    String::from_utf8(bytes).ok()
}

fn copy_out(mem: &mut dyn GuestMemory, data: &[u8], out_ptr: i32, out_cap: i32) -> i32 {
    if out_ptr < 0 || out_cap < 0 {
        return STATUS_MEMORY_FAULT;
    }
    if data.len() > out_cap as usize {
        return STATUS_BUFFER_TOO_SMALL;
    }
    if mem.write(out_ptr as u32, data) {
        data.len() as i32
    } else {
        STATUS_MEMORY_FAULT
    }
}

/// Host side of one guest call into the ABI.
pub struct HostCall<'a> {
    pub contexts: &'a ContextRegistry,
    pub memory: &'a mut dyn GuestMemory,
}

impl HostCall<'_> {
    pub fn get_score(contexts: &ContextRegistry, ctx: i64) -> f64 {
        contexts.with(ctx, |c| c.document.score()).unwrap_or(0.0)
    }

    pub fn get_field_f64(&self, ctx: i64, ptr: i32, len: i32) -> f64 {
        self.lookup(ctx, ptr, len, |f| f.as_f64()).unwrap_or(0.0)
    }

    pub fn get_field_i64(&self, ctx: i64, ptr: i32, len: i32) -> i64 {
        self.lookup(ctx, ptr, len, |f| f.as_i64()).unwrap_or(0)
    }

    pub fn get_field_bool(&self, ctx: i64, ptr: i32, len: i32) -> i32 {
        self.lookup(ctx, ptr, len, |f| f.as_bool()).map_or(0, i32::from)
    }

    pub fn has_field(&self, ctx: i64, ptr: i32, len: i32) -> i32 {
        self.lookup(ctx, ptr, len, |_| Some(())).map_or(0, |_| 1)
    }

    pub fn get_field_string(&mut self, ctx: i64, ptr: i32, len: i32, out_ptr: i32, out_cap: i32) -> i32 {
        let Some(name) = read_str(&*self.memory, ptr, len, MAX_NAME_LEN) else {
            return STATUS_MEMORY_FAULT;
        };
        let value = self
            .contexts
            .with(ctx, |c| c.field(&name).and_then(|f| f.as_str().map(str::to_owned)))
            .flatten();
        match value {
            Some(s) => copy_out(&mut *self.memory, s.as_bytes(), out_ptr, out_cap),
            None => STATUS_NOT_FOUND,
        }
    }

    pub fn get_document_id(&mut self, ctx: i64, out_ptr: i32, out_cap: i32) -> i32 {
        match self.contexts.with(ctx, |c| c.document.doc_id().to_owned()) {
            Some(id) => copy_out(&mut *self.memory, id.as_bytes(), out_ptr, out_cap),
            None => STATUS_NOT_FOUND,
        }
    }

    pub fn get_param_string(&mut self, ctx: i64, ptr: i32, len: i32, out_ptr: i32, out_cap: i32) -> i32 {
        let Some(name) = read_str(&*self.memory, ptr, len, MAX_NAME_LEN) else {
            return STATUS_MEMORY_FAULT;
        };
        let value = self
            .contexts
            .with(ctx, |c| c.string_param(&name).map(str::to_owned))
            .flatten();
        match value {
            Some(s) => copy_out(&mut *self.memory, s.as_bytes(), out_ptr, out_cap),
            None => STATUS_NOT_FOUND,
        }
    }

    /// Guest log line. Levels: 0 trace, 1 debug, 2 info, 3 warn, 4+ error.
    pub fn log(&self, level: i32, ptr: i32, len: i32) {
        let Some(msg) = read_str(&*self.memory, ptr, len.min(MAX_LOG_LEN), MAX_LOG_LEN) else {
            return;
        };
        match level {
            i32::MIN..=0 => trace!(target: "quidditch_udf::guest", "{}", msg),
            1 => debug!(target: "quidditch_udf::guest", "{}", msg),
            2 => info!(target: "quidditch_udf::guest", "{}", msg),
            3 => warn!(target: "quidditch_udf::guest", "{}", msg),
            _ => error!(target: "quidditch_udf::guest", "{}", msg),
        }
    }

    fn lookup<R>(
        &self,
        ctx: i64,
        ptr: i32,
        len: i32,
        f: impl FnOnce(&crate::context::FieldValue<'_>) -> Option<R>,
    ) -> Option<R> {
        let name = read_str(&*self.memory, ptr, len, MAX_NAME_LEN)?;
        self.contexts
            .with(ctx, |c| c.field(&name).as_ref().and_then(f))
            .flatten()
    }
}
