//! Typed parameter/return values and their raw WebAssembly representation.
//!
//! A UDF declares its parameters and returns using [`ValueType`]. On the
//! wire to the guest every value becomes a [`WasmValue`]: `bool` travels as
//! `i32` (1/0) and `string` never travels positionally at all (the guest
//! reads it through `get_param_string`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Declared type of a parameter or return value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    I32,
    I64,
    F32,
    F64,
    String,
    Bool,
}

impl ValueType {
    /// Raw type used when the value crosses into the guest, `None` for strings.
    #[inline]
    pub fn wasm_type(self) -> Option<WasmType> {
        match self {
            ValueType::I32 | ValueType::Bool => Some(WasmType::I32),
            ValueType::I64 => Some(WasmType::I64),
            ValueType::F32 => Some(WasmType::F32),
            ValueType::F64 => Some(WasmType::F64),
            ValueType::String => None,
        }
    }

    #[inline]
    pub fn is_numeric(self) -> bool {
        matches!(
            self,
            ValueType::I32 | ValueType::I64 | ValueType::F32 | ValueType::F64
        )
    }

    /// Whether an argument of type `from` may be passed to a parameter of this type
    /// without loss.
    pub fn accepts(self, from: ValueType) -> bool {
        self == from
            || matches!(
                (from, self),
                (ValueType::I32, ValueType::I64)
                    | (ValueType::I32, ValueType::F64)
                    | (ValueType::F32, ValueType::F64)
            )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ValueType::I32 => "i32",
            ValueType::I64 => "i64",
            ValueType::F32 => "f32",
            ValueType::F64 => "f64",
            ValueType::String => "string",
            ValueType::Bool => "bool",
        }
    }
}

impl fmt::Display for ValueType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for ValueType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "i32" => Ok(ValueType::I32),
            "i64" => Ok(ValueType::I64),
            "f32" => Ok(ValueType::F32),
            "f64" => Ok(ValueType::F64),
            "string" => Ok(ValueType::String),
            "bool" => Ok(ValueType::Bool),
            other => Err(format!("unknown value type '{other}'")),
        }
    }
}

/// A typed value passed to or returned from a UDF.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
    String(String),
    Bool(bool),
}

impl Value {
    pub fn value_type(&self) -> ValueType {
        match self {
            Value::I32(_) => ValueType::I32,
            Value::I64(_) => ValueType::I64,
            Value::F32(_) => ValueType::F32,
            Value::F64(_) => ValueType::F64,
            Value::String(_) => ValueType::String,
            Value::Bool(_) => ValueType::Bool,
        }
    }

    /// Zero value used for an omitted optional parameter without a default.
    pub fn zero(ty: ValueType) -> Value {
        match ty {
            ValueType::I32 => Value::I32(0),
            ValueType::I64 => Value::I64(0),
            ValueType::F32 => Value::F32(0.0),
            ValueType::F64 => Value::F64(0.0),
            ValueType::String => Value::String(String::new()),
            ValueType::Bool => Value::Bool(false),
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            Value::I32(v) => Some(v as f64),
            Value::I64(v) => Some(v as f64),
            Value::F32(v) => Some(v as f64),
            Value::F64(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Lossless widening used when binding call arguments.
    pub fn widen_to(&self, ty: ValueType) -> Option<Value> {
        if self.value_type() == ty {
            return Some(self.clone());
        }
        match (self, ty) {
            (Value::I32(v), ValueType::I64) => Some(Value::I64(*v as i64)),
            (Value::I32(v), ValueType::F64) => Some(Value::F64(*v as f64)),
            (Value::F32(v), ValueType::F64) => Some(Value::F64(*v as f64)),
            _ => None,
        }
    }

    /// Conversion for declared defaults: numeric defaults may be written in any
    /// numeric type as long as the value is representable in the target.
    pub fn coerce_default(&self, ty: ValueType) -> Option<Value> {
        if self.value_type() == ty {
            return Some(self.clone());
        }
        if !self.value_type().is_numeric() || !ty.is_numeric() {
            return None;
        }
        let integral = match *self {
            Value::I32(v) => Some(v as i64),
            Value::I64(v) => Some(v),
            Value::F32(v) if v.fract() == 0.0 && v.is_finite() => Some(v as i64),
            Value::F64(v) if v.fract() == 0.0 && v.is_finite() => Some(v as i64),
            _ => None,
        };
        match ty {
            ValueType::I32 => integral
                .and_then(|v| i32::try_from(v).ok())
                .map(Value::I32),
            ValueType::I64 => integral.map(Value::I64),
            ValueType::F32 => self.as_f64().map(|v| Value::F32(v as f32)),
            ValueType::F64 => self.as_f64().map(Value::F64),
            _ => None,
        }
    }

    /// Raw representation for positional guest arguments.
    #[inline]
    pub fn to_wasm(&self) -> Option<WasmValue> {
        match *self {
            Value::I32(v) => Some(WasmValue::I32(v)),
            Value::I64(v) => Some(WasmValue::I64(v)),
            Value::F32(v) => Some(WasmValue::F32(v)),
            Value::F64(v) => Some(WasmValue::F64(v)),
            Value::Bool(v) => Some(WasmValue::I32(v as i32)),
            Value::String(_) => None,
        }
    }

    /// Interpret a raw guest result as the declared type.
    pub fn from_wasm(ty: ValueType, raw: WasmValue) -> Option<Value> {
        match (ty, raw) {
            (ValueType::I32, WasmValue::I32(v)) => Some(Value::I32(v)),
            (ValueType::Bool, WasmValue::I32(v)) => Some(Value::Bool(v != 0)),
            (ValueType::I64, WasmValue::I64(v)) => Some(Value::I64(v)),
            (ValueType::F32, WasmValue::F32(v)) => Some(Value::F32(v)),
            (ValueType::F64, WasmValue::F64(v)) => Some(Value::F64(v)),
            _ => None,
        }
    }

    /// Parse a JSON scalar as the declared type (CLI and document tooling).
    pub fn from_json(ty: ValueType, json: &serde_json::Value) -> Option<Value> {
        let parsed = match json {
            serde_json::Value::Bool(b) => Value::Bool(*b),
            serde_json::Value::String(s) => Value::String(s.clone()),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::I64(i),
                None => Value::F64(n.as_f64()?),
            },
            _ => return None,
        };
        parsed.coerce_default(ty)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::I32(v) => write!(f, "{v}"),
            Value::I64(v) => write!(f, "{v}"),
            Value::F32(v) => write!(f, "{v}"),
            Value::F64(v) => write!(f, "{v}"),
            Value::String(v) => write!(f, "{v:?}"),
            Value::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::I32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::I64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Value::F32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::F64(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::String(v.to_owned())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::String(v)
    }
}

/// WebAssembly scalar type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WasmType {
    I32,
    I64,
    F32,
    F64,
}

impl WasmType {
    /// The declared type a raw value of this kind naturally maps back to.
    pub fn natural(self) -> ValueType {
        match self {
            WasmType::I32 => ValueType::I32,
            WasmType::I64 => ValueType::I64,
            WasmType::F32 => ValueType::F32,
            WasmType::F64 => ValueType::F64,
        }
    }
}

impl fmt::Display for WasmType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.natural().as_str())
    }
}

/// Raw value exchanged with a tier instance.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WasmValue {
    I32(i32),
    I64(i64),
    F32(f32),
    F64(f64),
}

impl WasmValue {
    #[inline]
    pub fn ty(&self) -> WasmType {
        match self {
            WasmValue::I32(_) => WasmType::I32,
            WasmValue::I64(_) => WasmType::I64,
            WasmValue::F32(_) => WasmType::F32,
            WasmValue::F64(_) => WasmType::F64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bool_travels_as_i32() {
        assert_eq!(Value::Bool(true).to_wasm(), Some(WasmValue::I32(1)));
        assert_eq!(
            Value::from_wasm(ValueType::Bool, WasmValue::I32(7)),
            Some(Value::Bool(true))
        );
        assert_eq!(Value::String("x".into()).to_wasm(), None);
    }

    #[test]
    fn test_widening_is_lossless_only() {
        assert_eq!(Value::I32(3).widen_to(ValueType::F64), Some(Value::F64(3.0)));
        assert_eq!(Value::F64(1.5).widen_to(ValueType::I32), None);
        assert_eq!(Value::I64(1).widen_to(ValueType::I32), None);
        assert!(ValueType::F64.accepts(ValueType::F32));
        assert!(!ValueType::I32.accepts(ValueType::F32));
    }

    #[test]
    fn test_default_coercion() {
        assert_eq!(Value::I64(1).coerce_default(ValueType::F64), Some(Value::F64(1.0)));
        assert_eq!(Value::F64(2.0).coerce_default(ValueType::I32), Some(Value::I32(2)));
        assert_eq!(Value::F64(2.5).coerce_default(ValueType::I32), None);
        assert_eq!(Value::I64(i64::MAX).coerce_default(ValueType::I32), None);
        assert_eq!(Value::Bool(true).coerce_default(ValueType::I32), None);
        assert_eq!(Value::from("a").coerce_default(ValueType::Bool), None);
    }

    #[test]
    fn test_result_type_mismatch() {
        assert_eq!(Value::from_wasm(ValueType::F64, WasmValue::I32(1)), None);
        assert_eq!(Value::from_wasm(ValueType::String, WasmValue::I32(1)), None);
    }

    #[test]
    fn test_value_type_parsing() {
        assert_eq!("f64".parse::<ValueType>(), Ok(ValueType::F64));
        assert!("double".parse::<ValueType>().is_err());
    }
}
