//! Argument binding and result conversion.
//!
//! Named call parameters are checked against the descriptor and laid out in
//! declaration order. String parameters never reach the guest positionally;
//! they travel with the call context and are read via `get_param_string`.

use std::collections::HashMap;

use smallvec::SmallVec;

use crate::descriptor::ModuleDescriptor;
use crate::error::{ExecError, ExecResult};
use crate::value::{Value, ValueType, WasmValue};

/// Named arguments of one invocation.
pub type ParameterMap = HashMap<String, Value>;

/// Arguments ready for the entry point, minus the leading context id.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BoundCall {
    pub positional: SmallVec<[WasmValue; 8]>,
    pub strings: Vec<(String, String)>,
}

impl BoundCall {
    /// Full argument list with the context id in front.
    pub fn arguments(&self, ctx_id: i64) -> SmallVec<[WasmValue; 8]> {
        let mut args = SmallVec::with_capacity(self.positional.len() + 1);
        args.push(WasmValue::I64(ctx_id));
        args.extend_from_slice(&self.positional);
        args
    }
}

pub fn bind(desc: &ModuleDescriptor, params: &ParameterMap) -> ExecResult<BoundCall> {
    if let Some(unknown) = params.keys().find(|k| desc.param(k).is_none()) {
        return Err(ExecError::UnknownParameter(unknown.clone()));
    }

    let mut call = BoundCall::default();
    for spec in desc.params() {
        let value = match params.get(&spec.name) {
            Some(given) => given.widen_to(spec.ty).ok_or_else(|| ExecError::ParameterType {
                name: spec.name.clone(),
                expected: spec.ty,
                found: given.value_type(),
            })?,
            None if spec.required => return Err(ExecError::MissingParameter(spec.name.clone())),
            None => spec
                .default
                .as_ref()
                .and_then(|d| d.coerce_default(spec.ty))
                .unwrap_or_else(|| Value::zero(spec.ty)),
        };

        match value {
            Value::String(s) => call.strings.push((spec.name.clone(), s)),
            other => {
                if let Some(raw) = other.to_wasm() {
                    call.positional.push(raw);
                }
            }
        }
    }
    Ok(call)
}

/// Convert raw guest results into the declared return types.
pub fn convert_results(returns: &[ValueType], raw: &[WasmValue]) -> ExecResult<Vec<Value>> {
    if raw.len() != returns.len() {
        return Err(ExecError::ResultArity {
            expected: returns.len(),
            found: raw.len(),
        });
    }
    returns
        .iter()
        .zip(raw)
        .enumerate()
        .map(|(index, (ty, value))| {
            Value::from_wasm(*ty, *value).ok_or(ExecError::ResultType {
                index,
                expected: *ty,
                found: value.ty().natural(),
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::descriptor::ParamSpec;

    fn desc() -> ModuleDescriptor {
        ModuleDescriptor::builder("geo", "1", "score", b"\0asm".to_vec())
            .param(ParamSpec::required("lat", ValueType::F64))
            .param(ParamSpec::optional("lang", ValueType::String).with_default("en"))
            .param(ParamSpec::optional("limit", ValueType::I64).with_default(10))
            .param(ParamSpec::optional("strict", ValueType::Bool))
            .returns(ValueType::F64)
            .build()
    }

    fn params(entries: &[(&str, Value)]) -> ParameterMap {
        entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect()
    }

    #[test]
    fn test_bind_in_declaration_order() {
        let call = bind(&desc(), &params(&[("lat", Value::F64(52.5)), ("strict", Value::Bool(true))])).unwrap();
        assert_eq!(
            call.positional.as_slice(),
            &[WasmValue::F64(52.5), WasmValue::I64(10), WasmValue::I32(1)]
        );
        assert_eq!(call.strings, vec![("lang".to_string(), "en".to_string())]);
        assert_eq!(call.arguments(7)[0], WasmValue::I64(7));
        assert_eq!(call.arguments(7).len(), 4);
    }

    #[test]
    fn test_widening_is_accepted() {
        let call = bind(&desc(), &params(&[("lat", Value::I32(3)), ("limit", Value::I32(5))])).unwrap();
        assert_eq!(call.positional[0], WasmValue::F64(3.0));
        assert_eq!(call.positional[1], WasmValue::I64(5));
    }

    #[test]
    fn test_binding_errors() {
        assert_eq!(
            bind(&desc(), &ParameterMap::new()),
            Err(ExecError::MissingParameter("lat".into()))
        );
        assert_eq!(
            bind(&desc(), &params(&[("lat", Value::F64(1.0)), ("radius", Value::F64(1.0))])),
            Err(ExecError::UnknownParameter("radius".into()))
        );
        assert_eq!(
            bind(&desc(), &params(&[("lat", Value::from("north"))])),
            Err(ExecError::ParameterType {
                name: "lat".into(),
                expected: ValueType::F64,
                found: ValueType::String,
            })
        );
        // Narrowing is never implicit.
        assert!(matches!(
            bind(&desc(), &params(&[("lat", Value::F64(1.0)), ("limit", Value::F64(2.0))])),
            Err(ExecError::ParameterType { .. })
        ));
    }

    #[test]
    fn test_convert_results() {
        assert_eq!(
            convert_results(&[ValueType::F64, ValueType::Bool], &[WasmValue::F64(2.5), WasmValue::I32(0)]),
            Ok(vec![Value::F64(2.5), Value::Bool(false)])
        );
        assert_eq!(
            convert_results(&[ValueType::F64], &[]),
            Err(ExecError::ResultArity { expected: 1, found: 0 })
        );
        assert_eq!(
            convert_results(&[ValueType::F64], &[WasmValue::I32(1)]),
            Err(ExecError::ResultType {
                index: 0,
                expected: ValueType::F64,
                found: ValueType::I32,
            })
        );
    }
}
