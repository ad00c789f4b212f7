//! Registration, validation and discovery through the public registry API.

mod common;

use common::*;
use quidditch_udf::manifest::load_descriptor;
use quidditch_udf::{
    DocumentContext, ExecutionMode, ModuleDescriptor, ModuleQuery, ParamSpec, ParameterMap, ValidationError,
    Value, ValueType,
};

// ============================================================
// Validation failures register nothing
// ============================================================

#[test]
fn test_rejected_modules_leave_registry_empty() {
    let engine = interpreter_engine();

    let cases: Vec<(ModuleDescriptor, fn(&ValidationError) -> bool)> = vec![
        (
            ModuleDescriptor::builder("bad", "1", "score", b"not wasm".to_vec())
                .returns(ValueType::F64)
                .build(),
            |e| matches!(e, ValidationError::MalformedBytecode(_)),
        ),
        (
            ModuleDescriptor::builder("bad", "1", "missing", wasm(SCORE_BOOST))
                .param(ParamSpec::optional("boost", ValueType::F64))
                .returns(ValueType::F64)
                .build(),
            |e| matches!(e, ValidationError::MissingEntryPoint(name) if name == "missing"),
        ),
        (
            // Declares i32 where the export takes f64.
            ModuleDescriptor::builder("bad", "1", "score", wasm(SCORE_BOOST))
                .param(ParamSpec::optional("boost", ValueType::I32))
                .returns(ValueType::F64)
                .build(),
            |e| matches!(e, ValidationError::SignatureMismatch { .. }),
        ),
        (
            ModuleDescriptor::builder("bad", "1", "score", wasm(SCORE_BOOST))
                .param(ParamSpec::optional("boost", ValueType::F64).with_default("high"))
                .returns(ValueType::F64)
                .build(),
            |e| matches!(e, ValidationError::DefaultTypeMismatch { .. }),
        ),
        (
            ModuleDescriptor::builder("", "1", "score", wasm(SCORE_BOOST))
                .returns(ValueType::F64)
                .build(),
            |e| matches!(e, ValidationError::EmptyField(_)),
        ),
        (
            ModuleDescriptor::builder(
                "bad",
                "1",
                "run",
                wasm(r#"(module
                    (import "wasi_snapshot_preview1" "fd_write" (func (param i32 i32 i32 i32) (result i32)))
                    (func (export "run") (param i64) (result i32) (i32.const 0)))"#),
            )
            .returns(ValueType::I32)
            .build(),
            |e| matches!(e, ValidationError::ForbiddenImport { module, .. } if module == "wasi_snapshot_preview1"),
        ),
    ];

    for (desc, expected) in cases {
        let err = engine.register(desc).unwrap_err();
        assert!(expected(&err), "unexpected error: {err}");
    }
    assert!(engine.is_empty());
    assert!(engine.list_modules().is_empty());
    assert_eq!(engine.engine_stats().registrations, 0);
}

#[test]
fn test_start_function_trap_rejected() {
    let engine = interpreter_engine();
    let desc = ModuleDescriptor::builder(
        "boom",
        "1",
        "run",
        wasm(r#"(module
            (func $init unreachable)
            (start $init)
            (func (export "run") (param i64) (result i32) (i32.const 0)))"#),
    )
    .returns(ValueType::I32)
    .build();

    assert!(matches!(engine.register(desc), Err(ValidationError::Interpreter(_))));
    assert!(engine.is_empty());
}

#[test]
fn test_duplicate_registration() {
    let engine = interpreter_engine();
    assert_eq!(engine.register(score_boost("boost", "1")), Ok(ExecutionMode::Interpreted));
    assert!(matches!(
        engine.register(score_boost("boost", "1")),
        Err(ValidationError::Duplicate(key)) if key.to_string() == "boost@1"
    ));
    // A different version is a different module.
    engine.register(score_boost("boost", "2")).unwrap();
    assert_eq!(engine.len(), 2);
}

// ============================================================
// Discovery
// ============================================================

#[test]
fn test_query_by_metadata() {
    let engine = interpreter_engine();
    engine.register(score_boost("boost", "1.0.0")).unwrap();
    engine.register(score_boost("boost", "1.1.0")).unwrap();
    engine.register(field_echo("echo")).unwrap();

    let all = engine.list_modules();
    let keys: Vec<String> = all.iter().map(|m| m.key.to_string()).collect();
    assert_eq!(keys, vec!["boost@1.0.0", "boost@1.1.0", "echo@1"]);

    let ranking = engine.query(&ModuleQuery::new().tag("ranking").category("scoring"));
    assert_eq!(ranking.len(), 2);
    assert!(ranking.iter().all(|m| m.metadata.author.as_deref() == Some("search-team")));

    assert!(engine.query(&ModuleQuery::new().tag("ranking").tag("geo")).is_empty());
    assert_eq!(engine.query(&ModuleQuery::new().name("echo")).len(), 1);

    let info = &ranking[0];
    assert_eq!(info.entry_point, "score");
    assert_eq!(info.returns, vec![ValueType::F64]);
    assert_eq!(info.mode, ExecutionMode::Interpreted);
    assert_eq!(info.bytecode_len, wasm(SCORE_BOOST).len());
}

#[test]
fn test_latest_version() {
    let engine = interpreter_engine();
    for v in ["1.2.0", "1.10.0", "1.9.3"] {
        engine.register(score_boost("boost", v)).unwrap();
    }
    assert_eq!(engine.latest("boost").unwrap().key.version, "1.10.0");
    assert!(engine.latest("missing").is_none());

    engine.unregister("boost", "1.10.0").unwrap();
    assert_eq!(engine.latest("boost").unwrap().key.version, "1.9.3");
}

#[test]
fn test_stats_for_all_modules() {
    let engine = interpreter_engine();
    engine.register(score_boost("a", "1")).unwrap();
    engine.register(score_boost("b", "1")).unwrap();
    engine
        .invoke("b", "1", DocumentContext::bare("d", 1.0), &ParameterMap::new())
        .unwrap();

    let all = engine.all_stats();
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].call_count, 0);
    assert_eq!(all[1].call_count, 1);
    assert_eq!(all[1].content_hash, all[0].content_hash);
    assert!(engine.stats("c", "1").is_err());
}

// ============================================================
// Manifests
// ============================================================

#[test]
fn test_register_from_manifest() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("boost.wasm"), wasm(SCORE_BOOST)).unwrap();
    let manifest = dir.path().join("udf.toml");
    std::fs::write(
        &manifest,
        r#"
            returns = ["f64"]

            [module]
            name = "boost"
            version = "2.0.0"
            entry = "score"
            wasm = "boost.wasm"
            tags = ["ranking"]

            [[params]]
            name = "boost"
            type = "f64"
            default = 2
        "#,
    )
    .unwrap();

    let engine = interpreter_engine();
    engine.register(load_descriptor(&manifest).unwrap()).unwrap();

    // Integer default widened to the declared f64.
    let out = engine
        .invoke("boost", "2.0.0", DocumentContext::bare("d", 1.5), &ParameterMap::new())
        .unwrap();
    assert_eq!(out, vec![Value::F64(3.0)]);
    assert_eq!(engine.query(&ModuleQuery::new().tag("ranking")).len(), 1);
}
