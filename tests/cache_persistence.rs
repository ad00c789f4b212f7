//! The native code cache on disk: artifacts survive an engine restart.

#![cfg(feature = "native")]

mod common;

use std::time::Duration;

use common::*;
use quidditch_udf::{ContentHash, DocumentContext, EngineConfig, ExecutionMode, NativeCodeCache, ParameterMap, Tier};

const SETTLE: Duration = Duration::from_secs(30);

#[test]
fn test_restart_goes_straight_to_native() {
    let dir = tempfile::tempdir().unwrap();
    let hash = ContentHash::of(&wasm(SCORE_BOOST));

    {
        let (engine, backend) = native_engine(EngineConfig::with_cache_dir(dir.path()), |b| b);
        assert_eq!(engine.register(score_boost("boost", "1")), Ok(ExecutionMode::Compiling));
        assert_eq!(engine.wait_for_compilation("boost", "1", SETTLE), Ok(ExecutionMode::Native));
        assert_eq!(backend.compiles(), 1);
    }

    let hex = hash.to_hex();
    assert!(dir.path().join(format!("{hex}.cwasm")).is_file());
    assert!(dir.path().join(format!("{hex}.json")).is_file());

    // Same bytecode, new engine, different name.
    let (engine, backend) = native_engine(EngineConfig::with_cache_dir(dir.path()), |b| b);
    assert_eq!(engine.cache_stats().entries, 1);
    assert_eq!(engine.register(score_boost("boost-v2", "1")), Ok(ExecutionMode::Native));
    assert_eq!(backend.compiles(), 0);

    let call = engine
        .invoke_traced("boost-v2", "1", DocumentContext::bare("d", 1.5), &ParameterMap::new())
        .unwrap();
    assert_eq!(call.tier, Tier::Native);
    assert!(engine.stats("boost-v2", "1").unwrap().compile.from_cache);
    assert_eq!(engine.engine_stats().cache_hits, 1);
}

#[test]
fn test_damaged_artifact_is_recompiled_not_loaded() {
    let dir = tempfile::tempdir().unwrap();
    let hash = ContentHash::of(&wasm(SCORE_BOOST));
    {
        let (engine, _backend) = native_engine(EngineConfig::with_cache_dir(dir.path()), |b| b);
        engine.register(score_boost("boost", "1")).unwrap();
        assert_eq!(engine.wait_for_compilation("boost", "1", SETTLE), Ok(ExecutionMode::Native));
    }

    // Overwrite the code with `ud2` pairs, keeping the file size.
    let artifact = dir.path().join(format!("{}.cwasm", hash.to_hex()));
    let mut bytes = std::fs::read(&artifact).unwrap();
    let len = bytes.len();
    for pair in bytes[len / 4..len - len / 4].chunks_exact_mut(2) {
        pair.copy_from_slice(&[0x0f, 0x0b]);
    }
    std::fs::write(&artifact, &bytes).unwrap();
    assert_eq!(std::fs::metadata(&artifact).unwrap().len(), len as u64);

    let (engine, backend) = native_engine(EngineConfig::with_cache_dir(dir.path()), |b| b);
    assert_eq!(engine.cache_stats().entries, 1);
    assert_eq!(engine.register(score_boost("boost", "1")), Ok(ExecutionMode::Compiling));
    assert_eq!(engine.wait_for_compilation("boost", "1", SETTLE), Ok(ExecutionMode::Native));
    assert_eq!(backend.compiles(), 1);
    assert_eq!(engine.engine_stats().cache_hits, 0);

    let call = engine
        .invoke_traced("boost", "1", DocumentContext::bare("d", 1.5), &ParameterMap::new())
        .unwrap();
    assert_eq!(call.tier, Tier::Native);
    assert_eq!(call.values, vec![quidditch_udf::Value::F64(1.5)]);
    assert!(!engine.stats("boost", "1").unwrap().compile.from_cache);
}

#[test]
fn test_incomplete_entries_are_discarded() {
    let dir = tempfile::tempdir().unwrap();
    let hash = ContentHash::of(b"some module");
    // Artifact without its metadata commit marker.
    std::fs::write(dir.path().join(format!("{}.cwasm", hash.to_hex())), b"partial").unwrap();

    let cache = NativeCodeCache::open(dir.path(), 1 << 20).unwrap();
    assert!(!cache.contains(&hash));
    assert_eq!(cache.stats().entries, 0);
}
