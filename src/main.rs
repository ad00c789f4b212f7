//! `quidditch-udf` - inspect and exercise UDF modules from the command line.
//!
//! ```text
//! quidditch-udf inspect scorer.wasm
//! quidditch-udf run udf.toml --doc doc.json --score 2.0 --param boost=1.5 -n 100
//! ```

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::json;
use tracing::{error, info, Level};

use quidditch_udf::manifest::load_descriptor;
use quidditch_udf::validate::validate_bytecode;
use quidditch_udf::{
    ContentHash, DocumentContext, EngineConfig, ParameterMap, Tier, UdfEngine, Value,
};

#[derive(Parser, Debug)]
#[command(name = "quidditch-udf", version)]
#[command(about = "Tiered WebAssembly UDF engine tools")]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Engine configuration file (TOML)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a module and print its hash, imports and exports
    Inspect {
        wasm: PathBuf,

        /// Memory page limit to validate against
        #[arg(long, default_value_t = quidditch_udf::config::DEFAULT_MAX_MEMORY_PAGES)]
        max_memory_pages: u32,
    },

    /// Register the module described by a udf.toml and invoke it
    Run {
        manifest: PathBuf,

        /// Document fields as a JSON file
        #[arg(long)]
        doc: Option<PathBuf>,

        #[arg(long, default_value = "doc-1")]
        doc_id: String,

        /// Base relevance score of the document
        #[arg(long, default_value_t = 1.0)]
        score: f64,

        /// Call parameter as name=value (repeatable)
        #[arg(long = "param", value_name = "NAME=VALUE")]
        params: Vec<String>,

        /// Number of invocations
        #[arg(short = 'n', long, default_value_t = 1)]
        iterations: u32,

        /// Wait this long for the native tier before invoking
        #[arg(long, value_name = "MS")]
        wait_native_ms: Option<u64>,
    },
}

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

fn inspect(wasm: &PathBuf, max_memory_pages: u32) -> CliResult<serde_json::Value> {
    let bytes = std::fs::read(wasm)?;
    let shape = validate_bytecode(&bytes, max_memory_pages)?;
    Ok(json!({
        "file": wasm,
        "size": bytes.len(),
        "content_hash": ContentHash::of(&bytes),
        "imports": shape.imports,
        "exports": shape.functions,
        "exports_memory": shape.exports_memory,
        "initial_memory_pages": shape.initial_memory_pages,
    }))
}

/// Parse `name=value`, typing the value after the declared parameter.
fn parse_param(raw: &str, desc: &quidditch_udf::ModuleDescriptor) -> CliResult<(String, Value)> {
    let (name, text) = raw
        .split_once('=')
        .ok_or_else(|| format!("parameter '{raw}' is not NAME=VALUE"))?;
    let json = serde_json::from_str(text).unwrap_or_else(|_| serde_json::Value::String(text.to_owned()));
    let value = match desc.param(name) {
        Some(spec) => Value::from_json(spec.ty, &json)
            .ok_or_else(|| format!("parameter '{name}' expects {}, got '{text}'", spec.ty))?,
        None => match json {
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => n.as_f64().map(Value::F64).unwrap_or(Value::String(text.to_owned())),
            _ => Value::String(text.to_owned()),
        },
    };
    Ok((name.to_owned(), value))
}

#[allow(clippy::too_many_arguments)]
fn run(
    config: EngineConfig,
    manifest: &PathBuf,
    doc: Option<&PathBuf>,
    doc_id: &str,
    score: f64,
    raw_params: &[String],
    iterations: u32,
    wait_native_ms: Option<u64>,
) -> CliResult<serde_json::Value> {
    let engine = UdfEngine::new(config)?;
    let desc = load_descriptor(manifest)?;
    let key = desc.key().clone();

    let params: ParameterMap = raw_params
        .iter()
        .map(|raw| parse_param(raw, &desc))
        .collect::<CliResult<_>>()?;
    let fields: serde_json::Value = match doc {
        Some(path) => serde_json::from_str(&std::fs::read_to_string(path)?)?,
        None => serde_json::Value::Object(Default::default()),
    };

    let initial_mode = engine.register(desc)?;
    info!(module = %key, mode = %initial_mode, "Registered");
    if let Some(ms) = wait_native_ms {
        let mode = engine.wait_for_compilation(&key.name, &key.version, Duration::from_millis(ms))?;
        info!(module = %key, %mode, "Compilation settled");
    }

    let mut last = Vec::new();
    let (mut interpreted, mut native) = (0u32, 0u32);
    for _ in 0..iterations {
        let document = DocumentContext::from_json(doc_id, score, fields.clone());
        let invocation = engine.invoke_traced(&key.name, &key.version, document, &params)?;
        match invocation.tier {
            Tier::Interpreter => interpreted += 1,
            Tier::Native => native += 1,
        }
        last = invocation.values;
    }

    Ok(json!({
        "module": key.to_string(),
        "registered_mode": initial_mode,
        "results": last,
        "calls": { "interpreter": interpreted, "native": native },
        "stats": engine.stats(&key.name, &key.version)?,
        "engine": engine.engine_stats(),
        "cache": engine.cache_stats(),
    }))
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let result = (|| -> CliResult<serde_json::Value> {
        match &cli.command {
            Command::Inspect { wasm, max_memory_pages } => inspect(wasm, *max_memory_pages),
            Command::Run {
                manifest,
                doc,
                doc_id,
                score,
                params,
                iterations,
                wait_native_ms,
            } => {
                let config = match &cli.config {
                    Some(path) => EngineConfig::from_file(path)?,
                    None => EngineConfig::default(),
                };
                run(
                    config,
                    manifest,
                    doc.as_ref(),
                    doc_id,
                    *score,
                    params,
                    *iterations,
                    *wait_native_ms,
                )
            }
        }
    })();

    match result.and_then(|out| Ok(serde_json::to_string_pretty(&out)?)) {
        Ok(text) => {
            println!("{text}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}
