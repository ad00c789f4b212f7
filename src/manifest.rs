//! `udf.toml` manifests.
//!
//! ```toml
//! returns = ["f64"]
//!
//! [module]
//! name = "geo-boost"
//! version = "1.2.0"
//! entry = "score"
//! wasm = "geo_boost.wasm"      # relative to the manifest
//! description = "Boost documents near a point"
//! author = "search-team"
//! category = "geo"
//! tags = ["ranking", "geo"]
//! license = "Apache-2.0"
//!
//! [[params]]
//! name = "boost"
//! type = "f64"
//! default = 1.5
//!
//! [[params]]
//! name = "lang"
//! type = "string"
//! required = true
//!
//! [limits]
//! pool_size = 8
//! fuel = 5000000
//!
//! [custom]
//! owner = "relevance"
//! ```
//!
//! A parameter is optional unless `required = true`. Defaults are carried as
//! written; the validator checks them against the declared type.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::descriptor::{ModuleDescriptor, ModuleLimits, ModuleMetadata, ParamSpec};
use crate::error::ManifestError;
use crate::value::{Value, ValueType};

#[derive(Debug, Clone, Deserialize)]
pub struct UdfManifest {
    pub module: ManifestModule,
    #[serde(default)]
    pub params: Vec<ManifestParam>,
    pub returns: Vec<ValueType>,
    #[serde(default)]
    pub limits: ModuleLimits,
    #[serde(default)]
    pub custom: BTreeMap<String, String>,
}

/// The `[module]` section.
#[derive(Debug, Clone, Deserialize)]
pub struct ManifestModule {
    pub name: String,
    pub version: String,
    pub entry: String,
    pub wasm: PathBuf,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub license: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ManifestParam {
    pub name: String,
    #[serde(rename = "type")]
    pub ty: ValueType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<toml::Value>,
}

fn scalar(name: &str, value: &toml::Value) -> Result<Value, ManifestError> {
    match value {
        toml::Value::Integer(i) => Ok(Value::I64(*i)),
        toml::Value::Float(f) => Ok(Value::F64(*f)),
        toml::Value::Boolean(b) => Ok(Value::Bool(*b)),
        toml::Value::String(s) => Ok(Value::String(s.clone())),
        _ => Err(ManifestError::UnsupportedDefault(name.to_owned())),
    }
}

impl UdfManifest {
    pub fn parse(content: &str) -> Result<Self, ManifestError> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ManifestError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ManifestError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&content)
    }

    /// Path of the wasm file, resolved against the manifest's directory.
    pub fn wasm_path(&self, manifest_dir: &Path) -> PathBuf {
        if self.module.wasm.is_absolute() {
            self.module.wasm.clone()
        } else {
            manifest_dir.join(&self.module.wasm)
        }
    }

    /// Build a descriptor around already loaded bytecode.
    pub fn to_descriptor(&self, bytecode: Vec<u8>) -> Result<ModuleDescriptor, ManifestError> {
        let m = &self.module;
        let metadata = ModuleMetadata {
            description: m.description.clone(),
            author: m.author.clone(),
            category: m.category.clone(),
            tags: m.tags.clone(),
            license: m.license.clone(),
            custom: self.custom.clone(),
        };
        let mut builder = ModuleDescriptor::builder(&m.name, &m.version, &m.entry, bytecode)
            .metadata(metadata)
            .limits(self.limits);
        for p in &self.params {
            let mut spec = if p.required {
                ParamSpec::required(&p.name, p.ty)
            } else {
                ParamSpec::optional(&p.name, p.ty)
            };
            if let Some(default) = &p.default {
                spec = spec.with_default(scalar(&p.name, default)?);
            }
            builder = builder.param(spec);
        }
        for ty in &self.returns {
            builder = builder.returns(*ty);
        }
        Ok(builder.build())
    }
}

/// Read a manifest and the wasm file it points at.
pub fn load_descriptor(manifest_path: impl AsRef<Path>) -> Result<ModuleDescriptor, ManifestError> {
    let manifest_path = manifest_path.as_ref();
    let manifest = UdfManifest::from_file(manifest_path)?;
    let dir = manifest_path.parent().unwrap_or_else(|| Path::new("."));
    let wasm_path = manifest.wasm_path(dir);
    let bytecode = std::fs::read(&wasm_path).map_err(|source| ManifestError::Read {
        path: wasm_path.clone(),
        source,
    })?;
    manifest.to_descriptor(bytecode)
}
