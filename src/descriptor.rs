//! Module descriptors: identity, declared signature, bytecode and metadata.
//!
//! A [`ModuleDescriptor`] is immutable once built. Its [`ContentHash`] is the
//! SHA-256 digest of the bytecode and keys the native code cache, so two
//! descriptors with byte-identical bytecode share one compiled artifact no
//! matter what they are called.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::value::{Value, ValueType};

/// SHA-256 digest of a module's bytecode.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContentHash([u8; 32]);

impl ContentHash {
    pub fn of(bytes: &[u8]) -> Self {
        let digest = Sha256::digest(bytes);
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        ContentHash(out)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    pub fn from_hex(s: &str) -> Option<Self> {
        let mut out = [0u8; 32];
        hex::decode_to_slice(s, &mut out).ok()?;
        Some(ContentHash(out))
    }

    /// First 12 hex characters, for log lines.
    pub fn short(&self) -> String {
        hex::encode(&self.0[..6])
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContentHash({})", self.short())
    }
}

impl Serialize for ContentHash {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for ContentHash {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        ContentHash::from_hex(&s)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid content hash '{s}'")))
    }
}

/// Registry identity of a module, rendered as `name@version`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct ModuleKey {
    pub name: String,
    pub version: String,
}

impl ModuleKey {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Parse `name@version`. The version is everything after the last `@`.
    pub fn parse(s: &str) -> Option<Self> {
        let (name, version) = s.rsplit_once('@')?;
        if name.is_empty() || version.is_empty() {
            return None;
        }
        Some(Self::new(name, version))
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A declared parameter.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParamSpec {
    pub name: String,
    pub ty: ValueType,
    pub required: bool,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn required(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: true,
            default: None,
        }
    }

    pub fn optional(name: impl Into<String>, ty: ValueType) -> Self {
        Self {
            name: name.into(),
            ty,
            required: false,
            default: None,
        }
    }

    pub fn with_default(mut self, default: impl Into<Value>) -> Self {
        self.default = Some(default.into());
        self
    }

    /// Whether this parameter is passed positionally to the entry point.
    /// String parameters are only reachable through `get_param_string`.
    #[inline]
    pub fn is_positional(&self) -> bool {
        self.ty != ValueType::String
    }
}

/// Discovery metadata. Carried and queried, never interpreted.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleMetadata {
    pub description: Option<String>,
    pub author: Option<String>,
    pub category: Option<String>,
    pub tags: Vec<String>,
    pub license: Option<String>,
    pub custom: BTreeMap<String, String>,
}

/// Per-module overrides of engine-wide limits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModuleLimits {
    /// Idle instances kept per tier.
    pub pool_size: Option<usize>,
    /// Instruction budget per call.
    pub fuel: Option<u64>,
}

/// Immutable description of a registered (or to-be-registered) module.
#[derive(Clone)]
pub struct ModuleDescriptor {
    key: ModuleKey,
    entry_point: String,
    params: Vec<ParamSpec>,
    returns: Vec<ValueType>,
    bytecode: Arc<[u8]>,
    content_hash: ContentHash,
    metadata: ModuleMetadata,
    limits: ModuleLimits,
}

impl ModuleDescriptor {
    pub fn builder(
        name: impl Into<String>,
        version: impl Into<String>,
        entry_point: impl Into<String>,
        bytecode: impl Into<Arc<[u8]>>,
    ) -> ModuleDescriptorBuilder {
        ModuleDescriptorBuilder {
            key: ModuleKey::new(name, version),
            entry_point: entry_point.into(),
            params: Vec::new(),
            returns: Vec::new(),
            bytecode: bytecode.into(),
            metadata: ModuleMetadata::default(),
            limits: ModuleLimits::default(),
        }
    }

    pub fn key(&self) -> &ModuleKey {
        &self.key
    }

    pub fn name(&self) -> &str {
        &self.key.name
    }

    pub fn version(&self) -> &str {
        &self.key.version
    }

    pub fn entry_point(&self) -> &str {
        &self.entry_point
    }

    pub fn params(&self) -> &[ParamSpec] {
        &self.params
    }

    pub fn param(&self, name: &str) -> Option<&ParamSpec> {
        self.params.iter().find(|p| p.name == name)
    }

    pub fn returns(&self) -> &[ValueType] {
        &self.returns
    }

    pub fn bytecode(&self) -> &Arc<[u8]> {
        &self.bytecode
    }

    pub fn content_hash(&self) -> ContentHash {
        self.content_hash
    }

    pub fn metadata(&self) -> &ModuleMetadata {
        &self.metadata
    }

    pub fn limits(&self) -> &ModuleLimits {
        &self.limits
    }
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("key", &self.key.to_string())
            .field("entry_point", &self.entry_point)
            .field("params", &self.params)
            .field("returns", &self.returns)
            .field("bytecode_len", &self.bytecode.len())
            .field("content_hash", &self.content_hash)
            .finish()
    }
}

/// Builder for [`ModuleDescriptor`]. The content hash is computed on `build`.
#[derive(Debug, Clone)]
pub struct ModuleDescriptorBuilder {
    key: ModuleKey,
    entry_point: String,
    params: Vec<ParamSpec>,
    returns: Vec<ValueType>,
    bytecode: Arc<[u8]>,
    metadata: ModuleMetadata,
    limits: ModuleLimits,
}

impl ModuleDescriptorBuilder {
    pub fn param(mut self, param: ParamSpec) -> Self {
        self.params.push(param);
        self
    }

    pub fn returns(mut self, ty: ValueType) -> Self {
        self.returns.push(ty);
        self
    }

    pub fn metadata(mut self, metadata: ModuleMetadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.metadata.tags.push(tag.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.metadata.category = Some(category.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.metadata.author = Some(author.into());
        self
    }

    pub fn limits(mut self, limits: ModuleLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn pool_size(mut self, size: usize) -> Self {
        self.limits.pool_size = Some(size);
        self
    }

    pub fn fuel(mut self, fuel: u64) -> Self {
        self.limits.fuel = Some(fuel);
        self
    }

    pub fn build(self) -> ModuleDescriptor {
        let content_hash = ContentHash::of(&self.bytecode);
        ModuleDescriptor {
            key: self.key,
            entry_point: self.entry_point,
            params: self.params,
            returns: self.returns,
            bytecode: self.bytecode,
            content_hash,
            metadata: self.metadata,
            limits: self.limits,
        }
    }
}

/// Discovery filter. Unset fields match everything; `tags` must all be present.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ModuleQuery {
    pub name: Option<String>,
    pub version: Option<String>,
    pub tags: Vec<String>,
    pub category: Option<String>,
    pub author: Option<String>,
}

impl ModuleQuery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn version(mut self, version: impl Into<String>) -> Self {
        self.version = Some(version.into());
        self
    }

    pub fn tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.push(tag.into());
        self
    }

    pub fn category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn author(mut self, author: impl Into<String>) -> Self {
        self.author = Some(author.into());
        self
    }

    pub fn matches(&self, desc: &ModuleDescriptor) -> bool {
        let meta = desc.metadata();
        self.name.as_deref().map_or(true, |n| n == desc.name())
            && self.version.as_deref().map_or(true, |v| v == desc.version())
            && self.category.as_deref().map_or(true, |c| meta.category.as_deref() == Some(c))
            && self.author.as_deref().map_or(true, |a| meta.author.as_deref() == Some(a))
            && self.tags.iter().all(|t| meta.tags.contains(t))
    }
}
