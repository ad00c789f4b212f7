//! Per-call execution contexts.
//!
//! Every invocation registers its [`DocumentContext`] under a fresh id before
//! the guest runs and removes it afterwards ([`ContextGuard`]). The guest only
//! ever sees that id; host callbacks resolve it through the
//! [`ContextRegistry`]. Ids come from a monotonically increasing counter and
//! are never reused, so a stale or forged id can only miss.

use std::borrow::Cow;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;

use crate::value::Value;

/// A document field as seen by host callbacks.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue<'a> {
    Int(i64),
    Float(f64),
    Bool(bool),
    Str(Cow<'a, str>),
    /// Present but not a scalar (object, array, null).
    Other,
}

impl FieldValue<'_> {
    pub fn as_f64(&self) -> Option<f64> {
        match *self {
            FieldValue::Int(v) => Some(v as f64),
            FieldValue::Float(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match *self {
            FieldValue::Int(v) => Some(v),
            FieldValue::Float(v) if v.is_finite() => Some(v as i64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match *self {
            FieldValue::Bool(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            FieldValue::Str(s) => Some(&**s),
            _ => None,
        }
    }
}

/// Read access to the fields of the document being scored.
///
/// Implemented by the storage layer; JSON documents and flat value maps are
/// supported out of the box.
pub trait DocumentFields: Send + Sync {
    fn field(&self, path: &str) -> Option<FieldValue<'_>>;
}

enum PathSegment<'a> {
    Key(&'a str),
    Index(usize),
}

/// Split `a.b[2].c` into keys and indexes. `None` on malformed brackets.
fn parse_path(path: &str) -> Option<Vec<PathSegment<'_>>> {
    let mut segments = Vec::new();
    for part in path.split('.') {
        let (key, mut rest) = match part.find('[') {
            Some(i) => (&part[..i], &part[i..]),
            None => (part, ""),
        };
        if !key.is_empty() {
            segments.push(PathSegment::Key(key));
        }
        while !rest.is_empty() {
            let close = rest.find(']')?;
            let index = rest.get(1..close)?.parse().ok()?;
            segments.push(PathSegment::Index(index));
            rest = &rest[close + 1..];
            if !rest.is_empty() && !rest.starts_with('[') {
                return None;
            }
        }
    }
    Some(segments)
}

fn json_scalar(value: &serde_json::Value) -> FieldValue<'_> {
    match value {
        serde_json::Value::Bool(b) => FieldValue::Bool(*b),
        serde_json::Value::Number(n) => match n.as_i64() {
            Some(i) => FieldValue::Int(i),
            None => n.as_f64().map_or(FieldValue::Other, FieldValue::Float),
        },
        serde_json::Value::String(s) => FieldValue::Str(Cow::Borrowed(s)),
        _ => FieldValue::Other,
    }
}

impl DocumentFields for serde_json::Value {
    fn field(&self, path: &str) -> Option<FieldValue<'_>> {
        // Literal keys containing dots win over nested lookup.
        if let Some(v) = self.as_object().and_then(|o| o.get(path)) {
            return Some(json_scalar(v));
        }
        let mut current = self;
        for segment in parse_path(path)? {
            current = match segment {
                PathSegment::Key(k) => current.as_object()?.get(k)?,
                PathSegment::Index(i) => current.as_array()?.get(i)?,
            };
        }
        Some(json_scalar(current))
    }
}

impl DocumentFields for HashMap<String, Value> {
    fn field(&self, path: &str) -> Option<FieldValue<'_>> {
        Some(match self.get(path)? {
            Value::I32(v) => FieldValue::Int(*v as i64),
            Value::I64(v) => FieldValue::Int(*v),
            Value::F32(v) => FieldValue::Float(*v as f64),
            Value::F64(v) => FieldValue::Float(*v),
            Value::Bool(v) => FieldValue::Bool(*v),
            Value::String(s) => FieldValue::Str(Cow::Borrowed(s)),
        })
    }
}

/// The document a call is scoring: id, base score and field data.
#[derive(Clone)]
pub struct DocumentContext {
    doc_id: String,
    score: f64,
    fields: Arc<dyn DocumentFields>,
}

impl DocumentContext {
    pub fn new(doc_id: impl Into<String>, score: f64, fields: Arc<dyn DocumentFields>) -> Self {
        Self {
            doc_id: doc_id.into(),
            score,
            fields,
        }
    }

    pub fn from_json(doc_id: impl Into<String>, score: f64, fields: serde_json::Value) -> Self {
        Self::new(doc_id, score, Arc::new(fields))
    }

    /// A document without fields.
    pub fn bare(doc_id: impl Into<String>, score: f64) -> Self {
        Self::from_json(doc_id, score, serde_json::Value::Null)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    pub fn score(&self) -> f64 {
        self.score
    }

    pub fn field(&self, path: &str) -> Option<FieldValue<'_>> {
        self.fields.field(path)
    }
}

impl fmt::Debug for DocumentContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DocumentContext")
            .field("doc_id", &self.doc_id)
            .field("score", &self.score)
            .finish_non_exhaustive()
    }
}

/// What a registered id resolves to while its call is in flight.
pub struct CallContext {
    pub document: DocumentContext,
    /// String-typed parameters of the call, readable via `get_param_string`.
    pub string_params: Vec<(String, String)>,
    field_reads: AtomicU64,
}

impl CallContext {
    pub fn new(document: DocumentContext, string_params: Vec<(String, String)>) -> Self {
        Self {
            document,
            string_params,
            field_reads: AtomicU64::new(0),
        }
    }

    /// Field lookup that also counts the access.
    pub fn field(&self, path: &str) -> Option<FieldValue<'_>> {
        self.field_reads.fetch_add(1, Ordering::Relaxed);
        self.document.field(path)
    }

    pub fn string_param(&self, name: &str) -> Option<&str> {
        self.string_params
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn field_reads(&self) -> u64 {
        self.field_reads.load(Ordering::Relaxed)
    }
}

/// Concurrent map from context id to in-flight call context.
pub struct ContextRegistry {
    contexts: DashMap<u64, Arc<CallContext>>,
    next_id: AtomicU64,
}

impl ContextRegistry {
    pub fn new() -> Self {
        Self {
            contexts: DashMap::new(),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a context under a fresh id. It is removed when the guard drops.
    pub fn register(&self, ctx: CallContext) -> ContextGuard<'_> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let ctx = Arc::new(ctx);
        self.contexts.insert(id, Arc::clone(&ctx));
        ContextGuard {
            registry: self,
            id,
            ctx,
        }
    }

    /// Run `f` against the context registered as `id`, if any.
    ///
    /// Ids arrive from the guest as `i64`; negative values never resolve.
    #[inline]
    pub fn with<R>(&self, id: i64, f: impl FnOnce(&CallContext) -> R) -> Option<R> {
        let id = u64::try_from(id).ok()?;
        self.contexts.get(&id).map(|entry| f(&**entry))
    }

    pub fn len(&self) -> usize {
        self.contexts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.contexts.is_empty()
    }
}

impl Default for ContextRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Keeps a context registered for the lifetime of one call.
pub struct ContextGuard<'a> {
    registry: &'a ContextRegistry,
    id: u64,
    ctx: Arc<CallContext>,
}

impl ContextGuard<'_> {
    /// Id handed to the guest as the first entry-point argument.
    #[inline]
    pub fn id(&self) -> i64 {
        self.id as i64
    }

    pub fn context(&self) -> &CallContext {
        &self.ctx
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        self.registry.contexts.remove(&self.id);
    }
}
