//! Runtime value representation.
//!
//! `Value` is the in-worker form of every input and output: secrets keep
//! their raw content, paths stay paths. The wire encodings (masked secrets,
//! `file://` paths) only exist at the JSON boundary, driven by the field
//! types in [`crate::types`].

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use indexmap::IndexMap;

use crate::error::{Result, SchemaError};

/// The masked rendering of a secret, on the wire and in schema defaults.
pub const SECRET_MASK: &str = "**********";

/// A secret value. The raw content is preserved inside the worker and only
/// reachable through [`Secret::expose`]; `Display` and `Debug` mask it.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// The raw secret value. Never ends up in responses or schemas.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(SECRET_MASK)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret({SECRET_MASK})")
    }
}

/// In-worker value for inputs and outputs.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Path(PathBuf),
    Secret(Secret),
    /// Decoded payload of a custom-coded field.
    Json(serde_json::Value),
    List(Vec<Value>),
    /// Object output: named fields in declaration order.
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Short type name for error messages.
    pub fn type_name(&self) -> &'static str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "bool",
            Value::Int(_) => "integer",
            Value::Float(_) => "float",
            Value::Str(_) => "string",
            Value::Path(_) => "path",
            Value::Secret(_) => "secret",
            Value::Json(_) => "custom",
            Value::List(_) => "list",
            Value::Object(_) => "object",
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Float(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Str(v)
    }
}

impl From<PathBuf> for Value {
    fn from(v: PathBuf) -> Self {
        Value::Path(v)
    }
}

/// Encoding between a custom type and its JSON representation.
///
/// Coders are registered per signature, not process-wide, so tests stay
/// hermetic. `decode` runs on incoming request values, `encode` on outgoing
/// response values.
pub trait Coder: Send + Sync {
    fn name(&self) -> &str;

    fn decode(&self, raw: &serde_json::Value) -> Result<serde_json::Value>;

    fn encode(&self, value: &serde_json::Value) -> Result<serde_json::Value>;
}

/// Per-signature registry of custom-type coders.
#[derive(Clone, Default)]
pub struct CoderRegistry {
    coders: HashMap<String, Arc<dyn Coder>>,
}

impl CoderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, coder: Arc<dyn Coder>) {
        self.coders.insert(coder.name().to_string(), coder);
    }

    pub fn get(&self, name: &str) -> Result<&Arc<dyn Coder>> {
        self.coders
            .get(name)
            .ok_or_else(|| SchemaError::UnknownCoder(name.to_string()))
    }

    pub fn is_empty(&self) -> bool {
        self.coders.is_empty()
    }
}

impl fmt::Debug for CoderRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoderRegistry")
            .field("coders", &self.coders.keys().collect::<Vec<_>>())
            .finish()
    }
}
