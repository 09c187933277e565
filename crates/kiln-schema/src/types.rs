//! Type system for kiln predictor signatures.
//!
//! Three layers, from user-facing to validated:
//!
//! - [`Declared`] / [`InputDecl`] / [`OutputDecl`] / [`Signature`]: what a
//!   predictor declares about itself (the annotation analog).
//! - [`FieldType`]: resolved `(primitive, repetition, coder)` triple.
//! - [`InputField`] / [`OutputShape`] / [`PredictorSpec`]: the immutable
//!   descriptor the inspector builds once at startup.

use indexmap::IndexMap;
use serde_json::json;

use crate::error::{Result, SchemaError};
use crate::value::{CoderRegistry, SECRET_MASK, Secret, Value};

// ---------------------------------------------------------------------------
// Primitive types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveType {
    Bool,
    Float,
    Integer,
    String,
    /// Serialised as `{"type":"string","format":"uri"}`; `file://` on responses.
    Path,
    /// Write-only, masked on every outgoing encoding.
    Secret,
    /// User-registered coder; opaque object in the schema.
    Custom,
}

impl PrimitiveType {
    /// JSON Schema fragment for this primitive.
    pub fn json_type(self) -> serde_json::Value {
        match self {
            Self::Bool => json!({"type": "boolean"}),
            Self::Float => json!({"type": "number"}),
            Self::Integer => json!({"type": "integer"}),
            Self::String => json!({"type": "string"}),
            Self::Path => json!({"type": "string", "format": "uri"}),
            Self::Secret => json!({
                "type": "string",
                "format": "password",
                "writeOnly": true,
                "x-cog-secret": true
            }),
            Self::Custom => json!({"type": "object"}),
        }
    }

    pub fn is_numeric(self) -> bool {
        matches!(self, Self::Integer | Self::Float)
    }

    /// Coerce a compatible value into canonical form.
    ///
    /// Numeric widening (int → float) and string wrapping (str → path/secret)
    /// are the only allowed conversions. Booleans are never coerced from
    /// integers, nor integers from floats.
    pub fn normalize(self, value: Value) -> Result<Value> {
        let mismatch = |expected: &'static str, got: &Value| SchemaError::IncompatibleValue {
            expected,
            got: got.type_name().to_string(),
        };

        match (self, value) {
            (Self::Bool, Value::Bool(b)) => Ok(Value::Bool(b)),
            (Self::Float, Value::Float(f)) => Ok(Value::Float(f)),
            (Self::Float, Value::Int(i)) => Ok(Value::Float(i as f64)),
            (Self::Integer, Value::Int(i)) => Ok(Value::Int(i)),
            (Self::String, Value::Str(s)) => Ok(Value::Str(s)),
            (Self::Path, Value::Path(p)) => Ok(Value::Path(p)),
            (Self::Path, Value::Str(s)) => Ok(Value::Path(s.into())),
            (Self::Secret, Value::Secret(s)) => Ok(Value::Secret(s)),
            (Self::Secret, Value::Str(s)) => Ok(Value::Secret(Secret::new(s))),
            (Self::Custom, Value::Json(v)) => Ok(Value::Json(v)),
            (Self::Bool, v) => Err(mismatch("bool", &v)),
            (Self::Float, v) => Err(mismatch("float", &v)),
            (Self::Integer, v) => Err(mismatch("integer", &v)),
            (Self::String, v) => Err(mismatch("string", &v)),
            (Self::Path, v) => Err(mismatch("path", &v)),
            (Self::Secret, v) => Err(mismatch("secret", &v)),
            (Self::Custom, v) => Err(mismatch("custom", &v)),
        }
    }

    fn decode(self, raw: &serde_json::Value, coder: Option<&str>, coders: &CoderRegistry) -> Result<Value> {
        let mismatch = |expected: &'static str| SchemaError::IncompatibleValue {
            expected,
            got: raw.to_string(),
        };

        match self {
            Self::Bool => raw.as_bool().map(Value::Bool).ok_or_else(|| mismatch("bool")),
            Self::Integer => raw.as_i64().map(Value::Int).ok_or_else(|| mismatch("integer")),
            Self::Float => raw.as_f64().map(Value::Float).ok_or_else(|| mismatch("float")),
            Self::String => raw
                .as_str()
                .map(|s| Value::Str(s.to_string()))
                .ok_or_else(|| mismatch("string")),
            Self::Path => raw
                .as_str()
                .map(|s| Value::Path(s.into()))
                .ok_or_else(|| mismatch("path")),
            Self::Secret => raw
                .as_str()
                .map(|s| Value::Secret(Secret::new(s)))
                .ok_or_else(|| mismatch("secret")),
            Self::Custom => {
                let name = coder.ok_or_else(|| SchemaError::UnknownCoder("<unnamed>".into()))?;
                let decoded = coders.get(name)?.decode(raw)?;
                Ok(Value::Json(decoded))
            }
        }
    }

    /// Encode for an outgoing response: paths as `file://<absolute>`,
    /// secrets masked, custom values through their coder.
    fn encode_response(
        self,
        value: &Value,
        coder: Option<&str>,
        coders: &CoderRegistry,
    ) -> Result<serde_json::Value> {
        match (self, value) {
            (Self::Bool, Value::Bool(b)) => Ok(json!(b)),
            (Self::Integer, Value::Int(i)) => Ok(json!(i)),
            (Self::Float, Value::Float(f)) => Ok(json!(f)),
            (Self::Float, Value::Int(i)) => Ok(json!(*i as f64)),
            (Self::String, Value::Str(s)) => Ok(json!(s)),
            (Self::Path, Value::Path(p)) => {
                let abs = std::path::absolute(p).unwrap_or_else(|_| p.clone());
                Ok(json!(format!("file://{}", abs.display())))
            }
            (Self::Secret, Value::Secret(_)) => Ok(json!(SECRET_MASK)),
            (Self::Custom, Value::Json(v)) => {
                let name = coder.ok_or_else(|| SchemaError::UnknownCoder("<unnamed>".into()))?;
                coders.get(name)?.encode(v)
            }
            (_, v) => Err(SchemaError::IncompatibleValue {
                expected: "normalized value",
                got: v.type_name().to_string(),
            }),
        }
    }

    /// Encode for a schema default: paths as bare strings, secrets masked.
    /// Deliberately distinct from the response encoding.
    fn encode_schema_default(self, value: &Value) -> Result<serde_json::Value> {
        match (self, value) {
            (Self::Path, Value::Path(p)) => Ok(json!(p.display().to_string())),
            (Self::Secret, Value::Secret(_)) => Ok(json!(SECRET_MASK)),
            (Self::Float, Value::Int(i)) => Ok(json!(*i as f64)),
            (Self::Bool, Value::Bool(b)) => Ok(json!(b)),
            (Self::Integer, Value::Int(i)) => Ok(json!(i)),
            (Self::Float, Value::Float(f)) => Ok(json!(f)),
            (Self::String, Value::Str(s)) => Ok(json!(s)),
            (Self::Custom, Value::Json(v)) => Ok(v.clone()),
            (_, v) => Err(SchemaError::IncompatibleValue {
                expected: "normalized default",
                got: v.type_name().to_string(),
            }),
        }
    }
}

// ---------------------------------------------------------------------------
// Repetition / cardinality
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Repetition {
    /// Bare type.
    Required,
    /// May be absent; takes the value null.
    Optional,
    /// Ordered list of elements.
    Repeated,
}

// ---------------------------------------------------------------------------
// Declared types  (annotation analog, pre-resolution)
// ---------------------------------------------------------------------------

/// What a predictor declares for one field, before resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declared {
    Bool,
    Float,
    Integer,
    String,
    Path,
    Secret,
    /// Named custom type; a coder with this name must be registered.
    Custom(&'static str),
    Optional(Box<Declared>),
    List(Box<Declared>),
}

impl Declared {
    pub fn optional(inner: Declared) -> Self {
        Declared::Optional(Box::new(inner))
    }

    pub fn list(inner: Declared) -> Self {
        Declared::List(Box::new(inner))
    }

    fn leaf(&self) -> Result<(PrimitiveType, Option<String>)> {
        match self {
            Declared::Bool => Ok((PrimitiveType::Bool, None)),
            Declared::Float => Ok((PrimitiveType::Float, None)),
            Declared::Integer => Ok((PrimitiveType::Integer, None)),
            Declared::String => Ok((PrimitiveType::String, None)),
            Declared::Path => Ok((PrimitiveType::Path, None)),
            Declared::Secret => Ok((PrimitiveType::Secret, None)),
            Declared::Custom(name) => Ok((PrimitiveType::Custom, Some(name.to_string()))),
            Declared::Optional(_) | Declared::List(_) => Err(SchemaError::UnsupportedType(
                "nested optional/list types are not supported in a single field".into(),
            )),
        }
    }

    /// Resolve into a `FieldType`, rejecting nested lists and
    /// optional-wrapped lists.
    pub fn resolve(&self) -> Result<FieldType> {
        match self {
            Declared::Optional(inner) => {
                let (primitive, coder) = inner.leaf()?;
                Ok(FieldType { primitive, repetition: Repetition::Optional, coder })
            }
            Declared::List(inner) => {
                let (primitive, coder) = inner.leaf()?;
                Ok(FieldType { primitive, repetition: Repetition::Repeated, coder })
            }
            other => {
                let (primitive, coder) = other.leaf()?;
                Ok(FieldType { primitive, repetition: Repetition::Required, coder })
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Field type  (primitive + repetition + coder)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldType {
    pub primitive: PrimitiveType,
    pub repetition: Repetition,
    /// Coder name for `PrimitiveType::Custom` fields.
    pub coder: Option<String>,
}

impl FieldType {
    pub fn required(primitive: PrimitiveType) -> Self {
        Self { primitive, repetition: Repetition::Required, coder: None }
    }

    pub fn json_type(&self) -> serde_json::Value {
        match self.repetition {
            Repetition::Repeated => json!({
                "type": "array",
                "items": self.primitive.json_type()
            }),
            _ => self.primitive.json_type(),
        }
    }

    /// Coerce a value into canonical form for this field.
    pub fn normalize(&self, value: Value) -> Result<Value> {
        match self.repetition {
            Repetition::Required => self.primitive.normalize(value),
            Repetition::Optional => match value {
                Value::Null => Ok(Value::Null),
                v => self.primitive.normalize(v),
            },
            Repetition::Repeated => match value {
                Value::List(items) => Ok(Value::List(
                    items
                        .into_iter()
                        .map(|v| self.primitive.normalize(v))
                        .collect::<Result<Vec<_>>>()?,
                )),
                v => Err(SchemaError::IncompatibleValue {
                    expected: "list",
                    got: v.type_name().to_string(),
                }),
            },
        }
    }

    /// Decode an incoming wire value into the in-worker representation.
    pub fn json_decode(&self, raw: &serde_json::Value, coders: &CoderRegistry) -> Result<Value> {
        let coder = self.coder.as_deref();
        match self.repetition {
            Repetition::Required => self.primitive.decode(raw, coder, coders),
            Repetition::Optional => match raw {
                serde_json::Value::Null => Ok(Value::Null),
                v => self.primitive.decode(v, coder, coders),
            },
            Repetition::Repeated => match raw {
                serde_json::Value::Array(items) => Ok(Value::List(
                    items
                        .iter()
                        .map(|v| self.primitive.decode(v, coder, coders))
                        .collect::<Result<Vec<_>>>()?,
                )),
                v => Err(SchemaError::IncompatibleValue {
                    expected: "array",
                    got: v.to_string(),
                }),
            },
        }
    }

    /// Encode an in-worker value for an outgoing response.
    pub fn json_encode(&self, value: &Value, coders: &CoderRegistry) -> Result<serde_json::Value> {
        let coder = self.coder.as_deref();
        match self.repetition {
            Repetition::Required => self.primitive.encode_response(value, coder, coders),
            Repetition::Optional => match value {
                Value::Null => Ok(serde_json::Value::Null),
                v => self.primitive.encode_response(v, coder, coders),
            },
            Repetition::Repeated => match value {
                Value::List(items) => Ok(serde_json::Value::Array(
                    items
                        .iter()
                        .map(|v| self.primitive.encode_response(v, coder, coders))
                        .collect::<Result<Vec<_>>>()?,
                )),
                v => Err(SchemaError::IncompatibleValue {
                    expected: "list",
                    got: v.type_name().to_string(),
                }),
            },
        }
    }

    /// Encode a declared default for the schema document.
    pub fn encode_schema_default(&self, value: &Value) -> Result<serde_json::Value> {
        match self.repetition {
            Repetition::Repeated => match value {
                Value::List(items) => Ok(serde_json::Value::Array(
                    items
                        .iter()
                        .map(|v| self.primitive.encode_schema_default(v))
                        .collect::<Result<Vec<_>>>()?,
                )),
                v => Err(SchemaError::IncompatibleValue {
                    expected: "list",
                    got: v.type_name().to_string(),
                }),
            },
            _ => self.primitive.encode_schema_default(value),
        }
    }
}

// ---------------------------------------------------------------------------
// Input declaration  (the `Input(...)` sentinel analog)
// ---------------------------------------------------------------------------

/// Options attached to one declared input.
#[derive(Debug, Clone, Default)]
pub struct InputOpts {
    pub default: Option<serde_json::Value>,
    pub description: Option<String>,
    pub ge: Option<f64>,
    pub le: Option<f64>,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub regex: Option<String>,
    pub choices: Option<Vec<serde_json::Value>>,
    pub deprecated: Option<bool>,
}

impl InputOpts {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn default_value(mut self, v: serde_json::Value) -> Self {
        self.default = Some(v);
        self
    }

    pub fn description(mut self, d: impl Into<String>) -> Self {
        self.description = Some(d.into());
        self
    }

    pub fn ge(mut self, v: f64) -> Self {
        self.ge = Some(v);
        self
    }

    pub fn le(mut self, v: f64) -> Self {
        self.le = Some(v);
        self
    }

    pub fn min_length(mut self, v: u64) -> Self {
        self.min_length = Some(v);
        self
    }

    pub fn max_length(mut self, v: u64) -> Self {
        self.max_length = Some(v);
        self
    }

    pub fn regex(mut self, pattern: impl Into<String>) -> Self {
        self.regex = Some(pattern.into());
        self
    }

    pub fn choices(mut self, choices: Vec<serde_json::Value>) -> Self {
        self.choices = Some(choices);
        self
    }

    pub fn deprecated(mut self) -> Self {
        self.deprecated = Some(true);
        self
    }
}

/// One declared predict parameter.
#[derive(Debug, Clone)]
pub struct InputDecl {
    pub name: String,
    pub declared: Declared,
    pub opts: InputOpts,
}

impl InputDecl {
    pub fn new(name: impl Into<String>, declared: Declared) -> Self {
        Self { name: name.into(), declared, opts: InputOpts::default() }
    }

    pub fn with_opts(name: impl Into<String>, declared: Declared, opts: InputOpts) -> Self {
        Self { name: name.into(), declared, opts }
    }
}

/// Declared output shape.
#[derive(Debug, Clone)]
pub enum OutputDecl {
    /// Scalar or list return, per the declared type.
    Value(Declared),
    /// Streamed elements of the declared type.
    Iterator(Declared),
    /// Streamed string chunks the host concatenates.
    ConcatIterator,
    /// Named fields, each a non-list type.
    Object(Vec<(String, Declared)>),
}

/// Everything a predictor declares about itself.
#[derive(Clone, Default)]
pub struct Signature {
    pub inputs: Vec<InputDecl>,
    pub output: Option<OutputDecl>,
    /// True when predict is driven as a future/stream rather than inline.
    pub is_async: bool,
    /// True when setup accepts a weights argument.
    pub takes_weights: bool,
    /// Canned inputs for smoke-testing the predictor.
    pub test_inputs: Option<serde_json::Map<String, serde_json::Value>>,
    pub coders: CoderRegistry,
}

impl Signature {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn input(mut self, name: impl Into<String>, declared: Declared) -> Self {
        self.inputs.push(InputDecl::new(name, declared));
        self
    }

    pub fn input_with(
        mut self,
        name: impl Into<String>,
        declared: Declared,
        opts: InputOpts,
    ) -> Self {
        self.inputs.push(InputDecl::with_opts(name, declared, opts));
        self
    }

    pub fn output(mut self, output: OutputDecl) -> Self {
        self.output = Some(output);
        self
    }

    pub fn asynchronous(mut self) -> Self {
        self.is_async = true;
        self
    }

    pub fn weights(mut self) -> Self {
        self.takes_weights = true;
        self
    }

    pub fn test_inputs(mut self, inputs: serde_json::Map<String, serde_json::Value>) -> Self {
        self.test_inputs = Some(inputs);
        self
    }
}

// ---------------------------------------------------------------------------
// Validated input field
// ---------------------------------------------------------------------------

/// One validated predict parameter of the immutable descriptor.
#[derive(Debug, Clone)]
pub struct InputField {
    pub name: String,
    /// Declaration order; the canonical sort key exposed to clients.
    pub order: usize,
    pub field_type: FieldType,
    pub default: Option<Value>,
    pub description: Option<String>,
    pub ge: Option<f64>,
    pub le: Option<f64>,
    pub min_length: Option<u64>,
    pub max_length: Option<u64>,
    pub regex: Option<String>,
    pub choices: Option<Vec<Value>>,
    pub deprecated: Option<bool>,
}

impl InputField {
    /// Required in the schema: no default and not optional.
    pub fn is_required(&self) -> bool {
        self.default.is_none()
            && matches!(
                self.field_type.repetition,
                Repetition::Required | Repetition::Repeated
            )
    }

    /// Check a normalized value against the declared constraints.
    ///
    /// Repeated fields are checked per element.
    pub fn check(&self, value: &Value) -> Result<()> {
        let elements: Vec<&Value> = match value {
            Value::List(items) => items.iter().collect(),
            v => vec![v],
        };

        let fail = |reason: String| SchemaError::InvalidConstraint {
            input: self.name.clone(),
            reason,
        };

        for v in elements {
            if let Value::Null = v {
                continue;
            }
            let num = match v {
                Value::Int(i) => Some(*i as f64),
                Value::Float(f) => Some(*f),
                _ => None,
            };
            if let (Some(ge), Some(n)) = (self.ge, num)
                && n < ge
            {
                return Err(fail(format!("{n} is less than the minimum of {ge}")));
            }
            if let (Some(le), Some(n)) = (self.le, num)
                && n > le
            {
                return Err(fail(format!("{n} is greater than the maximum of {le}")));
            }
            if let Value::Str(s) = v {
                let len = s.chars().count() as u64;
                if let Some(min) = self.min_length
                    && len < min
                {
                    return Err(fail(format!("length {len} is less than minLength {min}")));
                }
                if let Some(max) = self.max_length
                    && len > max
                {
                    return Err(fail(format!("length {len} is greater than maxLength {max}")));
                }
                if let Some(ref pattern) = self.regex {
                    let re = regex::Regex::new(pattern).map_err(|e| SchemaError::InvalidRegex {
                        input: self.name.clone(),
                        reason: e.to_string(),
                    })?;
                    if !re.is_match(s) {
                        return Err(fail(format!("{s:?} does not match pattern {pattern:?}")));
                    }
                }
            }
            if let Some(ref choices) = self.choices
                && !choices.contains(v)
            {
                return Err(fail(format!("{v:?} is not one of the allowed choices")));
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Output shape
// ---------------------------------------------------------------------------

/// Validated output shape. Element types carry `Required` repetition.
#[derive(Debug, Clone)]
pub enum OutputShape {
    Single(FieldType),
    List(FieldType),
    Iterator(FieldType),
    /// String chunks the host concatenates into one streamed string.
    ConcatIterator,
    Object(IndexMap<String, FieldType>),
}

impl OutputShape {
    pub fn is_iter(&self) -> bool {
        matches!(self, Self::Iterator(_) | Self::ConcatIterator)
    }

    fn element(&self) -> FieldType {
        match self {
            Self::Single(ft) | Self::List(ft) | Self::Iterator(ft) => ft.clone(),
            Self::ConcatIterator => FieldType::required(PrimitiveType::String),
            Self::Object(_) => FieldType::required(PrimitiveType::Custom),
        }
    }

    /// Normalize a returned value. For iterator shapes the value is one
    /// yielded element.
    pub fn normalize(&self, value: Value) -> Result<Value> {
        match self {
            Self::Single(ft) | Self::Iterator(ft) => ft.normalize(value),
            Self::ConcatIterator => PrimitiveType::String.normalize(value),
            Self::List(ft) => match value {
                Value::List(items) => Ok(Value::List(
                    items
                        .into_iter()
                        .map(|v| ft.normalize(v))
                        .collect::<Result<Vec<_>>>()?,
                )),
                v => Err(SchemaError::IncompatibleValue {
                    expected: "list",
                    got: v.type_name().to_string(),
                }),
            },
            Self::Object(fields) => match value {
                Value::Object(map) => {
                    let mut normalized = IndexMap::new();
                    for (name, ft) in fields {
                        let v = map
                            .get(name)
                            .cloned()
                            .ok_or_else(|| SchemaError::MissingOutputField(name.clone()))?;
                        if v.is_null() && ft.repetition != Repetition::Optional {
                            return Err(SchemaError::MissingOutputField(name.clone()));
                        }
                        normalized.insert(name.clone(), ft.normalize(v)?);
                    }
                    Ok(Value::Object(normalized))
                }
                v => Err(SchemaError::IncompatibleValue {
                    expected: "object",
                    got: v.type_name().to_string(),
                }),
            },
        }
    }

    /// Encode a normalized value for a response. For iterator shapes the
    /// value is one yielded element.
    pub fn json_encode(&self, value: &Value, coders: &CoderRegistry) -> Result<serde_json::Value> {
        match self {
            Self::Single(_) | Self::Iterator(_) | Self::ConcatIterator => {
                self.element().json_encode(value, coders)
            }
            Self::List(ft) => match value {
                Value::List(items) => Ok(serde_json::Value::Array(
                    items
                        .iter()
                        .map(|v| ft.json_encode(v, coders))
                        .collect::<Result<Vec<_>>>()?,
                )),
                v => Err(SchemaError::IncompatibleValue {
                    expected: "list",
                    got: v.type_name().to_string(),
                }),
            },
            Self::Object(fields) => match value {
                Value::Object(map) => {
                    let mut obj = serde_json::Map::new();
                    for (name, ft) in fields {
                        let v = map
                            .get(name)
                            .ok_or_else(|| SchemaError::MissingOutputField(name.clone()))?;
                        obj.insert(name.clone(), ft.json_encode(v, coders)?);
                    }
                    Ok(serde_json::Value::Object(obj))
                }
                v => Err(SchemaError::IncompatibleValue {
                    expected: "object",
                    got: v.type_name().to_string(),
                }),
            },
        }
    }
}

// ---------------------------------------------------------------------------
// Predictor descriptor  (built once at startup, immutable)
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct PredictorSpec {
    pub module_name: String,
    pub predictor_name: String,
    pub inputs: IndexMap<String, InputField>,
    pub output: OutputShape,
    pub is_async: bool,
    pub is_iter: bool,
    pub max_concurrency: usize,
    pub coders: CoderRegistry,
}

impl PredictorSpec {
    pub fn full_name(&self) -> String {
        format!("{}.{}", self.module_name, self.predictor_name)
    }
}
