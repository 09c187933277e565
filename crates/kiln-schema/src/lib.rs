//! Type system, signature model and OpenAPI generation for kiln predictors.
//!
//! This crate is the pure data layer of the kiln worker runtime: primitive
//! and field type descriptors, the runtime value representation with its
//! coercion rules and JSON encoders, the declarative predictor signature,
//! and the OpenAPI document emitter. It performs no I/O and knows nothing
//! about the event loop.

pub mod error;
pub mod lint;
pub mod schema;
pub mod types;
pub mod value;

pub use error::SchemaError;
pub use lint::{LintError, lint_signature};
pub use schema::generate_openapi_schema;
pub use types::{
    Declared, FieldType, InputDecl, InputField, InputOpts, OutputDecl, OutputShape,
    PredictorSpec, PrimitiveType, Repetition, Signature,
};
pub use value::{Coder, CoderRegistry, Secret, Value};
