use thiserror::Error;

#[derive(Debug, Error)]
pub enum SchemaError {
    #[error("unsupported type: {0}")]
    UnsupportedType(String),

    #[error("incompatible value for {expected}: {got}")]
    IncompatibleValue { expected: &'static str, got: String },

    #[error("unknown coder: {0}")]
    UnknownCoder(String),

    #[error("coder '{coder}' failed: {reason}")]
    CoderFailed { coder: String, reason: String },

    #[error("invalid constraint on input '{input}': {reason}")]
    InvalidConstraint { input: String, reason: String },

    #[error("default conflict for input '{input}': {reason}")]
    DefaultConflict { input: String, reason: String },

    #[error("invalid regex for input '{input}': {reason}")]
    InvalidRegex { input: String, reason: String },

    #[error("output field must not be a list: {0}")]
    OutputListField(String),

    #[error("output must not be optional")]
    OptionalOutput,

    #[error("concatenating iterators must have string elements, got {0}")]
    ConcatIteratorNotStr(String),

    #[error("missing output field: {0}")]
    MissingOutputField(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, SchemaError>;
