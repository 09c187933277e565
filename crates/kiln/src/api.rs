//! Predictor API: the capability set a hosted model implements.
//!
//! A predictor is anything exposing a declarative [`Signature`], a `setup`
//! phase, and a `predict` entry point returning one of four shapes: a
//! value, a future, an iterator, or a stream. The runtime never cares how
//! the model was written, only which shape it hands back.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::stream::BoxStream;
use indexmap::IndexMap;

use kiln_schema::{Secret, Signature, Value};

/// Weights handed to `setup`, resolved by the invoker.
#[derive(Debug, Clone)]
pub enum Weights {
    /// From the `COG_WEIGHTS` environment URL, passed through as a string.
    Url(String),
    /// A local `weights` file next to the worker.
    File(PathBuf),
}

/// Validated, defaulted inputs for one predict call.
#[derive(Debug, Clone, Default)]
pub struct Inputs(IndexMap<String, Value>);

impl Inputs {
    pub fn new(values: IndexMap<String, Value>) -> Self {
        Self(values)
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.0.get(name)
    }

    /// The value unless it is absent or null.
    pub fn optional(&self, name: &str) -> Option<&Value> {
        match self.0.get(name) {
            Some(Value::Null) | None => None,
            Some(v) => Some(v),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.0.iter()
    }

    fn want<'a, T>(
        &'a self,
        name: &str,
        pick: impl FnOnce(&'a Value) -> Option<T>,
        expected: &str,
    ) -> Result<T, PredictionError> {
        self.0
            .get(name)
            .and_then(pick)
            .ok_or_else(|| PredictionError::Failed(format!("input '{name}' is not a {expected}")))
    }

    pub fn get_bool(&self, name: &str) -> Result<bool, PredictionError> {
        self.want(name, |v| if let Value::Bool(b) = v { Some(*b) } else { None }, "bool")
    }

    pub fn get_int(&self, name: &str) -> Result<i64, PredictionError> {
        self.want(name, |v| if let Value::Int(i) = v { Some(*i) } else { None }, "integer")
    }

    pub fn get_float(&self, name: &str) -> Result<f64, PredictionError> {
        self.want(
            name,
            |v| match v {
                Value::Float(f) => Some(*f),
                Value::Int(i) => Some(*i as f64),
                _ => None,
            },
            "float",
        )
    }

    pub fn get_str(&self, name: &str) -> Result<&str, PredictionError> {
        self.want(name, |v| if let Value::Str(s) = v { Some(s.as_str()) } else { None }, "string")
    }

    pub fn get_path(&self, name: &str) -> Result<&Path, PredictionError> {
        self.want(name, |v| if let Value::Path(p) = v { Some(p.as_path()) } else { None }, "path")
    }

    pub fn get_secret(&self, name: &str) -> Result<&Secret, PredictionError> {
        self.want(name, |v| if let Value::Secret(s) = v { Some(s) } else { None }, "secret")
    }

    pub fn get_list(&self, name: &str) -> Result<&[Value], PredictionError> {
        self.want(name, |v| if let Value::List(l) = v { Some(l.as_slice()) } else { None }, "list")
    }
}

/// The four predict shapes, tagged. Scalar shapes produce exactly one
/// value; iterator shapes stream them.
pub enum PredictOutput {
    /// Computed inline on the calling task.
    Value(Value),
    /// Awaited by the runtime; cancelable at any await point.
    Future(BoxFuture<'static, Result<Value, PredictionError>>),
    /// Driven to completion one element per poll.
    Iter(Box<dyn Iterator<Item = Result<Value, PredictionError>> + Send>),
    /// Async element stream; cancelable between elements.
    Stream(BoxStream<'static, Result<Value, PredictionError>>),
}

impl PredictOutput {
    pub fn value(v: impl Into<Value>) -> Self {
        Self::Value(v.into())
    }

    pub fn future(
        f: impl std::future::Future<Output = Result<Value, PredictionError>> + Send + 'static,
    ) -> Self {
        Self::Future(Box::pin(f))
    }

    pub fn iter(
        it: impl Iterator<Item = Result<Value, PredictionError>> + Send + 'static,
    ) -> Self {
        Self::Iter(Box::new(it))
    }

    pub fn stream(
        s: impl futures::Stream<Item = Result<Value, PredictionError>> + Send + 'static,
    ) -> Self {
        Self::Stream(Box::pin(s))
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PredictionError {
    #[error("Prediction failed: {0}")]
    Failed(String),

    #[error("Input validation error: {0}")]
    InvalidInput(String),

    #[error("Prediction was canceled")]
    Canceled,
}

/// Setup phase errors. These affect the setup result (and the process exit
/// code) rather than any single prediction.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    /// Failed to resolve or instantiate the predictor.
    #[error("failed to load predictor: {message}")]
    Load { message: String },

    /// The predictor's setup itself failed.
    #[error("setup failed: {message}")]
    Setup { message: String },

    /// Internal error (schema emission, I/O).
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl SetupError {
    pub fn load(message: impl Into<String>) -> Self {
        Self::Load { message: message.into() }
    }

    pub fn setup(message: impl Into<String>) -> Self {
        Self::Setup { message: message.into() }
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal { message: message.into() }
    }
}

/// A hosted model.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// Declared inputs, output shape and predict style.
    fn signature(&self) -> Signature;

    /// One-time initialization. The default is the trivial setup of a
    /// free-function predictor.
    async fn setup(&mut self, weights: Option<Weights>) -> Result<(), SetupError> {
        let _ = weights;
        Ok(())
    }

    fn predict(&self, inputs: Inputs) -> Result<PredictOutput, PredictionError>;
}

/// A free predict function with a trivial setup.
pub struct FnPredictor<F> {
    signature: Signature,
    f: F,
}

impl<F> FnPredictor<F>
where
    F: Fn(Inputs) -> Result<PredictOutput, PredictionError> + Send + Sync,
{
    pub fn new(signature: Signature, f: F) -> Self {
        Self { signature, f }
    }
}

#[async_trait]
impl<F> Predictor for FnPredictor<F>
where
    F: Fn(Inputs) -> Result<PredictOutput, PredictionError> + Send + Sync,
{
    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    fn predict(&self, inputs: Inputs) -> Result<PredictOutput, PredictionError> {
        (self.f)(inputs)
    }
}

type Factory = Box<dyn Fn() -> Box<dyn Predictor> + Send + Sync>;

/// Maps `(module_name, predictor_name)` from the config handover to a
/// predictor factory. The in-process analog of loading user code by name.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<(String, String), Factory>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&mut self, module_name: &str, predictor_name: &str, factory: F)
    where
        F: Fn() -> Box<dyn Predictor> + Send + Sync + 'static,
    {
        self.factories.insert(
            (module_name.to_string(), predictor_name.to_string()),
            Box::new(factory),
        );
    }

    pub fn create(
        &self,
        module_name: &str,
        predictor_name: &str,
    ) -> Option<Box<dyn Predictor>> {
        self.factories
            .get(&(module_name.to_string(), predictor_name.to_string()))
            .map(|f| f())
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}
