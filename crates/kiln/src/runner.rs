//! The invoker: validated, uniform execution of a predictor.
//!
//! All four predict shapes are driven through one internal stream of
//! normalized values; scalar shapes yield exactly once. Input validation
//! and defaulting happen here, so by the time user code runs every input
//! is canonical.

use std::path::Path;

use futures::stream::{self, BoxStream, StreamExt};
use indexmap::IndexMap;

use kiln_schema::{PredictorSpec, Repetition, Value};

use crate::api::{Inputs, PredictOutput, PredictionError, Predictor, SetupError, Weights};

pub struct Runner {
    spec: PredictorSpec,
    predictor: Box<dyn Predictor>,
    takes_weights: bool,
    test_inputs: Option<serde_json::Map<String, serde_json::Value>>,
}

impl Runner {
    pub fn new(spec: PredictorSpec, predictor: Box<dyn Predictor>) -> Self {
        let signature = predictor.signature();
        Self {
            spec,
            predictor,
            takes_weights: signature.takes_weights,
            test_inputs: signature.test_inputs,
        }
    }

    pub fn spec(&self) -> &PredictorSpec {
        &self.spec
    }

    pub fn is_iter(&self) -> bool {
        self.spec.is_iter
    }

    pub fn is_async(&self) -> bool {
        self.spec.is_async
    }

    /// Run the predictor's setup, binding weights by preference:
    /// `COG_WEIGHTS` URL, a local `weights` file, or none.
    pub async fn setup(&mut self) -> Result<(), SetupError> {
        let weights = if self.takes_weights {
            let url = std::env::var("COG_WEIGHTS").ok().filter(|s| !s.is_empty());
            resolve_weights(url, Path::new("weights"))
        } else {
            None
        };
        self.predictor.setup(weights).await
    }

    /// Validate decoded inputs: unknown keys fail, required fields are
    /// filled from defaults or rejected, constraints are enforced.
    pub fn check_inputs(
        &self,
        raw: IndexMap<String, Value>,
    ) -> Result<Inputs, PredictionError> {
        let mut kwargs: IndexMap<String, Value> = IndexMap::new();
        for (name, value) in raw {
            let field = self
                .spec
                .inputs
                .get(&name)
                .ok_or_else(|| PredictionError::InvalidInput(format!("unknown input: {name}")))?;
            let normalized = field
                .field_type
                .normalize(value)
                .map_err(|e| PredictionError::InvalidInput(format!("{name}: {e}")))?;
            kwargs.insert(name, normalized);
        }

        for (name, field) in &self.spec.inputs {
            if !kwargs.contains_key(name) {
                let value = match field.default {
                    Some(ref d) => d.clone(),
                    None if field.field_type.repetition == Repetition::Optional => Value::Null,
                    None => {
                        return Err(PredictionError::InvalidInput(format!(
                            "missing required input: {name}"
                        )));
                    }
                };
                kwargs.insert(name.clone(), value);
            }
            field
                .check(&kwargs[name])
                .map_err(|e| PredictionError::InvalidInput(e.to_string()))?;
        }

        Ok(Inputs::new(kwargs))
    }

    /// The single internal driver: whatever shape the predictor returns
    /// becomes a stream of normalized values.
    fn drive(
        &self,
        inputs: Inputs,
    ) -> Result<BoxStream<'static, Result<Value, PredictionError>>, PredictionError> {
        let raw: BoxStream<'static, Result<Value, PredictionError>> =
            match self.predictor.predict(inputs)? {
                PredictOutput::Value(v) => stream::once(async move { Ok(v) }).boxed(),
                PredictOutput::Future(f) => stream::once(f).boxed(),
                PredictOutput::Iter(it) => stream::iter(it).boxed(),
                PredictOutput::Stream(s) => s,
            };

        let shape = self.spec.output.clone();
        Ok(raw
            .map(move |item| {
                item.and_then(|v| {
                    shape
                        .normalize(v)
                        .map_err(|e| PredictionError::Failed(e.to_string()))
                })
            })
            .boxed())
    }

    /// Run a scalar prediction to completion.
    pub async fn predict(
        &self,
        raw: IndexMap<String, Value>,
    ) -> Result<Value, PredictionError> {
        if self.is_iter() {
            return Err(PredictionError::Failed(
                "predict returns an iterator, call predict_iter instead".into(),
            ));
        }
        let mut stream = self.drive(self.check_inputs(raw)?)?;
        match stream.next().await {
            Some(result) => result,
            None => Err(PredictionError::Failed("predictor produced no output".into())),
        }
    }

    /// Stream an iterator prediction, normalizing each yield lazily.
    pub fn predict_iter(
        &self,
        raw: IndexMap<String, Value>,
    ) -> Result<BoxStream<'static, Result<Value, PredictionError>>, PredictionError> {
        if !self.is_iter() {
            return Err(PredictionError::Failed(
                "predict does not return an iterator, call predict instead".into(),
            ));
        }
        self.drive(self.check_inputs(raw)?)
    }

    /// Validate the predictor's canned test inputs through the normal
    /// input-checking path.
    pub fn check_test_inputs(&self) -> Result<Inputs, PredictionError> {
        let mut decoded = IndexMap::new();
        if let Some(ref raw) = self.test_inputs {
            for (name, value) in raw {
                let field = self.spec.inputs.get(name).ok_or_else(|| {
                    PredictionError::InvalidInput(format!("invalid test_inputs: unknown input: {name}"))
                })?;
                let v = field
                    .field_type
                    .json_decode(value, &self.spec.coders)
                    .map_err(|e| {
                        PredictionError::InvalidInput(format!("invalid test_inputs: {name}: {e}"))
                    })?;
                decoded.insert(name.clone(), v);
            }
        }
        self.check_inputs(decoded)
    }
}

fn resolve_weights(url: Option<String>, local: &Path) -> Option<Weights> {
    if let Some(url) = url {
        Some(Weights::Url(url))
    } else if local.exists() {
        Some(Weights::File(local.to_path_buf()))
    } else {
        None
    }
}
