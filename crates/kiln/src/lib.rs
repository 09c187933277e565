//! kiln: prediction worker runtime.
//!
//! A kiln worker hosts one registered predictor and executes prediction
//! requests dispatched by a supervising server through a shared working
//! directory: requests and cancel markers in, atomically-renamed response
//! files out, with READY/BUSY/OUTPUT transitions posted to an IPC URL.
//!
//! Embedders register their predictors in a [`Registry`] and hand it to
//! [`bootstrap::run`]; the stock `kiln` binary is the same shell with an
//! empty registry.

pub mod api;
pub mod bootstrap;
pub mod file_runner;
pub mod inspector;
pub mod ipc;
pub mod logs;
mod prediction;
pub mod runner;
pub mod scope;

pub use api::{
    FnPredictor, Inputs, PredictOutput, PredictionError, Predictor, Registry, SetupError, Weights,
};
pub use bootstrap::{ConfigError, WorkerOpts, await_config};
pub use file_runner::{Config, FatalError, FileRunner};
pub use inspector::{InspectError, create_predictor};
pub use ipc::{IpcClient, IpcStatus};
pub use prediction::{PredictionRequest, PredictionResponse, PredictionStatus};
pub use runner::Runner;
pub use scope::{Scope, ScopeError, current_scope};
