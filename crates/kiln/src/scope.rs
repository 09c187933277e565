//! Per-prediction ambient state.
//!
//! Every admitted prediction gets a scope entry keyed by its pid: the
//! metrics sink, the host-provided request context, and the cancellation
//! token. The current pid travels in a task-local, so `current_scope()`
//! works from anywhere inside the prediction task, sync or async.

use std::collections::HashMap;
use std::sync::{Mutex, OnceLock};

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

use crate::api::PredictionError;
use crate::logs;

tokio::task_local! {
    static CURRENT_PID: String;
}

/// Context keys the host is allowed to hand through to user code.
pub const CONTEXT_KEYS: [&str; 2] = ["procedure_source_url", "replicate_api_token"];

struct ScopeEntry {
    metrics: Mutex<serde_json::Map<String, serde_json::Value>>,
    context: HashMap<String, String>,
    cancel: CancellationToken,
}

static SCOPES: OnceLock<DashMap<String, ScopeEntry>> = OnceLock::new();

fn scopes() -> &'static DashMap<String, ScopeEntry> {
    SCOPES.get_or_init(DashMap::new)
}

/// Register a scope for a newly-admitted prediction.
pub fn install(pid: &str, context: HashMap<String, String>, cancel: CancellationToken) {
    scopes().insert(
        pid.to_string(),
        ScopeEntry { metrics: Mutex::new(serde_json::Map::new()), context, cancel },
    );
}

/// Tear down a prediction's scope after its final response.
pub fn teardown(pid: &str) {
    scopes().remove(pid);
    logs::drop_buffer(pid);
}

/// Fire the cancellation token for a pid. Returns false for unknown pids.
pub fn cancel(pid: &str) -> bool {
    match scopes().get(pid) {
        Some(entry) => {
            entry.cancel.cancel();
            true
        }
        None => false,
    }
}

/// Fire every active cancellation token (stop file, SIGUSR1).
pub fn cancel_all() {
    for entry in scopes().iter() {
        entry.cancel.cancel();
    }
}

pub fn cancel_token(pid: &str) -> Option<CancellationToken> {
    scopes().get(pid).map(|e| e.cancel.clone())
}

/// Snapshot of the metrics recorded so far for a pid.
pub fn metrics_snapshot(pid: &str) -> Option<serde_json::Map<String, serde_json::Value>> {
    scopes()
        .get(pid)
        .map(|e| e.metrics.lock().expect("metrics mutex poisoned").clone())
}

/// Run a future with the task-local pid set.
pub async fn enter<F: std::future::Future>(pid: String, fut: F) -> F::Output {
    CURRENT_PID.scope(pid, fut).await
}

/// The pid of the prediction the current task belongs to, if any.
pub fn current_pid() -> Option<String> {
    CURRENT_PID.try_with(|p| p.clone()).ok()
}

#[derive(Debug, thiserror::Error)]
#[error("current_scope() called outside a prediction")]
pub struct ScopeError;

/// Handle to the current prediction's ambient state.
#[derive(Debug, Clone)]
pub struct Scope {
    pid: String,
}

/// The scope of the prediction the calling task belongs to.
pub fn current_scope() -> Result<Scope, ScopeError> {
    current_pid().map(|pid| Scope { pid }).ok_or(ScopeError)
}

impl Scope {
    pub fn pid(&self) -> &str {
        &self.pid
    }

    /// Record a metric for this prediction; attached to every response
    /// emitted from now on.
    pub fn record_metric(&self, name: &str, value: impl Into<serde_json::Value>) {
        match scopes().get(&self.pid) {
            Some(entry) => {
                entry
                    .metrics
                    .lock()
                    .expect("metrics mutex poisoned")
                    .insert(name.to_string(), value.into());
            }
            None => {
                tracing::warn!(pid = %self.pid, metric = name, "metric recorded after teardown");
            }
        }
    }

    /// The host-provided request context.
    pub fn context(&self) -> HashMap<String, String> {
        scopes()
            .get(&self.pid)
            .map(|e| e.context.clone())
            .unwrap_or_default()
    }

    /// Cooperative cancellation point for blocking predictors.
    pub fn checkpoint(&self) -> Result<(), PredictionError> {
        match scopes().get(&self.pid) {
            Some(entry) if entry.cancel.is_cancelled() => Err(PredictionError::Canceled),
            _ => Ok(()),
        }
    }

    pub fn is_canceled(&self) -> bool {
        scopes()
            .get(&self.pid)
            .map(|e| e.cancel.is_cancelled())
            .unwrap_or(false)
    }
}
