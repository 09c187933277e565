//! The file runner: event loop over the shared working directory.
//!
//! Requests arrive as `request-<pid>.json`, cancellation as `cancel-<pid>`
//! markers, shutdown as a `stop` file. Responses leave as
//! `response-<pid>-<epoch>.json`, written to a temp file and renamed so the
//! host never observes a partial file. Every state transition is announced
//! on the IPC channel.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use futures::StreamExt;
use indexmap::IndexMap;
use regex::Regex;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use kiln_schema::generate_openapi_schema;

use crate::api::{PredictionError, Registry, SetupError};
use crate::inspector::create_predictor;
use crate::ipc::{IpcClient, IpcStatus};
use crate::prediction::{
    PredictionRequest, PredictionResponse, PredictionStatus, now_iso,
};
use crate::runner::Runner;
use crate::scope;

pub const CONFIG_FILE: &str = "config.json";
pub const OPENAPI_FILE: &str = "openapi.json";
pub const SETUP_RESULT_FILE: &str = "setup_result.json";
pub const STOP_FILE: &str = "stop";
pub const ASYNC_PREDICT_FILE: &str = "async_predict";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

static CANCEL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^cancel-(?P<pid>\S+)$").expect("cancel pattern"));
static REQUEST_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^request-(?P<pid>\S+)\.json$").expect("request pattern"));

fn response_name(pid: &str, epoch: u32) -> String {
    format!("response-{pid}-{epoch:05}.json")
}

/// Config handed over by the host before the loop starts.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub module_name: String,
    pub predictor_name: String,
    #[serde(default = "default_concurrency")]
    pub max_concurrency: usize,
}

fn default_concurrency() -> usize {
    1
}

/// Errors that terminate the worker. Per-prediction errors never surface
/// here; they end up in response files instead.
#[derive(Debug, thiserror::Error)]
pub enum FatalError {
    #[error("working directory error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode response: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Per-prediction failure routing: prediction errors become response
/// statuses, fatal errors bubble out of the loop.
enum DriveError {
    Fatal(FatalError),
    Prediction(PredictionError),
}

impl From<FatalError> for DriveError {
    fn from(e: FatalError) -> Self {
        Self::Fatal(e)
    }
}

impl From<PredictionError> for DriveError {
    fn from(e: PredictionError) -> Self {
        Self::Prediction(e)
    }
}

#[cfg(unix)]
struct AbortOnDrop(JoinHandle<()>);

#[cfg(unix)]
impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

pub struct FileRunner {
    working_dir: PathBuf,
    ipc: Arc<IpcClient>,
    registry: Registry,
    config: Config,
}

impl FileRunner {
    pub fn new(
        working_dir: impl Into<PathBuf>,
        ipc: IpcClient,
        registry: Registry,
        config: Config,
    ) -> Self {
        Self {
            working_dir: working_dir.into(),
            ipc: Arc::new(ipc),
            registry,
            config,
        }
    }

    /// Run the worker to completion. Returns the process exit code:
    /// 0 on graceful stop, 1 on setup failure.
    pub async fn start(self) -> Result<i32, FatalError> {
        tracing::info!(
            working_dir = %self.working_dir.display(),
            module = %self.config.module_name,
            predictor = %self.config.predictor_name,
            max_concurrency = self.config.max_concurrency,
            "starting file runner"
        );

        std::fs::create_dir_all(&self.working_dir)?;
        let setup_result_file = self.working_dir.join(SETUP_RESULT_FILE);
        let stop_file = self.working_dir.join(STOP_FILE);
        let openapi_file = self.working_dir.join(OPENAPI_FILE);
        for stale in [&setup_result_file, &stop_file, &openapi_file] {
            if stale.exists() {
                std::fs::remove_file(stale)?;
            }
        }

        tracing::info!("setup started");
        let started_at = now_iso();
        let runner = match self.initialize(&openapi_file).await {
            Ok(runner) => Some(runner),
            Err(e) => {
                tracing::error!(error = %e, "setup failed");
                None
            }
        };
        let status = if runner.is_some() { "succeeded" } else { "failed" };
        let setup_result = serde_json::json!({
            "started_at": started_at,
            "completed_at": now_iso(),
            "status": status,
        });
        // Same rename-into-place discipline as responses; the host may be
        // polling for this file already.
        let tmp = tempfile::NamedTempFile::new_in(&self.working_dir)?;
        serde_json::to_writer(tmp.as_file(), &setup_result)?;
        tmp.persist(&setup_result_file).map_err(|e| FatalError::Io(e.error))?;
        let Some(runner) = runner else {
            return Ok(1);
        };
        tracing::info!("setup completed");

        let runner = Arc::new(runner);

        if runner.is_async() {
            std::fs::File::create(self.working_dir.join(ASYNC_PREDICT_FILE))?;
        }

        // Cancellation transports: async predictors cancel via cancel
        // files, blocking predictors via SIGUSR1 firing their token.
        #[cfg(unix)]
        let _signal_guard = if runner.is_async() {
            None
        } else {
            Some(AbortOnDrop(spawn_sigusr1_listener()?))
        };

        let mut ready = true;
        self.ipc.notify(IpcStatus::Ready).await;

        let mut pending: HashMap<String, JoinHandle<Result<(), FatalError>>> = HashMap::new();

        loop {
            if pending.len() < self.config.max_concurrency && !ready {
                ready = true;
                self.ipc.notify(IpcStatus::Ready).await;
            }

            if stop_file.exists() {
                tracing::info!("stopping file runner");
                for (pid, task) in &pending {
                    if !task.is_finished() {
                        scope::cancel(pid);
                        tracing::info!(pid = %pid, "prediction canceled");
                    }
                }
                for (pid, task) in pending.drain() {
                    match task.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(e) => tracing::error!(pid = %pid, error = %e, "prediction task panicked"),
                    }
                }
                return Ok(0);
            }

            let mut names = Vec::new();
            for entry in std::fs::read_dir(&self.working_dir)? {
                if let Some(name) = entry?.file_name().to_str() {
                    names.push(name.to_string());
                }
            }

            for name in names {
                if let Some(c) = CANCEL_RE.captures(&name) {
                    std::fs::remove_file(self.working_dir.join(&name))?;
                    let pid = &c["pid"];
                    match pending.get(pid) {
                        None => {
                            tracing::warn!(pid = %pid, "failed to cancel non-existing prediction");
                        }
                        Some(task) if task.is_finished() => {
                            tracing::warn!(pid = %pid, "failed to cancel completed prediction");
                        }
                        Some(_) => {
                            scope::cancel(pid);
                            tracing::info!(pid = %pid, "canceling prediction");
                        }
                    }
                    continue;
                }

                let Some(c) = REQUEST_RE.captures(&name) else {
                    continue;
                };
                // At the cap: leave the request on disk for a later tick.
                if pending.len() >= self.config.max_concurrency {
                    continue;
                }
                let pid = c["pid"].to_string();
                if pending.contains_key(&pid) {
                    tracing::warn!(pid = %pid, "request for already-running prediction, deferring");
                    continue;
                }

                if ready {
                    ready = false;
                    self.ipc.notify(IpcStatus::Busy).await;
                }

                let req_path = self.working_dir.join(&name);
                let raw = std::fs::read_to_string(&req_path)?;
                std::fs::remove_file(&req_path)?;

                let request: PredictionRequest = match serde_json::from_str(&raw) {
                    Ok(r) => r,
                    Err(e) => {
                        tracing::error!(pid = %pid, error = %e, "malformed request");
                        let mut resp = PredictionResponse::starting();
                        resp.status = PredictionStatus::Failed;
                        resp.error = Some(format!("malformed request: {e}"));
                        resp.completed_at = Some(now_iso());
                        write_response(&self.working_dir, &pid, 0, &resp)?;
                        self.ipc.notify(IpcStatus::Output).await;
                        continue;
                    }
                };

                let handle = tokio::spawn(run_prediction(
                    self.working_dir.clone(),
                    Arc::clone(&self.ipc),
                    Arc::clone(&runner),
                    pid.clone(),
                    request,
                ));
                pending.insert(pid.clone(), handle);
                tracing::info!(pid = %pid, "prediction started");
            }

            let done: Vec<String> = pending
                .iter()
                .filter(|(_, task)| task.is_finished())
                .map(|(pid, _)| pid.clone())
                .collect();
            for pid in done {
                if let Some(task) = pending.remove(&pid) {
                    match task.await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => return Err(e),
                        Err(e) => tracing::error!(pid = %pid, error = %e, "prediction task panicked"),
                    }
                }
            }

            tokio::time::sleep(POLL_INTERVAL).await;
        }
    }

    /// Build the descriptor, emit the schema, run setup.
    async fn initialize(&self, openapi_file: &Path) -> Result<Runner, SetupError> {
        let (spec, predictor) = create_predictor(
            &self.registry,
            &self.config.module_name,
            &self.config.predictor_name,
            self.config.max_concurrency,
        )
        .map_err(|e| SetupError::load(e.to_string()))?;

        let schema = generate_openapi_schema(&spec);
        let body =
            serde_json::to_string(&schema).map_err(|e| SetupError::internal(e.to_string()))?;
        std::fs::write(openapi_file, body).map_err(|e| SetupError::internal(e.to_string()))?;

        let mut runner = Runner::new(spec, predictor);
        runner.setup().await?;
        Ok(runner)
    }
}

#[cfg(unix)]
fn spawn_sigusr1_listener() -> std::io::Result<JoinHandle<()>> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut sig = signal(SignalKind::user_defined1())?;
    Ok(tokio::spawn(async move {
        while sig.recv().await.is_some() {
            tracing::info!("SIGUSR1 received, canceling in-flight predictions");
            scope::cancel_all();
        }
    }))
}

/// Copy only the context keys user code is allowed to see.
fn filter_context(
    context: Option<&serde_json::Map<String, serde_json::Value>>,
) -> HashMap<String, String> {
    let mut filtered = HashMap::new();
    if let Some(ctx) = context {
        for key in scope::CONTEXT_KEYS {
            if let Some(v) = ctx.get(key).and_then(|v| v.as_str()) {
                filtered.insert(key.to_string(), v.to_string());
            }
        }
    }
    filtered
}

/// One prediction task: install the scope, run to a terminal status, emit
/// the final response, tear the scope down.
async fn run_prediction(
    working_dir: PathBuf,
    ipc: Arc<IpcClient>,
    runner: Arc<Runner>,
    pid: String,
    request: PredictionRequest,
) -> Result<(), FatalError> {
    let token = CancellationToken::new();
    scope::install(&pid, filter_context(request.context.as_ref()), token.clone());

    let result = scope::enter(
        pid.clone(),
        drive_prediction(&working_dir, &ipc, &runner, &pid, request, token),
    )
    .await;

    scope::teardown(&pid);
    result
}

async fn drive_prediction(
    working_dir: &Path,
    ipc: &IpcClient,
    runner: &Runner,
    pid: &str,
    request: PredictionRequest,
    token: CancellationToken,
) -> Result<(), FatalError> {
    let mut resp = PredictionResponse::starting();
    let mut epoch: u32 = 0;
    let has_webhook = request.webhook.is_some();

    // Iterator predictions accumulate into an output array from the start.
    if runner.is_iter() {
        resp.output = Some(serde_json::Value::Array(Vec::new()));
    }

    // With a webhook set, the host wants to see the lifecycle; emit the
    // starting response immediately.
    if has_webhook {
        respond(working_dir, ipc, pid, epoch, &mut resp).await?;
        epoch += 1;
    }

    let outcome: Result<(), DriveError> = async {
        let spec = runner.spec();
        let mut decoded = IndexMap::new();
        for (name, raw) in &request.input {
            let field = spec.inputs.get(name).ok_or_else(|| {
                PredictionError::InvalidInput(format!("unknown input: {name}"))
            })?;
            let value = field
                .field_type
                .json_decode(raw, &spec.coders)
                .map_err(|e| PredictionError::InvalidInput(format!("{name}: {e}")))?;
            decoded.insert(name.clone(), value);
        }

        if runner.is_iter() {
            resp.status = PredictionStatus::Processing;

            let mut stream = runner.predict_iter(decoded)?;
            loop {
                // A blocking iterator is always ready, so the select alone
                // would never observe cancellation between yields.
                if token.is_cancelled() {
                    return Err(PredictionError::Canceled.into());
                }
                let item = tokio::select! {
                    biased;
                    item = stream.next() => item,
                    _ = token.cancelled() => return Err(PredictionError::Canceled.into()),
                };
                let value = match item {
                    None => break,
                    Some(v) => v?,
                };
                let encoded = spec
                    .output
                    .json_encode(&value, &spec.coders)
                    .map_err(|e| PredictionError::Failed(e.to_string()))?;
                // Prove the output serializes before committing it.
                serde_json::to_string(&encoded)
                    .map_err(|e| PredictionError::Failed(e.to_string()))?;
                if let Some(serde_json::Value::Array(outputs)) = resp.output.as_mut() {
                    outputs.push(encoded);
                }
                if has_webhook {
                    respond(working_dir, ipc, pid, epoch, &mut resp).await?;
                    epoch += 1;
                }
            }
        } else {
            let value = tokio::select! {
                biased;
                result = runner.predict(decoded) => result?,
                _ = token.cancelled() => return Err(PredictionError::Canceled.into()),
            };
            let encoded = spec
                .output
                .json_encode(&value, &spec.coders)
                .map_err(|e| PredictionError::Failed(e.to_string()))?;
            serde_json::to_string(&encoded)
                .map_err(|e| PredictionError::Failed(e.to_string()))?;
            resp.output = Some(encoded);
        }
        Ok(())
    }
    .await;

    match outcome {
        Ok(()) => {
            resp.status = PredictionStatus::Succeeded;
            tracing::info!(pid = %pid, "prediction completed");
        }
        Err(DriveError::Prediction(PredictionError::Canceled)) => {
            resp.status = PredictionStatus::Canceled;
            tracing::error!(pid = %pid, "prediction canceled");
        }
        Err(DriveError::Prediction(e)) => {
            resp.status = PredictionStatus::Failed;
            resp.error = Some(e.to_string());
            tracing::error!(pid = %pid, error = %e, "prediction failed");
        }
        Err(DriveError::Fatal(e)) => return Err(e),
    }

    resp.completed_at = Some(now_iso());
    respond(working_dir, ipc, pid, epoch, &mut resp).await
}

/// Emit one response: merge recorded metrics, write atomically, announce.
async fn respond(
    working_dir: &Path,
    ipc: &IpcClient,
    pid: &str,
    epoch: u32,
    resp: &mut PredictionResponse,
) -> Result<(), FatalError> {
    if let Some(metrics) = scope::metrics_snapshot(pid)
        && !metrics.is_empty()
    {
        let merged = resp.metrics.get_or_insert_with(serde_json::Map::new);
        for (k, v) in metrics {
            merged.insert(k, v);
        }
    }

    write_response(working_dir, pid, epoch, resp)?;
    ipc.notify(IpcStatus::Output).await;
    Ok(())
}

/// Write the body to a temp file in the working directory and rename it
/// into place. Rename within one directory is atomic, so the host never
/// sees a partial response.
fn write_response(
    working_dir: &Path,
    pid: &str,
    epoch: u32,
    resp: &PredictionResponse,
) -> Result<(), FatalError> {
    let tmp = tempfile::NamedTempFile::new_in(working_dir)?;
    serde_json::to_writer(tmp.as_file(), resp)?;
    let path = working_dir.join(response_name(pid, epoch));
    tmp.persist(&path).map_err(|e| FatalError::Io(e.error))?;
    Ok(())
}
