//! Worker bootstrap: config handover and the run entry point.
//!
//! The host writes `config.json` into the working directory once user code
//! is in place; the worker waits for it (bounded), deletes it, and starts
//! the file runner.

use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::time::Instant;

use crate::api::Registry;
use crate::file_runner::{CONFIG_FILE, Config, FileRunner};
use crate::ipc::IpcClient;

/// How long to wait for the config handover before giving up.
pub const CONFIG_TIMEOUT: Duration = Duration::from_secs(60);

const CONFIG_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config file not found after {0:?}")]
    Timeout(Duration),

    #[error("failed to read config: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Worker process options, straight from the command line.
#[derive(Debug, Clone)]
pub struct WorkerOpts {
    pub working_dir: PathBuf,
    pub ipc_url: String,
    pub name: Option<String>,
}

/// Wait for `<working-dir>/config.json`, parse it and delete it.
pub async fn await_config(working_dir: &Path, timeout: Duration) -> Result<Config, ConfigError> {
    let conf_file = working_dir.join(CONFIG_FILE);
    let started = Instant::now();
    loop {
        if conf_file.exists() {
            let raw = std::fs::read_to_string(&conf_file)?;
            let config: Config = serde_json::from_str(&raw)?;
            std::fs::remove_file(&conf_file)?;
            tracing::info!(
                elapsed = ?started.elapsed(),
                module = %config.module_name,
                predictor = %config.predictor_name,
                "config file found"
            );
            return Ok(config);
        }
        if started.elapsed() >= timeout {
            return Err(ConfigError::Timeout(timeout));
        }
        tokio::time::sleep(CONFIG_POLL).await;
    }
}

/// Run a worker to completion and return its exit code.
pub async fn run(opts: WorkerOpts, registry: Registry) -> i32 {
    let config = match await_config(&opts.working_dir, CONFIG_TIMEOUT).await {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(error = %e, "config handover failed");
            return 2;
        }
    };

    let ipc = IpcClient::new(
        opts.ipc_url,
        opts.name,
        opts.working_dir.display().to_string(),
    );
    let runner = FileRunner::new(opts.working_dir, ipc, registry, config);
    match runner.start().await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %e, "file runner failed");
            2
        }
    }
}
