//! kiln worker binary.
//!
//! Embedding crates register their predictors in a [`kiln::Registry`] and
//! call [`kiln::bootstrap::run`] from their own binary; this stock binary
//! is the same protocol shell with an empty registry, useful for driving
//! the filesystem contract end to end.

use std::process::ExitCode;

use clap::Parser;

use kiln::bootstrap::{self, WorkerOpts};
use kiln::{Registry, logs};

#[derive(Debug, Parser)]
#[command(name = "kiln", about = "Prediction worker over a filesystem inbox/outbox")]
struct Args {
    /// Directory shared with the supervising server.
    #[arg(long, value_name = "DIR")]
    working_dir: std::path::PathBuf,

    /// URL receiving READY/BUSY/OUTPUT notifications.
    #[arg(long, value_name = "URL")]
    ipc_url: String,

    /// Worker name included in IPC payloads.
    #[arg(long)]
    name: Option<String>,
}

fn main() -> ExitCode {
    let args = Args::parse();

    // Capture first so tracing output flows through the rewriter.
    if let Err(e) = logs::capture_process_output() {
        eprintln!("failed to capture process output: {e}");
    }
    init_tracing();

    let opts = WorkerOpts {
        working_dir: args.working_dir,
        ipc_url: args.ipc_url,
        name: args.name,
    };

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start runtime: {e}");
            return ExitCode::from(2);
        }
    };

    let code = runtime.block_on(bootstrap::run(opts, Registry::new()));
    ExitCode::from(code.clamp(0, u8::MAX as i32) as u8)
}

fn init_tracing() {
    use tracing_subscriber::EnvFilter;

    let filter = if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::from_default_env()
    } else {
        let level = match std::env::var("LOG_LEVEL").as_deref() {
            Ok(l) if l.trim().eq_ignore_ascii_case("debug") => "debug",
            _ => "info",
        };
        EnvFilter::new(format!("kiln={level},kiln_schema={level}"))
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(logs::ScopedWriter::new())
        .init();
}
