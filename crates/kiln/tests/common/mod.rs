#![allow(dead_code)]

//! Shared harness for file-runner integration tests: an in-process worker
//! over a temp working directory, with a mock IPC endpoint recording every
//! notification.

use std::path::PathBuf;
use std::time::Duration;

use tokio::task::JoinHandle;
use wiremock::matchers::method;
use wiremock::{Mock, MockServer, ResponseTemplate};

use kiln::{
    Config, FatalError, FileRunner, Inputs, IpcClient, PredictOutput, PredictionError, Registry,
    current_scope,
};
use kiln_schema::{Declared, InputOpts, OutputDecl, Signature, Value};

pub const WAIT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestWorker {
    pub dir: PathBuf,
    pub ipc: MockServer,
    handle: std::cell::RefCell<Option<JoinHandle<Result<i32, FatalError>>>>,
    _tempdir: tempfile::TempDir,
}

pub fn config(module: &str, predictor: &str, max_concurrency: usize) -> Config {
    serde_json::from_value(serde_json::json!({
        "module_name": module,
        "predictor_name": predictor,
        "max_concurrency": max_concurrency,
    }))
    .unwrap()
}

pub async fn start_worker(registry: Registry, config: Config) -> TestWorker {
    start_worker_in(tempfile::tempdir().unwrap(), registry, config).await
}

/// Start a worker over an existing directory (for pre-seeded state).
pub async fn start_worker_in(
    tempdir: tempfile::TempDir,
    registry: Registry,
    config: Config,
) -> TestWorker {
    let ipc = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&ipc)
        .await;

    let client = IpcClient::new(ipc.uri(), None, tempdir.path().display().to_string());
    let runner = FileRunner::new(tempdir.path(), client, registry, config);
    let handle = tokio::spawn(runner.start());

    TestWorker {
        dir: tempdir.path().to_path_buf(),
        ipc,
        handle: std::cell::RefCell::new(Some(handle)),
        _tempdir: tempdir,
    }
}

impl TestWorker {
    pub fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    pub fn touch(&self, name: &str) {
        std::fs::File::create(self.path(name)).unwrap();
    }

    /// Poll until a file appears (or disappears), like the host would.
    pub async fn wait_for(&self, name: &str, exists: bool) {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            if self.path(name).exists() == exists {
                return;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {name} exists={exists}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Drop a request file into the working directory, atomically.
    pub fn write_request(&self, pid: &str, body: serde_json::Value) {
        let tmp = tempfile::NamedTempFile::new_in(&self.dir).unwrap();
        std::fs::write(tmp.path(), serde_json::to_vec(&body).unwrap()).unwrap();
        tmp.persist(self.path(&format!("request-{pid}.json"))).unwrap();
    }

    pub fn read_json(&self, name: &str) -> serde_json::Value {
        let raw = std::fs::read_to_string(self.path(name)).unwrap();
        serde_json::from_str(&raw).unwrap()
    }

    pub fn read_response(&self, pid: &str, epoch: u32) -> serde_json::Value {
        self.read_json(&format!("response-{pid}-{epoch:05}.json"))
    }

    /// IPC statuses received so far, in order.
    pub async fn statuses(&self) -> Vec<String> {
        self.ipc
            .received_requests()
            .await
            .unwrap()
            .iter()
            .map(|r| {
                let body: serde_json::Value = serde_json::from_slice(&r.body).unwrap();
                body["status"].as_str().unwrap().to_string()
            })
            .collect()
    }

    /// Wait until at least `n` IPC notifications have arrived.
    pub async fn wait_statuses_len(&self, n: usize) -> Vec<String> {
        let deadline = tokio::time::Instant::now() + WAIT_TIMEOUT;
        loop {
            let statuses = self.statuses().await;
            if statuses.len() >= n {
                return statuses;
            }
            if tokio::time::Instant::now() > deadline {
                panic!("timed out waiting for {n} IPC statuses, got {statuses:?}");
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    }

    /// Touch the stop file and wait for the loop to exit.
    pub async fn stop(&self) -> i32 {
        self.touch("stop");
        let handle = self.handle.borrow_mut().take().unwrap();
        handle.await.unwrap().unwrap()
    }

    /// Wait for the loop to exit on its own (setup failure).
    pub async fn exit_code(&self) -> i32 {
        let handle = self.handle.borrow_mut().take().unwrap();
        handle.await.unwrap().unwrap()
    }
}

// ---------------------------------------------------------------------------
// Test predictors
// ---------------------------------------------------------------------------

fn echo_signature() -> Signature {
    Signature::new()
        .input("i", Declared::Integer)
        .input("s", Declared::String)
        .output(OutputDecl::Value(Declared::String))
}

/// `predict(i: int, s: str) -> str` returning `"*" + s + "*"`.
pub fn register_echo(registry: &mut Registry) {
    registry.register("tests.runners.echo", "Predictor", || {
        Box::new(kiln::api::FnPredictor::new(echo_signature(), |inputs: Inputs| {
            let s = inputs.get_str("s")?;
            Ok(PredictOutput::value(format!("*{s}*")))
        }))
    });
}

/// Echo that records a metric before returning.
pub fn register_metric_echo(registry: &mut Registry) {
    registry.register("tests.runners.metric", "Predictor", || {
        Box::new(kiln::api::FnPredictor::new(echo_signature(), |inputs: Inputs| {
            let s = inputs.get_str("s")?;
            current_scope()
                .map_err(|e| PredictionError::Failed(e.to_string()))?
                .record_metric("input_len", s.len());
            Ok(PredictOutput::value(format!("*{s}*")))
        }))
    });
}

/// Masked secret round-trip: takes a secret, emits it as a secret output.
pub fn register_secret(registry: &mut Registry) {
    let signature = || {
        Signature::new()
            .input("token", Declared::Secret)
            .output(OutputDecl::Value(Declared::Secret))
    };
    registry.register("tests.runners.secret", "Predictor", move || {
        Box::new(kiln::api::FnPredictor::new(signature(), |inputs: Inputs| {
            let token = inputs.get_secret("token")?.clone();
            Ok(PredictOutput::Value(Value::Secret(token)))
        }))
    });
}

/// Path output: responses must carry `file://` URIs.
pub fn register_path(registry: &mut Registry) {
    let signature = || {
        Signature::new()
            .input("name", Declared::String)
            .output(OutputDecl::Value(Declared::Path))
    };
    registry.register("tests.runners.path", "Predictor", move || {
        Box::new(kiln::api::FnPredictor::new(signature(), |inputs: Inputs| {
            let name = inputs.get_str("name")?;
            Ok(PredictOutput::Value(Value::Path(format!("/outputs/{name}").into())))
        }))
    });
}

/// `predict(i: int, s: str) -> Iterator[str]` yielding `"*{s}-{k}*"`.
pub fn register_iterator(registry: &mut Registry) {
    let signature = || {
        Signature::new()
            .input("i", Declared::Integer)
            .input("s", Declared::String)
            .output(OutputDecl::Iterator(Declared::String))
    };
    registry.register("tests.runners.iterator", "Predictor", move || {
        Box::new(kiln::api::FnPredictor::new(signature(), |inputs: Inputs| {
            let i = inputs.get_int("i")?;
            let s = inputs.get_str("s")?.to_string();
            Ok(PredictOutput::iter(
                (0..i).map(move |k| Ok(Value::Str(format!("*{s}-{k}*")))),
            ))
        }))
    });
}

/// Concatenating token stream.
pub fn register_concat(registry: &mut Registry) {
    let signature = || {
        Signature::new()
            .input("s", Declared::String)
            .output(OutputDecl::ConcatIterator)
    };
    registry.register("tests.runners.concat", "Predictor", move || {
        Box::new(kiln::api::FnPredictor::new(signature(), |inputs: Inputs| {
            let s = inputs.get_str("s")?.to_string();
            let chunks = vec!["out", "put: ", s.as_str()];
            let owned: Vec<Value> = chunks.into_iter().map(|c| Value::Str(c.to_string())).collect();
            Ok(PredictOutput::iter(owned.into_iter().map(Ok)))
        }))
    });
}

/// Blocking predictor that sleeps `i` seconds in 20 ms slices, checking
/// the cooperative cancellation point between slices.
pub fn register_blocking_sleep(registry: &mut Registry) {
    registry.register("tests.runners.sleep", "Predictor", || {
        Box::new(kiln::api::FnPredictor::new(echo_signature(), |inputs: Inputs| {
            let i = inputs.get_int("i")?;
            let s = inputs.get_str("s")?.to_string();
            let scope = current_scope().map_err(|e| PredictionError::Failed(e.to_string()))?;
            let start = std::time::Instant::now();
            while start.elapsed() < Duration::from_secs(i as u64) {
                std::thread::sleep(Duration::from_millis(20));
                scope.checkpoint()?;
            }
            Ok(PredictOutput::value(format!("*{s}*")))
        }))
    });
}

/// Async predictor sleeping `i` milliseconds before echoing.
pub fn register_async_sleep(registry: &mut Registry) {
    let signature = || {
        Signature::new()
            .input("i", Declared::Integer)
            .input("s", Declared::String)
            .output(OutputDecl::Value(Declared::String))
            .asynchronous()
    };
    registry.register("tests.runners.async_sleep", "Predictor", move || {
        Box::new(kiln::api::FnPredictor::new(signature(), |inputs: Inputs| {
            let i = inputs.get_int("i")?;
            let s = inputs.get_str("s")?.to_string();
            Ok(PredictOutput::future(async move {
                tokio::time::sleep(Duration::from_millis(i as u64)).await;
                Ok(Value::Str(format!("*{s}*")))
            }))
        }))
    });
}

/// Predictor whose setup always fails.
pub fn register_failing_setup(registry: &mut Registry) {
    struct FailingSetup;

    #[async_trait::async_trait]
    impl kiln::Predictor for FailingSetup {
        fn signature(&self) -> Signature {
            echo_signature()
        }

        async fn setup(
            &mut self,
            _weights: Option<kiln::Weights>,
        ) -> Result<(), kiln::SetupError> {
            Err(kiln::SetupError::setup("weights went missing"))
        }

        fn predict(&self, _inputs: Inputs) -> Result<PredictOutput, PredictionError> {
            Ok(PredictOutput::value("unreachable"))
        }
    }

    registry.register("tests.runners.failing", "Predictor", || Box::new(FailingSetup));
}

/// Predictor with a default and an optional input.
pub fn register_defaults(registry: &mut Registry) {
    let signature = || {
        Signature::new()
            .input_with(
                "s",
                Declared::String,
                InputOpts::new().default_value(serde_json::json!("foo")),
            )
            .input("extra", Declared::optional(Declared::String))
            .output(OutputDecl::Value(Declared::String))
    };
    registry.register("tests.runners.defaults", "Predictor", move || {
        Box::new(kiln::api::FnPredictor::new(signature(), |inputs: Inputs| {
            let s = inputs.get_str("s")?;
            let suffix = match inputs.optional("extra") {
                Some(Value::Str(e)) => format!("+{e}"),
                _ => String::new(),
            };
            Ok(PredictOutput::value(format!("*{s}{suffix}*")))
        }))
    });
}
