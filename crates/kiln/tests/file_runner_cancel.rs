//! SIGUSR1 cancellation of a blocking predictor.
//!
//! Kept in its own test binary: it raises a real signal against the test
//! process and must not share it with unrelated tests.

#![cfg(unix)]

mod common;

use std::time::Duration;

use common::{config, start_worker};
use kiln::Registry;
use serde_json::json;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn sigusr1_cancels_blocking_prediction() {
    let mut registry = Registry::new();
    common::register_blocking_sleep(&mut registry);
    let worker = start_worker(registry, config("tests.runners.sleep", "Predictor", 1)).await;

    worker.wait_for("setup_result.json", true).await;
    // Blocking predictors do not advertise the async marker.
    assert!(!worker.path("async_predict").exists());

    worker.write_request("blk", json!({"input": {"i": 60, "s": "bar"}}));
    worker.wait_for("request-blk.json", false).await;

    // Give the predictor time to enter its sleep loop, then deliver the
    // cancellation signal.
    tokio::time::sleep(Duration::from_millis(200)).await;
    nix::sys::signal::raise(nix::sys::signal::Signal::SIGUSR1).unwrap();

    worker.wait_for("response-blk-00000.json", true).await;
    let resp = worker.read_response("blk", 0);
    assert_eq!(resp["status"], "canceled");
    assert!(resp.get("error").is_none());

    // READY follows once the canceled prediction is reaped.
    let statuses = worker.wait_statuses_len(4).await;
    assert_eq!(statuses, vec!["READY", "BUSY", "OUTPUT", "READY"]);

    assert_eq!(worker.stop().await, 0);
}
