//! Async predictors: the async_predict marker, file-based cancellation and
//! concurrent admission.

mod common;

use std::time::Duration;

use common::{config, start_worker};
use kiln::Registry;
use serde_json::json;

fn async_registry() -> Registry {
    let mut registry = Registry::new();
    common::register_async_sleep(&mut registry);
    registry
}

#[tokio::test(flavor = "multi_thread")]
async fn async_predictor_touches_marker() {
    let worker = start_worker(
        async_registry(),
        config("tests.runners.async_sleep", "Predictor", 1),
    )
    .await;

    worker.wait_for("setup_result.json", true).await;
    worker.wait_for("async_predict", true).await;

    worker.write_request("a", json!({"input": {"i": 10, "s": "bar"}}));
    worker.wait_for("response-a-00000.json", true).await;
    assert_eq!(worker.read_response("a", 0)["output"], "*bar*");

    assert_eq!(worker.stop().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_file_cancels_async_prediction() {
    let worker = start_worker(
        async_registry(),
        config("tests.runners.async_sleep", "Predictor", 1),
    )
    .await;

    worker.wait_for("setup_result.json", true).await;
    worker.write_request("c1", json!({"input": {"i": 60000, "s": "bar"}}));
    worker.wait_for("request-c1.json", false).await;

    worker.touch("cancel-c1");
    worker.wait_for("cancel-c1", false).await;
    worker.wait_for("response-c1-00000.json", true).await;

    let resp = worker.read_response("c1", 0);
    assert_eq!(resp["status"], "canceled");
    assert!(resp.get("error").is_none());

    // Back to READY after the canceled prediction is reaped.
    let statuses = worker.wait_statuses_len(4).await;
    assert_eq!(statuses.last().unwrap(), "READY");

    assert_eq!(worker.stop().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn cancel_for_unknown_pid_is_swallowed() {
    let worker = start_worker(
        async_registry(),
        config("tests.runners.async_sleep", "Predictor", 1),
    )
    .await;

    worker.wait_for("setup_result.json", true).await;
    worker.touch("cancel-nope");
    worker.wait_for("cancel-nope", false).await;

    // Still serving afterwards.
    worker.write_request("ok", json!({"input": {"i": 10, "s": "fine"}}));
    worker.wait_for("response-ok-00000.json", true).await;
    assert_eq!(worker.read_response("ok", 0)["status"], "succeeded");

    assert_eq!(worker.stop().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_admission_respects_cap() {
    let worker = start_worker(
        async_registry(),
        config("tests.runners.async_sleep", "Predictor", 2),
    )
    .await;

    worker.wait_for("setup_result.json", true).await;

    // A and B fill both slots; C must wait on disk.
    worker.write_request("a", json!({"input": {"i": 400, "s": "a"}}));
    worker.write_request("b", json!({"input": {"i": 1500, "s": "b"}}));
    worker.wait_for("request-a.json", false).await;
    worker.wait_for("request-b.json", false).await;

    worker.write_request("cc", json!({"input": {"i": 50, "s": "c"}}));
    tokio::time::sleep(Duration::from_millis(150)).await;
    assert!(
        worker.path("request-cc.json").exists(),
        "request admitted above max_concurrency"
    );

    // Once A completes, C is admitted and finishes.
    worker.wait_for("response-a-00000.json", true).await;
    worker.wait_for("response-cc-00000.json", true).await;
    worker.wait_for("response-b-00000.json", true).await;

    for pid in ["a", "b", "cc"] {
        let resp = worker.read_response(pid, 0);
        assert_eq!(resp["status"], "succeeded", "pid {pid}");
    }
    assert_eq!(worker.read_response("a", 0)["output"], "*a*");
    assert_eq!(worker.read_response("b", 0)["output"], "*b*");
    assert_eq!(worker.read_response("cc", 0)["output"], "*c*");

    // Admission edges were announced: the trace starts READY and reports
    // BUSY whenever a request lands in a previously-idle slot.
    let statuses = worker.statuses().await;
    assert_eq!(statuses.first().unwrap(), "READY");
    assert!(statuses.iter().any(|s| s == "BUSY"), "no BUSY edge in {statuses:?}");
    assert_eq!(statuses.iter().filter(|s| s.as_str() == "OUTPUT").count(), 3);

    assert_eq!(worker.stop().await, 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_cancels_in_flight_predictions() {
    let worker = start_worker(
        async_registry(),
        config("tests.runners.async_sleep", "Predictor", 1),
    )
    .await;

    worker.wait_for("setup_result.json", true).await;
    worker.write_request("s1", json!({"input": {"i": 60000, "s": "bar"}}));
    worker.wait_for("request-s1.json", false).await;

    // Stop while the prediction is sleeping; it is canceled and drained.
    assert_eq!(worker.stop().await, 0);

    let resp = worker.read_response("s1", 0);
    assert_eq!(resp["status"], "canceled");
}
