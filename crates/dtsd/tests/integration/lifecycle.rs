//! Full-stack lifecycle: deadlines, cancellation, retries, streaming.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde_json::json;

use dts_core::wire::StatusCode;
use dts_core::{Resource, Task, TaskError, TaskState};
use dts_rpc::RpcError;

use crate::{task, wait_terminal, TestDaemon};

#[test]
fn fib_runs_to_success_over_rpc() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();

    let request = task("fib", json!({"n": 10}));
    let accepted = client.submit_task(&request).unwrap();
    // The accepted snapshot may already have advanced past Pending on a
    // fast handler; identity is what the echo guarantees.
    assert_eq!(accepted.task_id, request.task_id);

    let done = wait_terminal(&client, &request.task_id, Duration::from_secs(5));
    assert_eq!(done.state, TaskState::Success);
    assert_eq!(done.result["result"], 55);
    assert!(done.finish_ts > done.submit_ts);
}

#[test]
fn unknown_function_fails_over_rpc() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();

    let request = task("unknown", json!({}));
    client.submit_task(&request).unwrap();

    let done = wait_terminal(&client, &request.task_id, Duration::from_secs(5));
    assert_eq!(done.state, TaskState::Failed);
    assert!(done.error_msg.contains("Unknown function"));
}

#[test]
fn insufficient_resources_fail_over_rpc() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();

    let mut request = task("fib", json!({"n": 5}));
    request.required = Resource {
        cpu_core: 10.0,
        mem_mb: 16_384,
    };
    client.submit_task(&request).unwrap();

    let done = wait_terminal(&client, &request.task_id, Duration::from_secs(5));
    assert_eq!(done.state, TaskState::Failed);
    assert_eq!(done.error_msg, "Insufficient resources");
}

#[test]
fn deadline_times_out_a_slow_handler() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();

    let mut request = task("sleepy", json!({"slices": 30}));
    request.timeout_ms = 100;
    client.submit_task(&request).unwrap();

    let done = wait_terminal(&client, &request.task_id, Duration::from_secs(5));
    assert_eq!(done.state, TaskState::Timeout);
    assert_eq!(done.error_msg, "Execution timeout");
}

#[test]
fn cancel_task_round_trip() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();

    let request = task("sleepy", json!({"slices": 500}));
    client.submit_task(&request).unwrap();
    std::thread::sleep(Duration::from_millis(50));

    assert!(client.cancel_task(&request.task_id).unwrap());

    let done = wait_terminal(&client, &request.task_id, Duration::from_secs(5));
    // Cooperative: the handler chose its own exit value.
    assert_eq!(done.state, TaskState::Success);
    assert_eq!(done.result["result"], "cancelled");

    // Terminal task: a second cancel is refused.
    assert!(!client.cancel_task(&request.task_id).unwrap());
}

#[test]
fn cancel_unknown_task_returns_false() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();
    assert!(!client.cancel_task("no-such-task").unwrap());
}

#[test]
fn query_unknown_task_is_not_found() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();
    match client.query_status("no-such-task") {
        Err(RpcError::Status(status)) => assert_eq!(status.code, StatusCode::NotFound),
        other => panic!("expected NotFound, got {other:?}"),
    }
}

#[test]
fn listen_results_streams_terminal_tasks() {
    let daemon = TestDaemon::start(|_| {});
    let client = daemon.connect();

    let received: Arc<Mutex<Vec<Task>>> = Arc::new(Mutex::new(Vec::new()));
    {
        let received = received.clone();
        client.listen_results(
            "client-001",
            Arc::new(move |task, status| {
                assert!(status.is_ok(), "unexpected terminal status: {status}");
                received.lock().unwrap().push(task);
            }),
        );
    }
    // Let the subscription reach the hub before submitting.
    std::thread::sleep(Duration::from_millis(200));

    let request = task("fib", json!({"n": 10}));
    client.submit_task(&request).unwrap();

    let end = Instant::now() + Duration::from_secs(5);
    loop {
        {
            let received = received.lock().unwrap();
            if let Some(result) = received.iter().find(|t| t.task_id == request.task_id) {
                assert_eq!(result.state, TaskState::Success);
                assert_eq!(result.result["result"], 55);
                break;
            }
        }
        assert!(Instant::now() < end, "no streamed result arrived");
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn transient_handler_retries_to_success_over_rpc() {
    let attempts = Arc::new(AtomicU32::new(0));
    let daemon = {
        let attempts = attempts.clone();
        TestDaemon::start(move |registry| {
            registry.register("flaky", move |_, _| {
                if attempts.fetch_add(1, Ordering::SeqCst) < 1 {
                    Err(TaskError::connection_refused())
                } else {
                    Ok(json!({ "ok": true }))
                }
            });
        })
    };
    let client = daemon.connect();

    let mut request = task("flaky", json!({}));
    request.max_retry = 3;
    client.submit_task(&request).unwrap();

    // One 1-second backoff plus slack.
    let done = wait_terminal(&client, &request.task_id, Duration::from_secs(10));
    assert_eq!(done.state, TaskState::Success);
    assert_eq!(done.retry_count, 1);
}
