//! SubmitTask round trips against the echo service.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use serde_json::json;

use dts_core::TaskState;
use dts_rpc::DtsClient;

use crate::{task, EchoService, TestDaemon};

#[test]
fn submit_echoes_task_id_and_success() {
    let mut server = TestDaemon::start_with_service(Arc::new(EchoService));
    let client = DtsClient::connect(server.local_addr()).unwrap();

    let mut request = task("fib", json!({"n": 10}));
    request.task_id = "echo-1".into();

    let response = client.submit_task(&request).unwrap();
    assert_eq!(response.task_id, "echo-1");
    assert_eq!(response.state, TaskState::Success);
    assert_eq!(response.func_params["n"], 10);

    server.shutdown();
}

#[test]
fn concurrent_submits_all_succeed() {
    const THREADS: u32 = 4;
    const PER_THREAD: u32 = 400;

    let server = TestDaemon::start_with_service(Arc::new(EchoService));
    let addr = server.local_addr();
    let ok_count = Arc::new(AtomicU32::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|lane| {
            let ok_count = ok_count.clone();
            std::thread::spawn(move || {
                let client = DtsClient::connect(addr).unwrap();
                for i in 0..PER_THREAD {
                    let mut request = task("fib", json!({"n": 1}));
                    request.task_id = format!("c{lane}-{i}");
                    match client.submit_task(&request) {
                        Ok(response)
                            if response.state == TaskState::Success
                                && response.task_id == request.task_id =>
                        {
                            ok_count.fetch_add(1, Ordering::Relaxed);
                        }
                        other => panic!("submit c{lane}-{i} failed: {other:?}"),
                    }
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert_eq!(ok_count.load(Ordering::Relaxed), THREADS * PER_THREAD);
}

#[test]
fn async_submit_callback_fires_exactly_once() {
    let server = TestDaemon::start_with_service(Arc::new(EchoService));
    let client = DtsClient::connect(server.local_addr()).unwrap();

    let fired = Arc::new(AtomicU32::new(0));
    let receiver = {
        let fired = fired.clone();
        client.submit_task_async(
            &task("fib", json!({"n": 2})),
            Some(Arc::new(move |_task, status| {
                assert!(status.is_ok());
                fired.fetch_add(1, Ordering::SeqCst);
            })),
        )
    };

    let result = receiver.recv().unwrap().unwrap();
    assert_eq!(result.state, TaskState::Success);
    // The callback fired on delivery, once.
    assert_eq!(fired.load(Ordering::SeqCst), 1);
}
