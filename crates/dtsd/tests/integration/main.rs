//! dtsd integration harness.
//!
//! End-to-end tests over real loopback sockets: a full daemon stack
//! (executor, hub, dispatch service, RPC server) in-process, driven by
//! `DtsClient` from separate OS threads. No external environment needed.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::{json, Value};

use dts_core::codec::WireTask;
use dts_core::wire::Status;
use dts_core::{Resource, Task, TaskError, TaskHandle, TaskState};
use dts_rpc::{DtsClient, Server, ServerOptions, StreamSink, TaskService};
use dts_runtime::{TimerService, WorkPool};
use dtsd::executor::TaskExecutor;
use dtsd::hub::ResultHub;
use dtsd::registry::{register_builtins, FunctionRegistry};
use dtsd::DispatchService;

mod lifecycle;
mod submit;

// ── Harness ───────────────────────────────────────────────────────────────────

/// A complete in-process daemon bound to a free loopback port.
pub struct TestDaemon {
    server: Server,
    executor: Arc<TaskExecutor>,
    hub: Arc<ResultHub>,
}

impl TestDaemon {
    /// Start the real dispatch stack; `extra` may register more handlers.
    pub fn start(extra: impl FnOnce(&mut FunctionRegistry)) -> Self {
        let pool = Arc::new(WorkPool::new(4, 256));
        let timers = Arc::new(TimerService::new());
        let hub = Arc::new(ResultHub::new());

        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);
        registry.register("sleepy", sleepy);
        extra(&mut registry);

        let mut executor = TaskExecutor::new(
            pool,
            timers,
            registry,
            Resource {
                cpu_core: 4.0,
                mem_mb: 8192,
            },
        );
        {
            let hub = hub.clone();
            executor.set_terminal_sink(Arc::new(move |task| hub.publish(&task)));
        }
        let executor = Arc::new(executor);

        let service = Arc::new(DispatchService::new(executor.clone(), hub.clone()));
        let server = Server::start(
            ServerOptions {
                port: 0,
                queue_count: 2,
                initial_contexts: 8,
            },
            service,
        )
        .expect("test server failed to start");

        Self {
            server,
            executor,
            hub,
        }
    }

    /// Start a server around a custom service instead of the real stack.
    pub fn start_with_service(service: Arc<dyn TaskService>) -> Server {
        Server::start(
            ServerOptions {
                port: 0,
                queue_count: 2,
                initial_contexts: 8,
            },
            service,
        )
        .expect("test server failed to start")
    }

    pub fn connect(&self) -> DtsClient {
        DtsClient::connect(self.server.local_addr()).expect("client failed to connect")
    }
}

impl Drop for TestDaemon {
    fn drop(&mut self) {
        self.hub.close_all();
        self.server.shutdown();
        self.executor.shutdown();
    }
}

/// Cancellable handler: sleeps `slices` × 10 ms, polling the flag each slice.
fn sleepy(params: &Value, task: &TaskHandle) -> Result<Value, TaskError> {
    let slices = params.get("slices").and_then(Value::as_u64).unwrap_or(30);
    for _ in 0..slices {
        if task.is_cancelled() {
            return Ok(json!({ "result": "cancelled" }));
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    Ok(json!({ "result": "slept" }))
}

/// A minimal service: echo the submitted task back as Success.
pub struct EchoService;

impl TaskService for EchoService {
    fn submit_task(&self, mut task: WireTask) -> Result<WireTask, Status> {
        task.state = TaskState::Success as u8;
        Ok(task)
    }
    fn cancel_task(&self, _task_id: &str) -> bool {
        false
    }
    fn query_status(&self, _task_id: &str) -> Result<WireTask, Status> {
        Err(Status::new(
            dts_core::wire::StatusCode::NotFound,
            "echo service stores nothing",
        ))
    }
    fn listen_results(&self, _client_id: &str, _sink: StreamSink) -> Result<(), Status> {
        Ok(())
    }
}

pub fn task(func: &str, params: Value) -> Task {
    Task {
        task_id: uuid::Uuid::new_v4().to_string(),
        client_id: "client-001".into(),
        func_name: func.into(),
        func_params: params,
        required: Resource {
            cpu_core: 1.0,
            mem_mb: 512,
        },
        ..Task::default()
    }
}

/// Poll `query_status` until the task reaches a terminal state.
pub fn wait_terminal(client: &DtsClient, task_id: &str, timeout: Duration) -> Task {
    let end = Instant::now() + timeout;
    loop {
        let snapshot = client
            .query_status(task_id)
            .expect("query_status failed while polling");
        if snapshot.state.is_terminal() {
            return snapshot;
        }
        assert!(
            Instant::now() < end,
            "task {task_id} still {:?} after {timeout:?}",
            snapshot.state
        );
        std::thread::sleep(Duration::from_millis(10));
    }
}
