//! Task executor — drives a task through its state machine.
//!
//! Each attempt runs as one closure on the work pool:
//!
//! 1. admission against the node's resource snapshot;
//! 2. signed remaining budget `timeout_ms - (now - submit_ts)` (a spent
//!    budget is an immediate Timeout);
//! 3. a one-shot deadline timer armed for the remainder — on firing it sets
//!    the shared cancellation flag and transitions to Timeout, first writer
//!    wins;
//! 4. Pending → Running, dispatch through the registry, invoke;
//! 5. resolve: success, cooperative cancellation, bounded retry, or failure.
//!
//! Retries share a process-global in-flight budget of
//! [`MAX_CONCURRENT_RETRY`]; backoff doubles per attempt (capped at 16 s) on
//! the timer service, and the deadline keeps counting from the original
//! `submit_ts`, so retrying never extends the overall budget.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use dts_core::time::now_ms;
use dts_core::{ErrorKind, Resource, Task, TaskError, TaskHandle, TaskState};
use dts_runtime::{TimerEvent, TimerHandle, TimerService, WorkPool};

use crate::registry::FunctionRegistry;

/// Retries allowed in flight process-wide.
pub const MAX_CONCURRENT_RETRY: u32 = 10;

static RETRYING: AtomicU32 = AtomicU32::new(0);

/// Invoked once per terminal transition with a snapshot of the record.
pub type TerminalSink = Arc<dyn Fn(Task) + Send + Sync>;

pub struct TaskExecutor {
    pool: Arc<WorkPool>,
    timers: Arc<TimerService>,
    functions: Arc<FunctionRegistry>,
    available: Resource,
    on_terminal: Option<TerminalSink>,
}

impl TaskExecutor {
    pub fn new(
        pool: Arc<WorkPool>,
        timers: Arc<TimerService>,
        functions: FunctionRegistry,
        available: Resource,
    ) -> Self {
        Self {
            pool,
            timers,
            functions: Arc::new(functions),
            available,
            on_terminal: None,
        }
    }

    /// Install the terminal-result sink (the daemon's result hub). Must be
    /// called before the executor is shared.
    pub fn set_terminal_sink(&mut self, sink: TerminalSink) {
        self.on_terminal = Some(sink);
    }

    /// Schedule one attempt on the work pool; returns immediately.
    pub fn execute_task(self: &Arc<Self>, task: &TaskHandle) {
        let executor = self.clone();
        let handle = task.clone();
        if self
            .pool
            .enqueue(move || executor.run_task(&handle))
            .is_err()
        {
            self.finish(task, TaskState::Failed, Value::Null, "shutdown");
        }
    }

    /// Stop timers and the pool. In-flight retries resolve as
    /// Failed("shutdown") through their cancelled timers.
    pub fn shutdown(&self) {
        self.timers.shutdown();
        self.pool.shutdown();
    }

    fn run_task(self: &Arc<Self>, task: &TaskHandle) {
        // Admission against the static node snapshot.
        if task.required.cpu_core > self.available.cpu_core
            || task.required.mem_mb > self.available.mem_mb
        {
            self.finish(task, TaskState::Failed, Value::Null, "Insufficient resources");
            return;
        }

        // Remaining budget, signed: a task that sat past its deadline in the
        // queue (or across retries) times out before running.
        let now = now_ms();
        let remaining = i64::from(task.timeout_ms) - (now - task.submit_ts);
        if remaining <= 0 {
            self.finish(task, TaskState::Timeout, Value::Null, "Execution timeout");
            return;
        }

        // Arm the deadline. On fire: publish the cancellation flag, then a
        // guarded Timeout transition. If the handler completion path already
        // won the race, both writes are no-ops.
        let deadline = {
            let executor = self.clone();
            let handle = task.clone();
            self.timers
                .schedule(Duration::from_millis(remaining as u64), move |event| {
                    if event == TimerEvent::Fired && !handle.state().is_terminal() {
                        handle.cancel();
                        executor.finish(
                            &handle,
                            TaskState::Timeout,
                            Value::Null,
                            "Execution timeout",
                        );
                    }
                })
        };

        if !task.begin_attempt(now) {
            // The record left Pending while queued; nothing to run.
            deadline.cancel();
            return;
        }
        tracing::debug!(task_id = %task.task_id, func = %task.func_name, "task running");

        let Some(handler) = self.functions.get(&task.func_name) else {
            deadline.cancel();
            self.finish(
                task,
                TaskState::Failed,
                Value::Null,
                &format!("Unknown function: {}", task.func_name),
            );
            return;
        };

        match handler(&task.func_params, task) {
            Ok(result) => {
                deadline.cancel();
                self.finish(task, TaskState::Success, result, "");
            }
            Err(error) if error.kind == ErrorKind::Cancelled => {
                deadline.cancel();
                self.finish(task, TaskState::Cancelled, Value::Null, &error.message);
            }
            Err(error) if error.is_retryable() && task.retry_count() < task.max_retry => {
                self.schedule_retry(task, deadline, error);
            }
            Err(error) => {
                deadline.cancel();
                self.finish(
                    task,
                    TaskState::Failed,
                    Value::Null,
                    &format!("Execution failed: {}", error.message),
                );
            }
        }
    }

    fn schedule_retry(self: &Arc<Self>, task: &TaskHandle, deadline: TimerHandle, error: TaskError) {
        // Global in-flight budget, checked before arming.
        if RETRYING.fetch_add(1, Ordering::AcqRel) >= MAX_CONCURRENT_RETRY {
            RETRYING.fetch_sub(1, Ordering::AcqRel);
            deadline.cancel();
            self.finish(task, TaskState::Failed, Value::Null, "Retry quota full");
            return;
        }

        // Park the attempt back to Pending; if the deadline won meanwhile,
        // the retry is moot.
        if !task.rearm_for_retry() {
            RETRYING.fetch_sub(1, Ordering::AcqRel);
            return;
        }

        let level = task.retry_count().min(4);
        let delay = Duration::from_secs(1u64 << level);
        tracing::debug!(
            task_id = %task.task_id,
            attempt = task.retry_count() + 1,
            delay_s = delay.as_secs(),
            error = %error,
            "transient failure, retry scheduled"
        );

        let executor = self.clone();
        let handle = task.clone();
        self.timers.schedule(delay, move |event| {
            RETRYING.fetch_sub(1, Ordering::AcqRel);
            match event {
                TimerEvent::Fired => {
                    handle.bump_retry();
                    executor.execute_task(&handle);
                }
                // Shutdown cancelled the backoff: the retry is abandoned.
                TimerEvent::Cancelled => {
                    executor.finish(&handle, TaskState::Failed, Value::Null, "shutdown");
                }
            }
        });
        // The original deadline stays armed: the budget runs from submit_ts.
    }

    fn finish(&self, task: &TaskHandle, state: TaskState, result: Value, error_msg: &str) {
        if task.try_finish(state, result, error_msg, now_ms()) {
            tracing::debug!(
                task_id = %task.task_id,
                state = ?state,
                error = error_msg,
                "task finished"
            );
            if let Some(sink) = &self.on_terminal {
                sink(task.snapshot());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::register_builtins;
    use dts_core::{Task, TaskRecord};
    use serde_json::json;
    use std::sync::Mutex;
    use std::time::Instant;

    /// Tests that exercise the process-global retry budget run serialized.
    static RETRY_BUDGET: Mutex<()> = Mutex::new(());

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

    struct Fixture {
        executor: Arc<TaskExecutor>,
        timers: Arc<TimerService>,
    }

    impl Drop for Fixture {
        fn drop(&mut self) {
            // Drain timer entries so their executor captures are released.
            self.timers.shutdown();
        }
    }

    fn fixture(extra: impl FnOnce(&mut FunctionRegistry)) -> Fixture {
        let pool = Arc::new(WorkPool::new(4, 256));
        let timers = Arc::new(TimerService::new());
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);
        registry.register("sleepy", sleepy);
        extra(&mut registry);
        let executor = Arc::new(TaskExecutor::new(
            pool,
            timers.clone(),
            registry,
            Resource {
                cpu_core: 4.0,
                mem_mb: 8192,
            },
        ));
        Fixture { executor, timers }
    }

    fn submit(fixture: &Fixture, task: Task) -> TaskHandle {
        let handle: TaskHandle = Arc::new(TaskRecord::from_task(task));
        fixture.executor.execute_task(&handle);
        handle
    }

    fn wait_terminal(handle: &TaskHandle, timeout: Duration) -> TaskState {
        let end = Instant::now() + timeout;
        while !handle.state().is_terminal() {
            if Instant::now() > end {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        handle.state()
    }

    fn base_task(func: &str) -> Task {
        Task {
            task_id: "uuid-1234".into(),
            client_id: "client-001".into(),
            func_name: func.into(),
            required: Resource {
                cpu_core: 1.0,
                mem_mb: 512,
            },
            submit_ts: now_ms(),
            ..Task::default()
        }
    }

    #[test]
    fn fib_runs_to_success() {
        let fx = fixture(|_| {});
        let mut task = base_task("fib");
        task.func_params = json!({"n": 10});
        task.submit_ts = now_ms() - 100;

        let handle = submit(&fx, task);
        assert_eq!(wait_terminal(&handle, Duration::from_secs(5)), TaskState::Success);

        let snap = handle.snapshot();
        assert_eq!(snap.result["result"], 55);
        assert!(snap.error_msg.is_empty());
        assert!(snap.finish_ts > snap.submit_ts);
    }

    #[test]
    fn unknown_function_fails() {
        let fx = fixture(|_| {});
        let handle = submit(&fx, base_task("unknown"));
        assert_eq!(wait_terminal(&handle, Duration::from_secs(5)), TaskState::Failed);
        assert_eq!(handle.snapshot().error_msg, "Unknown function: unknown");
    }

    #[test]
    fn insufficient_resources_fail_before_running() {
        let fx = fixture(|_| {});
        let mut task = base_task("fib");
        task.func_params = json!({"n": 5});
        task.required = Resource {
            cpu_core: 10.0,
            mem_mb: 16_384,
        };
        let handle = submit(&fx, task);
        assert_eq!(wait_terminal(&handle, Duration::from_secs(5)), TaskState::Failed);
        let snap = handle.snapshot();
        assert_eq!(snap.error_msg, "Insufficient resources");
        assert_eq!(snap.start_ts, 0);
    }

    #[test]
    fn spent_budget_times_out_without_running() {
        let fx = fixture(|_| {});
        let mut task = base_task("fib");
        task.timeout_ms = 1000;
        task.submit_ts = now_ms() - 2000;
        let handle = submit(&fx, task);
        assert_eq!(wait_terminal(&handle, Duration::from_secs(5)), TaskState::Timeout);
        assert_eq!(handle.snapshot().error_msg, "Execution timeout");
    }

    #[test]
    fn deadline_fires_mid_run() {
        let fx = fixture(|_| {});
        let mut task = base_task("sleepy");
        task.func_params = json!({"slices": 30});
        task.timeout_ms = 100;

        let handle = submit(&fx, task);
        assert_eq!(wait_terminal(&handle, Duration::from_secs(5)), TaskState::Timeout);

        let snap = handle.snapshot();
        assert_eq!(snap.error_msg, "Execution timeout");
        // The handler observed the flag and returned early, but its Success
        // write lost the race and must not have overwritten the timeout.
        assert!(handle.is_cancelled());
    }

    #[test]
    fn cooperative_cancel_lets_the_handler_choose_its_exit() {
        let fx = fixture(|_| {});
        let mut task = base_task("sleepy");
        task.func_params = json!({"slices": 200});

        let handle = submit(&fx, task);
        std::thread::sleep(Duration::from_millis(50));
        handle.cancel();

        assert_eq!(wait_terminal(&handle, Duration::from_secs(5)), TaskState::Success);
        assert_eq!(handle.snapshot().result["result"], "cancelled");
    }

    #[test]
    fn transient_failures_retry_then_succeed() {
        let _serial = RETRY_BUDGET.lock().unwrap_or_else(|e| e.into_inner());

        let attempts = Arc::new(AtomicU32::new(0));
        let fx = {
            let attempts = attempts.clone();
            fixture(move |registry| {
                registry.register("flaky", move |_, _| {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        Err(TaskError::connection_refused())
                    } else {
                        Ok(json!({ "ok": true }))
                    }
                });
            })
        };

        let mut task = base_task("flaky");
        task.max_retry = 5;
        let handle = submit(&fx, task);

        // Two backoffs (1 s + 2 s) plus slack.
        assert_eq!(wait_terminal(&handle, Duration::from_secs(10)), TaskState::Success);
        assert_eq!(handle.retry_count(), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn retry_quota_exhaustion_fails_the_overflow() {
        let _serial = RETRY_BUDGET.lock().unwrap_or_else(|e| e.into_inner());

        let fx = fixture(|registry| {
            registry.register("always-transient", |_, _| {
                Err::<Value, _>(TaskError::host_unreachable())
            });
        });

        let handles: Vec<TaskHandle> = (0..12)
            .map(|i| {
                let mut task = base_task("always-transient");
                task.task_id = format!("quota-{i}");
                task.max_retry = 1;
                submit(&fx, task)
            })
            .collect();

        for handle in &handles {
            assert_eq!(
                wait_terminal(handle, Duration::from_secs(10)),
                TaskState::Failed
            );
        }
        let quota_failures = handles
            .iter()
            .filter(|h| h.snapshot().error_msg == "Retry quota full")
            .count();
        assert!(
            quota_failures >= 2,
            "expected >=2 quota failures, got {quota_failures}"
        );
    }

    #[test]
    fn shutdown_abandons_armed_retries() {
        let _serial = RETRY_BUDGET.lock().unwrap_or_else(|e| e.into_inner());

        let fx = fixture(|registry| {
            registry.register("always-transient", |_, _| {
                Err::<Value, _>(TaskError::aborted())
            });
        });

        let mut task = base_task("always-transient");
        task.max_retry = 5;
        let handle = submit(&fx, task);

        // Let the first attempt fail and arm its backoff timer (the deadline
        // timer is the other pending entry).
        let end = Instant::now() + Duration::from_secs(2);
        while fx.timers.pending() < 2 && Instant::now() < end {
            std::thread::sleep(Duration::from_millis(2));
        }
        fx.timers.shutdown();

        assert_eq!(wait_terminal(&handle, Duration::from_secs(5)), TaskState::Failed);
        assert_eq!(handle.snapshot().error_msg, "shutdown");
    }

    #[test]
    fn cancelled_error_kind_maps_to_cancelled_state() {
        let fx = fixture(|registry| {
            registry.register("gives-up", |_, task| {
                task.cancel();
                Err::<Value, _>(TaskError::cancelled())
            });
        });
        let handle = submit(&fx, base_task("gives-up"));
        assert_eq!(
            wait_terminal(&handle, Duration::from_secs(5)),
            TaskState::Cancelled
        );
    }
}
