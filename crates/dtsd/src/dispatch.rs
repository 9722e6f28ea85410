//! The daemon's `TaskService` implementation.
//!
//! Wires the RPC front door to the executor: submissions land in the task
//! table and are scheduled immediately; cancel flips the shared flag on a
//! live record; query snapshots the table; listen subscribes to the result
//! hub. Handlers run on driver threads and only ever enqueue work.

use std::sync::Arc;

use dashmap::DashMap;

use dts_core::codec::{from_wire, to_wire, WireTask};
use dts_core::time::now_ms;
use dts_core::wire::{Status, StatusCode};
use dts_core::{TaskHandle, TaskRecord, TaskState};
use dts_rpc::{StreamSink, TaskService};

use crate::executor::TaskExecutor;
use crate::hub::ResultHub;

pub struct DispatchService {
    executor: Arc<TaskExecutor>,
    hub: Arc<ResultHub>,
    tasks: DashMap<String, TaskHandle>,
}

impl DispatchService {
    pub fn new(executor: Arc<TaskExecutor>, hub: Arc<ResultHub>) -> Self {
        Self {
            executor,
            hub,
            tasks: DashMap::new(),
        }
    }

    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }
}

impl TaskService for DispatchService {
    fn submit_task(&self, wire: WireTask) -> Result<WireTask, Status> {
        let mut task = from_wire(wire)
            .map_err(|e| Status::new(StatusCode::Internal, format!("invalid task: {e}")))?;
        if task.task_id.is_empty() {
            return Err(Status::new(StatusCode::Internal, "task_id is required"));
        }

        // Clients that pre-stamp keep their budget; everyone else starts now.
        if task.submit_ts == 0 {
            task.submit_ts = now_ms();
        }
        task.state = TaskState::Pending;

        let handle: TaskHandle = Arc::new(TaskRecord::from_task(task));
        // Duplicate ids: the latest submission replaces the table entry.
        if self
            .tasks
            .insert(handle.task_id.clone(), handle.clone())
            .is_some()
        {
            tracing::warn!(task_id = %handle.task_id, "resubmitted task id replaces table entry");
        }

        tracing::info!(task_id = %handle.task_id, func = %handle.func_name, "task accepted");
        self.executor.execute_task(&handle);
        Ok(to_wire(&handle.snapshot()))
    }

    fn cancel_task(&self, task_id: &str) -> bool {
        match self.tasks.get(task_id) {
            Some(handle) if !handle.state().is_terminal() => {
                handle.cancel();
                tracing::info!(task_id, "cancellation requested");
                true
            }
            _ => false,
        }
    }

    fn query_status(&self, task_id: &str) -> Result<WireTask, Status> {
        self.tasks
            .get(task_id)
            .map(|handle| to_wire(&handle.snapshot()))
            .ok_or_else(|| Status::new(StatusCode::NotFound, format!("unknown task: {task_id}")))
    }

    fn listen_results(&self, client_id: &str, sink: StreamSink) -> Result<(), Status> {
        if client_id.is_empty() {
            return Err(Status::new(StatusCode::Internal, "client_id is required"));
        }
        self.hub.subscribe(client_id, sink);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::{register_builtins, FunctionRegistry};
    use dts_core::{Resource, Task};
    use dts_runtime::{TimerService, WorkPool};
    use serde_json::json;
    use std::time::{Duration, Instant};

    fn service() -> (DispatchService, Arc<TimerService>) {
        let pool = Arc::new(WorkPool::new(2, 64));
        let timers = Arc::new(TimerService::new());
        let mut registry = FunctionRegistry::new();
        register_builtins(&mut registry);
        let hub = Arc::new(ResultHub::new());
        let mut executor = TaskExecutor::new(
            pool,
            timers.clone(),
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
        (DispatchService::new(Arc::new(executor), hub), timers)
    }

    fn wire_task(task_id: &str) -> WireTask {
        to_wire(&Task {
            task_id: task_id.into(),
            client_id: "client-001".into(),
            func_name: "fib".into(),
            func_params: json!({"n": 10}),
            required: Resource {
                cpu_core: 1.0,
                mem_mb: 512,
            },
            ..Task::default()
        })
    }

    #[test]
    fn submit_stamps_and_schedules() {
        let (service, timers) = service();
        let accepted = service.submit_task(wire_task("d-1")).unwrap();
        assert!(accepted.submit_ts >= 0);
        assert_eq!(service.task_count(), 1);

        let end = Instant::now() + Duration::from_secs(5);
        loop {
            let snap = service.query_status("d-1").unwrap();
            if TaskState::from_u8(snap.state).unwrap().is_terminal() {
                assert_eq!(snap.state, TaskState::Success as u8);
                break;
            }
            assert!(Instant::now() < end, "task never finished");
            std::thread::sleep(Duration::from_millis(5));
        }
        timers.shutdown();
    }

    #[test]
    fn submit_without_id_is_rejected() {
        let (service, timers) = service();
        let mut wire = wire_task("x");
        wire.task_id.clear();
        let status = service.submit_task(wire).unwrap_err();
        assert_eq!(status.code, StatusCode::Internal);
        timers.shutdown();
    }

    #[test]
    fn cancel_unknown_task_is_false() {
        let (service, timers) = service();
        assert!(!service.cancel_task("missing"));
        timers.shutdown();
    }

    #[test]
    fn query_unknown_task_is_not_found() {
        let (service, timers) = service();
        let status = service.query_status("missing").unwrap_err();
        assert_eq!(status.code, StatusCode::NotFound);
        timers.shutdown();
    }
}
