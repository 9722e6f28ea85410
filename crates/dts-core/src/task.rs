//! The task model — the unit of work and its shared attempt state.
//!
//! A [`Task`] is a plain snapshot: what crosses the wire and what tests
//! assert on. A [`TaskRecord`] is the live, shared form of the same record:
//! the executor, the deadline timer, and the handler body all hold the same
//! `Arc<TaskRecord>` while an attempt runs. The cancellation flag on the
//! record is the only cross-thread mutable channel into a running handler.

use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ── State ─────────────────────────────────────────────────────────────────────

/// Lifecycle state of a task.
///
/// Discriminants are the wire encoding and must not change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskState {
    Pending = 0,
    Running = 1,
    Success = 2,
    Failed = 3,
    Timeout = 4,
    Cancelled = 5,
}

impl TaskState {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Pending),
            1 => Some(Self::Running),
            2 => Some(Self::Success),
            3 => Some(Self::Failed),
            4 => Some(Self::Timeout),
            5 => Some(Self::Cancelled),
            _ => None,
        }
    }

    /// Terminal states may only be left through the retry path.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failed | Self::Timeout | Self::Cancelled
        )
    }
}

// ── Intent ────────────────────────────────────────────────────────────────────

/// Resources a task needs admitted before it may run.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Resource {
    /// CPU cores, fractional allowed.
    pub cpu_core: f64,
    /// Memory in MB.
    pub mem_mb: u64,
}

impl Default for Resource {
    fn default() -> Self {
        Self {
            cpu_core: 0.0,
            mem_mb: 0,
        }
    }
}

/// Shard ordinal within a sharded submission. Advisory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    pub shard_id: u32,
    pub total_shards: u32,
}

impl Default for Shard {
    fn default() -> Self {
        Self {
            shard_id: 0,
            total_shards: 1,
        }
    }
}

// ── Task snapshot ─────────────────────────────────────────────────────────────

/// A full task record: identity, intent, policy, timestamps, state, outcome.
///
/// The in-memory cancellation flag lives on [`TaskRecord`], not here — it is
/// deliberately not part of the wire-visible field set.
#[derive(Debug, Clone, PartialEq)]
pub struct Task {
    pub task_id: String,
    pub client_id: String,
    pub priority: u32,
    pub state: TaskState,
    pub func_name: String,
    pub func_params: Value,
    pub required: Resource,
    pub shard: Shard,
    /// Wall-clock budget in ms, measured from `submit_ts`.
    pub timeout_ms: u32,
    pub max_retry: u32,
    pub retry_count: u32,
    pub submit_ts: i64,
    pub start_ts: i64,
    pub finish_ts: i64,
    pub result: Value,
    pub error_msg: String,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            task_id: String::new(),
            client_id: String::new(),
            priority: 0,
            state: TaskState::Pending,
            func_name: String::new(),
            func_params: Value::Null,
            required: Resource::default(),
            shard: Shard::default(),
            timeout_ms: 30_000,
            max_retry: 3,
            retry_count: 0,
            submit_ts: 0,
            start_ts: 0,
            finish_ts: 0,
            result: Value::Null,
            error_msg: String::new(),
        }
    }
}

// ── Shared attempt state ──────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct Outcome {
    result: Value,
    error_msg: String,
}

/// Shared by every observer of a task attempt.
pub type TaskHandle = Arc<TaskRecord>;

/// The live form of a [`Task`].
///
/// Intent fields are immutable after construction. Attempt state is guarded:
/// terminal transitions go through [`TaskRecord::try_finish`], which refuses
/// to overwrite a terminal state, so the deadline timer and the handler
/// completion path can race and the first writer wins.
#[derive(Debug)]
pub struct TaskRecord {
    pub task_id: String,
    pub client_id: String,
    pub priority: u32,
    pub func_name: String,
    pub func_params: Value,
    pub required: Resource,
    pub shard: Shard,
    pub timeout_ms: u32,
    pub max_retry: u32,
    pub submit_ts: i64,

    state: AtomicU8,
    retry_count: AtomicU32,
    start_ts: AtomicI64,
    finish_ts: AtomicI64,
    outcome: Mutex<Outcome>,

    /// Monotonic: false → true, never cleared. Published with release by the
    /// mutator (deadline timer, CancelTask) and observed with acquire inside
    /// handler loops.
    cancelled: AtomicBool,
}

impl TaskRecord {
    pub fn from_task(task: Task) -> Self {
        Self {
            task_id: task.task_id,
            client_id: task.client_id,
            priority: task.priority,
            func_name: task.func_name,
            func_params: task.func_params,
            required: task.required,
            shard: task.shard,
            timeout_ms: task.timeout_ms,
            max_retry: task.max_retry,
            submit_ts: task.submit_ts,
            state: AtomicU8::new(task.state as u8),
            retry_count: AtomicU32::new(task.retry_count),
            start_ts: AtomicI64::new(task.start_ts),
            finish_ts: AtomicI64::new(task.finish_ts),
            outcome: Mutex::new(Outcome {
                result: task.result,
                error_msg: task.error_msg,
            }),
            cancelled: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> TaskState {
        // The stored value only ever comes from a TaskState.
        TaskState::from_u8(self.state.load(Ordering::Acquire)).unwrap_or(TaskState::Failed)
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count.load(Ordering::Acquire)
    }

    pub fn start_ts(&self) -> i64 {
        self.start_ts.load(Ordering::Acquire)
    }

    pub fn finish_ts(&self) -> i64 {
        self.finish_ts.load(Ordering::Acquire)
    }

    /// Request cooperative cancellation. Never un-done.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Polled by handler bodies at loop boundaries.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Mark the attempt started: Pending → Running with `start_ts = now`.
    /// Returns false if the task is no longer Pending (e.g. already timed out).
    pub fn begin_attempt(&self, now: i64) -> bool {
        let _guard = self.outcome.lock().unwrap();
        if self
            .state
            .compare_exchange(
                TaskState::Pending as u8,
                TaskState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }
        self.start_ts.store(now, Ordering::Release);
        true
    }

    /// Guarded terminal transition: first writer wins.
    ///
    /// Refuses when the task is already in a terminal state; otherwise stores
    /// the outcome, stamps `finish_ts`, and publishes the new state.
    pub fn try_finish(&self, state: TaskState, result: Value, error_msg: &str, now: i64) -> bool {
        debug_assert!(state.is_terminal());
        let mut outcome = self.outcome.lock().unwrap();
        if self.state().is_terminal() {
            return false;
        }
        outcome.result = result;
        outcome.error_msg = error_msg.to_string();
        self.finish_ts.store(now, Ordering::Release);
        self.state.store(state as u8, Ordering::Release);
        true
    }

    /// Park a Running attempt back to Pending ahead of a retry attempt.
    /// Fails if a terminal transition (deadline, cancel) won in the meantime.
    pub fn rearm_for_retry(&self) -> bool {
        let _guard = self.outcome.lock().unwrap();
        let swapped = self
            .state
            .compare_exchange(
                TaskState::Running as u8,
                TaskState::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok();
        if swapped {
            self.start_ts.store(0, Ordering::Release);
        }
        swapped
    }

    /// Count the retry that is about to run. The caller keeps
    /// `retry_count <= max_retry` by checking before scheduling.
    pub fn bump_retry(&self) -> u32 {
        self.retry_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Consistent snapshot of the whole record.
    pub fn snapshot(&self) -> Task {
        let outcome = self.outcome.lock().unwrap();
        Task {
            task_id: self.task_id.clone(),
            client_id: self.client_id.clone(),
            priority: self.priority,
            state: self.state(),
            func_name: self.func_name.clone(),
            func_params: self.func_params.clone(),
            required: self.required,
            shard: self.shard,
            timeout_ms: self.timeout_ms,
            max_retry: self.max_retry,
            retry_count: self.retry_count.load(Ordering::Acquire),
            submit_ts: self.submit_ts,
            start_ts: self.start_ts.load(Ordering::Acquire),
            finish_ts: self.finish_ts.load(Ordering::Acquire),
            result: outcome.result.clone(),
            error_msg: outcome.error_msg.clone(),
        }
    }
}
