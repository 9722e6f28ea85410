//! Bidirectional conversion between [`Task`] and its wire form.
//!
//! [`WireTask`] is the JSON payload schema for every frame that carries a
//! task. Missing top-level fields are a hard deserialization error; unknown
//! keys inside the nested structured values pass through untouched. The
//! in-memory cancellation flag is deliberately absent from the wire.

use serde::{Deserialize, Serialize};

use crate::task::{Resource, Shard, Task, TaskState};
use crate::value::WireValue;

/// Wire-visible fields of a task. `state` travels as its raw discriminant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WireTask {
    pub task_id: String,
    pub client_id: String,
    pub priority: u32,
    pub state: u8,
    pub func_name: String,
    pub func_params: WireValue,
    pub required: Resource,
    pub shard: Shard,
    pub timeout_ms: u32,
    pub max_retry: u32,
    pub retry_count: u32,
    pub submit_ts: i64,
    pub start_ts: i64,
    pub finish_ts: i64,
    pub result: WireValue,
    pub error_msg: String,
}

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("invalid task state discriminant {0}")]
    InvalidState(u8),
}

/// Copy every wire-visible field into the wire form.
pub fn to_wire(task: &Task) -> WireTask {
    WireTask {
        task_id: task.task_id.clone(),
        client_id: task.client_id.clone(),
        priority: task.priority,
        state: task.state as u8,
        func_name: task.func_name.clone(),
        func_params: WireValue::from(&task.func_params),
        required: task.required,
        shard: task.shard,
        timeout_ms: task.timeout_ms,
        max_retry: task.max_retry,
        retry_count: task.retry_count,
        submit_ts: task.submit_ts,
        start_ts: task.start_ts,
        finish_ts: task.finish_ts,
        result: WireValue::from(&task.result),
        error_msg: task.error_msg.clone(),
    }
}

/// The inverse of [`to_wire`]. Rejects unknown state discriminants.
pub fn from_wire(wire: WireTask) -> Result<Task, CodecError> {
    let state = TaskState::from_u8(wire.state).ok_or(CodecError::InvalidState(wire.state))?;
    Ok(Task {
        task_id: wire.task_id,
        client_id: wire.client_id,
        priority: wire.priority,
        state,
        func_name: wire.func_name,
        func_params: wire.func_params.into(),
        required: wire.required,
        shard: wire.shard,
        timeout_ms: wire.timeout_ms,
        max_retry: wire.max_retry,
        retry_count: wire.retry_count,
        submit_ts: wire.submit_ts,
        start_ts: wire.start_ts,
        finish_ts: wire.finish_ts,
        result: wire.result.into(),
        error_msg: wire.error_msg,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::time::now_ms;
    use serde_json::json;

    fn sample() -> Task {
        Task {
            task_id: "uuid-1234".into(),
            client_id: "client-001".into(),
            priority: 5,
            state: TaskState::Pending,
            func_name: "fib".into(),
            func_params: json!({"n": 10, "extra": "test"}),
            required: Resource {
                cpu_core: 2.5,
                mem_mb: 1024,
            },
            shard: Shard {
                shard_id: 0,
                total_shards: 1,
            },
            timeout_ms: 30_000,
            max_retry: 3,
            retry_count: 0,
            submit_ts: now_ms(),
            start_ts: 0,
            finish_ts: 0,
            result: json!({"output": 55}),
            error_msg: String::new(),
        }
    }

    #[test]
    fn round_trip_preserves_every_wire_field() {
        let task = sample();
        let encoded = serde_json::to_string(&to_wire(&task)).unwrap();
        let decoded: WireTask = serde_json::from_str(&encoded).unwrap();
        assert_eq!(from_wire(decoded).unwrap(), task);
    }

    #[test]
    fn missing_required_field_is_a_hard_error() {
        let mut json_task = serde_json::to_value(to_wire(&sample())).unwrap();
        json_task.as_object_mut().unwrap().remove("task_id");
        assert!(serde_json::from_value::<WireTask>(json_task).is_err());
    }

    #[test]
    fn complex_func_params_survive() {
        let mut task = sample();
        task.func_params = json!({
            "n": 10,
            "config": {"key1": "value1", "key2": 42}
        });
        let decoded = from_wire(to_wire(&task)).unwrap();
        assert_eq!(decoded.func_params["n"], 10);
        assert_eq!(decoded.func_params["config"]["key1"], "value1");
        assert_eq!(decoded.func_params["config"]["key2"], 42);
    }

    #[test]
    fn bad_state_discriminant_rejected() {
        let mut wire = to_wire(&sample());
        wire.state = 42;
        assert!(matches!(from_wire(wire), Err(CodecError::InvalidState(42))));
    }

    #[test]
    fn every_state_round_trips() {
        for state in [
            TaskState::Pending,
            TaskState::Running,
            TaskState::Success,
            TaskState::Failed,
            TaskState::Timeout,
            TaskState::Cancelled,
        ] {
            let mut task = sample();
            task.state = state;
            assert_eq!(from_wire(to_wire(&task)).unwrap().state, state);
        }
    }
}
