//! Function registry — the in-process mapping from names to handlers.
//!
//! Populated before the executor accepts traffic and read-only afterwards.
//! Handlers receive the task's params plus the shared task handle so they
//! can poll the cancellation flag at loop boundaries.

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::{json, Value};

use dts_core::{TaskError, TaskHandle};

pub type TaskFn = Arc<dyn Fn(&Value, &TaskHandle) -> Result<Value, TaskError> + Send + Sync>;

#[derive(Default)]
pub struct FunctionRegistry {
    functions: HashMap<String, TaskFn>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install a handler. Last registration for a name wins.
    pub fn register<F>(&mut self, name: impl Into<String>, handler: F)
    where
        F: Fn(&Value, &TaskHandle) -> Result<Value, TaskError> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(handler));
    }

    pub fn get(&self, name: &str) -> Option<TaskFn> {
        self.functions.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.functions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// Built-in handlers every worker ships with.
pub fn register_builtins(registry: &mut FunctionRegistry) {
    registry.register("fib", |params, task| {
        let n = params.get("n").and_then(Value::as_i64).unwrap_or(0);
        if n < 0 {
            return Err(TaskError::invariant("Negative input for fib"));
        }
        if n <= 1 {
            return Ok(json!({ "result": n }));
        }
        let (mut a, mut b) = (0i64, 1i64);
        for _ in 2..=n {
            if task.is_cancelled() {
                return Ok(json!({ "result": "cancelled" }));
            }
            let c = a + b;
            a = b;
            b = c;
        }
        Ok(json!({ "result": b }))
    });
}
