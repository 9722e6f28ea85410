//! JSON payload bodies carried inside frames.
//!
//! The frame header routes and correlates; these bodies are the schema.
//! `SubmitTask` requests and `QueryStatus` responses carry a bare
//! [`WireTask`](dts_core::codec::WireTask) and need no envelope here.

use serde::{Deserialize, Serialize};

use dts_core::codec::WireTask;

/// `SubmitTask` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    pub task: WireTask,
}

/// `CancelTask` / `QueryStatus` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskIdRequest {
    pub task_id: String,
}

/// `CancelTask` response body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub success: bool,
}

/// `ListenResults` request body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscribeRequest {
    pub client_id: String,
}

/// Body of any non-OK unary response.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ErrorBody {
    pub message: String,
}
