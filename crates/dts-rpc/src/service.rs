//! Service trait — the seam between the completion engine and the daemon.
//!
//! The engine owns transport, contexts, and queues; a [`TaskService`]
//! implementation owns the semantics of the four RPCs. Handlers run on the
//! driver thread that dispatched the call, so they should hand heavy work
//! off (the daemon's implementation enqueues on the work pool and returns).

use dts_core::codec::WireTask;
use dts_core::wire::Status;

use crate::server::StreamSink;

pub trait TaskService: Send + Sync + 'static {
    /// Accept a task for execution and return the accepted record.
    fn submit_task(&self, task: WireTask) -> Result<WireTask, Status>;

    /// Request cooperative cancellation. `false` when the task is unknown or
    /// already terminal.
    fn cancel_task(&self, task_id: &str) -> bool;

    /// Current record for a task.
    fn query_status(&self, task_id: &str) -> Result<WireTask, Status>;

    /// Subscribe `client_id` to terminal results. The sink stays valid until
    /// the stream call ends; send failures mean the subscriber is gone.
    fn listen_results(&self, client_id: &str, sink: StreamSink) -> Result<(), Status>;
}
