//! Result hub — fans terminal task results out to stream subscribers.
//!
//! `ListenResults` calls register a sink under the submitting client's id;
//! the executor's terminal sink publishes every finished task here. Dead
//! sinks (stream ended, connection gone) are pruned on the way through.

use dashmap::DashMap;

use dts_core::codec::to_wire;
use dts_core::wire::StatusCode;
use dts_core::Task;
use dts_rpc::StreamSink;

#[derive(Default)]
pub struct ResultHub {
    listeners: DashMap<String, Vec<StreamSink>>,
}

impl ResultHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach a subscriber for `client_id`.
    pub fn subscribe(&self, client_id: &str, sink: StreamSink) {
        self.listeners
            .entry(client_id.to_string())
            .or_default()
            .push(sink);
        tracing::debug!(client_id, "result listener subscribed");
    }

    /// Deliver a terminal task to every live subscriber of its client.
    pub fn publish(&self, task: &Task) {
        let Some(mut sinks) = self.listeners.get_mut(&task.client_id) else {
            return;
        };
        let wire = to_wire(task);
        sinks.retain(|sink| sink.is_alive() && sink.send(wire.clone()));
    }

    /// End every stream, e.g. at daemon shutdown.
    pub fn close_all(&self) {
        for mut entry in self.listeners.iter_mut() {
            for sink in entry.value() {
                sink.close(StatusCode::Ok);
            }
            entry.value_mut().clear();
        }
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.iter().map(|entry| entry.value().len()).sum()
    }
}
