//! RPC client façade.
//!
//! One TCP connection, one private tokio runtime for the socket, and one
//! dedicated pump thread draining the client completion queue with a bounded
//! wait so shutdown is observed. Each outstanding call owns a tag record
//! with its own step marker and a one-shot delivery slot; delivery happens
//! exactly once even when an optional per-call callback is also installed.
//!
//! Unary machine: Launch —write ok→ Finish —response→ deliver once; a
//! failed write forces Finish with an Internal status. Stream machine
//! (`listen_results`): Start —write ok→ Read; each data frame emits one
//! callback and stays in Read; the empty end-of-stream frame finishes with
//! the trailer status; a transport failure finishes with Cancelled. The
//! terminal callback fires exactly once, and only for non-OK status.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio::sync::mpsc;

use dts_core::codec::{from_wire, to_wire};
use dts_core::wire::{FrameHeader, MsgType, Status, StatusCode, FLAG_EOS};
use dts_core::Task;
use dts_runtime::{oneshot, OneshotReceiver, OneshotSender};

use crate::completion::{CompletionQueue, Next};
use crate::frame;
use crate::messages::{CancelResponse, ErrorBody, SubscribeRequest, TaskEnvelope, TaskIdRequest};

const PUMP_WAIT: Duration = Duration::from_secs(1);

/// Fired with each streamed task (OK status) and exactly once at a non-OK
/// terminal state.
pub type ResultCallback = Arc<dyn Fn(Task, Status) + Send + Sync + 'static>;

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum RpcError {
    /// The server (or the completion layer) produced a non-OK status.
    #[error("{0}")]
    Status(Status),
    /// Connection-level failure before a status existed.
    #[error("transport failure: {0}")]
    Transport(String),
    /// The client was shut down while the call was outstanding.
    #[error("client shut down")]
    ShuttingDown,
}

impl RpcError {
    pub fn status_code(&self) -> Option<StatusCode> {
        match self {
            Self::Status(status) => Some(status.code),
            _ => None,
        }
    }
}

// ── Events ────────────────────────────────────────────────────────────────────

struct ClientCompletion {
    call_id: u64,
    ok: bool,
    event: ClientEvent,
}

enum ClientEvent {
    /// The request frame finished writing.
    Launched,
    /// A response or stream frame arrived.
    Frame {
        status: StatusCode,
        eos: bool,
        payload: Bytes,
    },
    /// The connection died; fail every outstanding call.
    ConnClosed,
}

type ClientCq = CompletionQueue<ClientCompletion>;

struct ClientOutbound {
    header: FrameHeader,
    payload: Bytes,
    call_id: u64,
}

// ── Tags ──────────────────────────────────────────────────────────────────────

enum TagStep {
    Launch,
    Finish,
    Read,
}

enum TagKind {
    Submit {
        slot: Option<OneshotSender<Result<Task, RpcError>>>,
        callback: Option<ResultCallback>,
    },
    Cancel {
        slot: Option<OneshotSender<Result<bool, RpcError>>>,
    },
    Query {
        slot: Option<OneshotSender<Result<Task, RpcError>>>,
    },
    Listen {
        callback: ResultCallback,
    },
}

struct CallTag {
    step: TagStep,
    delivered: bool,
    kind: TagKind,
}

// ── Client ────────────────────────────────────────────────────────────────────

pub struct DtsClient {
    conn_tx: mpsc::UnboundedSender<ClientOutbound>,
    cq: Arc<ClientCq>,
    tags: Arc<Mutex<HashMap<u64, CallTag>>>,
    next_call: AtomicU64,
    conn_alive: Arc<AtomicBool>,
    pump: Option<std::thread::JoinHandle<()>>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl DtsClient {
    /// Connect to a dts server. Must be called from outside any async
    /// runtime — the client owns its own.
    pub fn connect(addr: SocketAddr) -> Result<Self, RpcError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(1)
            .thread_name("dts-client-io")
            .enable_all()
            .build()
            .map_err(|e| RpcError::Transport(e.to_string()))?;

        let stream = runtime
            .block_on(TcpStream::connect(addr))
            .map_err(|e| RpcError::Transport(e.to_string()))?;
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let cq: Arc<ClientCq> = Arc::new(CompletionQueue::new());
        let tags: Arc<Mutex<HashMap<u64, CallTag>>> = Arc::new(Mutex::new(HashMap::new()));
        let conn_alive = Arc::new(AtomicBool::new(true));

        let (conn_tx, mut conn_rx) = mpsc::unbounded_channel::<ClientOutbound>();

        // Writer: posts a Launched completion per written frame.
        {
            let cq = cq.clone();
            let conn_alive = conn_alive.clone();
            runtime.spawn(async move {
                let mut broken = false;
                while let Some(outbound) = conn_rx.recv().await {
                    let ok = if broken {
                        false
                    } else {
                        match frame::write_frame(&mut write_half, &outbound.header, &outbound.payload)
                            .await
                        {
                            Ok(()) => true,
                            Err(error) => {
                                tracing::debug!(%error, "client write failed");
                                conn_alive.store(false, Ordering::Release);
                                broken = true;
                                false
                            }
                        }
                    };
                    cq.post(ClientCompletion {
                        call_id: outbound.call_id,
                        ok,
                        event: ClientEvent::Launched,
                    });
                }
            });
        }

        // Reader: turns every inbound frame into a completion event.
        {
            let cq = cq.clone();
            let conn_alive = conn_alive.clone();
            runtime.spawn(async move {
                loop {
                    match frame::read_frame(&mut read_half).await {
                        Ok((header, payload)) => {
                            let status = StatusCode::from_u8(header.status)
                                .unwrap_or(StatusCode::Internal);
                            let eos = header.flags & FLAG_EOS != 0;
                            cq.post(ClientCompletion {
                                call_id: header.call_id,
                                ok: true,
                                event: ClientEvent::Frame {
                                    status,
                                    eos,
                                    payload,
                                },
                            });
                        }
                        Err(error) => {
                            tracing::debug!(%error, "client connection closed");
                            conn_alive.store(false, Ordering::Release);
                            cq.post(ClientCompletion {
                                call_id: 0,
                                ok: false,
                                event: ClientEvent::ConnClosed,
                            });
                            break;
                        }
                    }
                }
            });
        }

        // Pump: the single thread that drives every tag state machine.
        let pump = {
            let cq = cq.clone();
            let tags = tags.clone();
            std::thread::Builder::new()
                .name("dts-client-cq".into())
                .spawn(move || loop {
                    match cq.next_timeout(PUMP_WAIT) {
                        Next::Event(completion) => drive_tag(&tags, completion),
                        Next::Timeout => continue,
                        Next::Shutdown => break,
                    }
                })
                .map_err(|e| RpcError::Transport(e.to_string()))?
        };

        Ok(Self {
            conn_tx,
            cq,
            tags,
            next_call: AtomicU64::new(1),
            conn_alive,
            pump: Some(pump),
            runtime: Some(runtime),
        })
    }

    // ── Call shapes ───────────────────────────────────────────────────────────

    /// Submit a task; the returned slot resolves once with the accepted
    /// record. The optional callback fires exactly once at terminal state
    /// even if the slot is discarded.
    pub fn submit_task_async(
        &self,
        task: &Task,
        callback: Option<ResultCallback>,
    ) -> OneshotReceiver<Result<Task, RpcError>> {
        let (tx, rx) = oneshot();
        let payload = serde_json::to_vec(&to_wire(task)).expect("task serialization failed");
        self.start_call(
            MsgType::SubmitTask,
            Bytes::from(payload),
            CallTag {
                step: TagStep::Launch,
                delivered: false,
                kind: TagKind::Submit {
                    slot: Some(tx),
                    callback,
                },
            },
        );
        rx
    }

    /// Blocking form of [`submit_task_async`](Self::submit_task_async).
    pub fn submit_task(&self, task: &Task) -> Result<Task, RpcError> {
        self.submit_task_async(task, None)
            .recv()
            .unwrap_or(Err(RpcError::ShuttingDown))
    }

    /// Request cooperative cancellation of `task_id`.
    pub fn cancel_task_async(&self, task_id: &str) -> OneshotReceiver<Result<bool, RpcError>> {
        let (tx, rx) = oneshot();
        let payload = serde_json::to_vec(&TaskIdRequest {
            task_id: task_id.to_string(),
        })
        .expect("cancel request serialization failed");
        self.start_call(
            MsgType::CancelTask,
            Bytes::from(payload),
            CallTag {
                step: TagStep::Launch,
                delivered: false,
                kind: TagKind::Cancel { slot: Some(tx) },
            },
        );
        rx
    }

    pub fn cancel_task(&self, task_id: &str) -> Result<bool, RpcError> {
        self.cancel_task_async(task_id)
            .recv()
            .unwrap_or(Err(RpcError::ShuttingDown))
    }

    /// Fetch the current record for `task_id`.
    pub fn query_status_async(&self, task_id: &str) -> OneshotReceiver<Result<Task, RpcError>> {
        let (tx, rx) = oneshot();
        let payload = serde_json::to_vec(&TaskIdRequest {
            task_id: task_id.to_string(),
        })
        .expect("query request serialization failed");
        self.start_call(
            MsgType::QueryStatus,
            Bytes::from(payload),
            CallTag {
                step: TagStep::Launch,
                delivered: false,
                kind: TagKind::Query { slot: Some(tx) },
            },
        );
        rx
    }

    pub fn query_status(&self, task_id: &str) -> Result<Task, RpcError> {
        self.query_status_async(task_id)
            .recv()
            .unwrap_or(Err(RpcError::ShuttingDown))
    }

    /// Subscribe to terminal results for `client_id`. `callback` runs on the
    /// pump thread: once per streamed task with an OK status, then exactly
    /// once with the non-OK terminal status if the stream ends abnormally.
    pub fn listen_results(&self, client_id: &str, callback: ResultCallback) {
        let payload = serde_json::to_vec(&SubscribeRequest {
            client_id: client_id.to_string(),
        })
        .expect("subscribe request serialization failed");
        self.start_call(
            MsgType::ListenResults,
            Bytes::from(payload),
            CallTag {
                step: TagStep::Launch,
                delivered: false,
                kind: TagKind::Listen { callback },
            },
        );
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn start_call(&self, op: MsgType, payload: Bytes, tag: CallTag) {
        let call_id = self.next_call.fetch_add(1, Ordering::Relaxed);
        self.tags.lock().unwrap().insert(call_id, tag);

        if !self.conn_alive.load(Ordering::Acquire) {
            self.cq.post(ClientCompletion {
                call_id,
                ok: false,
                event: ClientEvent::Launched,
            });
            return;
        }

        let header = FrameHeader::request(op, call_id, payload.len() as u32);
        if self
            .conn_tx
            .send(ClientOutbound {
                header,
                payload,
                call_id,
            })
            .is_err()
        {
            self.cq.post(ClientCompletion {
                call_id,
                ok: false,
                event: ClientEvent::Launched,
            });
        }
    }

    /// Stop the pump and the transport. Outstanding calls resolve as
    /// [`RpcError::ShuttingDown`] through their dropped slots.
    pub fn shutdown(&mut self) {
        self.cq.shutdown();
        if let Some(pump) = self.pump.take() {
            let _ = pump.join();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
        self.tags.lock().unwrap().clear();
    }
}

impl Drop for DtsClient {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Tag state machine ─────────────────────────────────────────────────────────

fn drive_tag(tags: &Arc<Mutex<HashMap<u64, CallTag>>>, completion: ClientCompletion) {
    let ClientCompletion { call_id, ok, event } = completion;
    let mut tags = tags.lock().unwrap();

    if matches!(event, ClientEvent::ConnClosed) {
        // Fail everything outstanding, exactly once each.
        for (_, mut tag) in tags.drain() {
            let status = broken_status(&tag);
            deliver_error(&mut tag, status);
        }
        return;
    }

    let Some(tag) = tags.get_mut(&call_id) else {
        // Stale completion for an already-delivered call.
        return;
    };

    let finished = if matches!(tag.kind, TagKind::Listen { .. }) {
        drive_listen(tag, ok, event)
    } else if !ok {
        // A failed completion forces Finish with an Internal status.
        deliver_error(
            tag,
            Status::new(StatusCode::Internal, "completion queue failure"),
        );
        true
    } else {
        drive_unary(tag, event)
    };

    if finished {
        tags.remove(&call_id);
    }
}

/// Returns true when the tag reached its terminal step.
fn drive_unary(tag: &mut CallTag, event: ClientEvent) -> bool {
    match event {
        ClientEvent::Launched => {
            if matches!(tag.step, TagStep::Launch) {
                tag.step = TagStep::Finish;
            }
            false
        }
        ClientEvent::Frame {
            status, payload, ..
        } => {
            // A response can overtake the writer's Launched completion;
            // accept it from either step.
            if status != StatusCode::Ok {
                let message = parse_error_message(&payload);
                deliver_error(tag, Status::new(status, message));
                return true;
            }

            enum Parsed {
                Task(Task),
                Flag(bool),
                Fail(String),
            }

            let parsed = match &tag.kind {
                TagKind::Submit { .. } => serde_json::from_slice::<TaskEnvelope>(&payload)
                    .map_err(|e| e.to_string())
                    .and_then(|envelope| from_wire(envelope.task).map_err(|e| e.to_string()))
                    .map_or_else(Parsed::Fail, Parsed::Task),
                TagKind::Query { .. } => serde_json::from_slice(&payload)
                    .map_err(|e| e.to_string())
                    .and_then(|wire| from_wire(wire).map_err(|e| e.to_string()))
                    .map_or_else(Parsed::Fail, Parsed::Task),
                TagKind::Cancel { .. } => serde_json::from_slice::<CancelResponse>(&payload)
                    .map(|r| r.success)
                    .map_err(|e| e.to_string())
                    .map_or_else(Parsed::Fail, Parsed::Flag),
                TagKind::Listen { .. } => unreachable!("listen tags use drive_listen"),
            };

            match parsed {
                Parsed::Task(task) => deliver_task(tag, task),
                Parsed::Flag(flag) => deliver_flag(tag, flag),
                Parsed::Fail(error) => deliver_error(
                    tag,
                    Status::new(StatusCode::Internal, format!("bad response: {error}")),
                ),
            }
            true
        }
        ClientEvent::ConnClosed => unreachable!("handled before tag lookup"),
    }
}

fn deliver_flag(tag: &mut CallTag, flag: bool) {
    if tag.delivered {
        return;
    }
    tag.delivered = true;
    if let TagKind::Cancel { slot } = &mut tag.kind {
        if let Some(slot) = slot.take() {
            let _ = slot.send(Ok(flag));
        }
    }
}

/// Returns true when the stream reached Done.
fn drive_listen(tag: &mut CallTag, ok: bool, event: ClientEvent) -> bool {
    let TagKind::Listen { callback } = &tag.kind else {
        return true;
    };
    let callback = callback.clone();

    if !ok {
        // Transport failure at any step cancels the stream.
        deliver_stream_terminal(tag, Status::new(StatusCode::Cancelled, "stream aborted"));
        return true;
    }

    match event {
        ClientEvent::Launched => {
            if matches!(tag.step, TagStep::Launch) {
                tag.step = TagStep::Read;
            }
            false
        }
        ClientEvent::Frame {
            status,
            eos,
            payload,
        } => {
            if eos || payload.is_empty() {
                // Server end-of-stream: finish with the trailer status.
                let status = Status::new(status, if status == StatusCode::Ok { "" } else { "stream aborted" });
                deliver_stream_terminal(tag, status);
                return true;
            }
            match serde_json::from_slice(&payload)
                .map_err(|e| e.to_string())
                .and_then(|wire| from_wire(wire).map_err(|e| e.to_string()))
            {
                Ok(task) => {
                    callback(task, Status::ok());
                    tag.step = TagStep::Read;
                    false
                }
                Err(error) => {
                    tracing::warn!(%error, "dropping malformed stream frame");
                    false
                }
            }
        }
        ClientEvent::ConnClosed => unreachable!("handled before tag lookup"),
    }
}

// ── Delivery (exactly once) ───────────────────────────────────────────────────

fn deliver_task(tag: &mut CallTag, task: Task) {
    if tag.delivered {
        return;
    }
    tag.delivered = true;
    match &mut tag.kind {
        TagKind::Submit { slot, callback } => {
            if let Some(callback) = callback.take() {
                callback(task.clone(), Status::ok());
            }
            if let Some(slot) = slot.take() {
                let _ = slot.send(Ok(task));
            }
        }
        TagKind::Query { slot } => {
            if let Some(slot) = slot.take() {
                let _ = slot.send(Ok(task));
            }
        }
        _ => {}
    }
}

fn deliver_error(tag: &mut CallTag, status: Status) {
    if tag.delivered {
        return;
    }
    tag.delivered = true;
    match &mut tag.kind {
        TagKind::Submit { slot, callback } => {
            if let Some(callback) = callback.take() {
                callback(Task::default(), status.clone());
            }
            if let Some(slot) = slot.take() {
                let _ = slot.send(Err(RpcError::Status(status)));
            }
        }
        TagKind::Cancel { slot } => {
            if let Some(slot) = slot.take() {
                let _ = slot.send(Err(RpcError::Status(status)));
            }
        }
        TagKind::Query { slot } => {
            if let Some(slot) = slot.take() {
                let _ = slot.send(Err(RpcError::Status(status)));
            }
        }
        TagKind::Listen { callback } => {
            if !status.is_ok() {
                callback(Task::default(), status);
            }
        }
    }
}

fn deliver_stream_terminal(tag: &mut CallTag, status: Status) {
    deliver_error(tag, status);
}

fn broken_status(tag: &CallTag) -> Status {
    match tag.kind {
        TagKind::Listen { .. } => Status::new(StatusCode::Cancelled, "stream aborted"),
        _ => Status::new(StatusCode::Internal, "connection closed"),
    }
}

fn parse_error_message(payload: &[u8]) -> String {
    serde_json::from_slice::<ErrorBody>(payload)
        .map(|body| body.message)
        .unwrap_or_default()
}
