//! The async RPC server — completion queues, driver threads, and per-call
//! state machines.
//!
//! Shape: a tokio transport layer (accept loop, per-connection reader and
//! writer tasks) feeds completion events into N [`CompletionQueue`]s, one
//! driver thread each. Per-call contexts are tagged entries in the owning
//! queue's context map; every event re-enters the state machine bound to its
//! tag. A fixed number of contexts per queue is pre-armed at startup so a
//! burst of requests never finds the queue without a listener, and a
//! finishing context always arms its replacement before its own entry is
//! reclaimed.
//!
//! Unary machine: Create —request→ run handler, send response → Finish
//! —sent→ destroy + re-arm. Stream machine (`ListenResults`): Create
//! —subscribe→ Streaming —sink items→ one data frame per item, writes
//! serialized through the context → sink close → EOS trailer → Finish
//! —sent→ destroy + re-arm. A failed completion (`ok == false`) destroys
//! the context; outside shutdown a replacement is armed so capacity does
//! not decay.
//!
//! Shutdown: flag → stop the accept loop → shut every queue down → drivers
//! drain remaining events (running destructors) and exit → join → stop the
//! transport runtime.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use dts_core::codec::WireTask;
use dts_core::config::DtsConfig;
use dts_core::wire::{FrameHeader, MsgType, Status, StatusCode, FLAG_EOS, RESPONSE_BIT};

use crate::completion::{CompletionQueue, Next};
use crate::frame::{self, FrameError};
use crate::messages::{CancelResponse, ErrorBody, SubscribeRequest, TaskEnvelope, TaskIdRequest};
use crate::service::TaskService;

const DRIVER_WAIT: Duration = Duration::from_millis(100);

// ── Events ────────────────────────────────────────────────────────────────────

/// What happened to the call bound to `tag`.
pub struct Completion {
    pub tag: u64,
    pub ok: bool,
    pub event: ServerEvent,
}

pub enum ServerEvent {
    /// A request frame was bound to this armed context.
    Request {
        conn: ConnHandle,
        call_id: u64,
        payload: Bytes,
    },
    /// The connection writer finished (or failed) writing our frame.
    Sent,
    /// The stream sink produced one result.
    StreamItem(Box<WireTask>),
    /// The stream sink closed; finish with this status.
    StreamClosed(StatusCode),
}

type ServerCq = CompletionQueue<Completion>;

// ── Connection handle ─────────────────────────────────────────────────────────

/// Outbound frame handed to a connection's writer task.
struct Outbound {
    header: FrameHeader,
    payload: Bytes,
    /// Posted as a `Sent` completion once the write finishes.
    completion: Option<(Arc<ServerCq>, u64)>,
}

/// Cloneable handle for sending frames on one connection.
#[derive(Clone)]
pub struct ConnHandle {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ConnHandle {
    fn send(&self, outbound: Outbound) {
        if let Err(mpsc::error::SendError(lost)) = self.tx.send(outbound) {
            // Writer is gone; surface the failure as a failed completion so
            // the context still advances.
            if let Some((cq, tag)) = lost.completion {
                cq.post(Completion {
                    tag,
                    ok: false,
                    event: ServerEvent::Sent,
                });
            }
        }
    }
}

// ── Stream sink ───────────────────────────────────────────────────────────────

/// Producer half of one `ListenResults` call.
///
/// Held by the service (the daemon's result hub). Items become completion
/// events on the owning queue and are written in order by the driver.
#[derive(Clone)]
pub struct StreamSink {
    cq: Arc<ServerCq>,
    tag: u64,
    alive: Arc<AtomicBool>,
}

impl StreamSink {
    /// Queue one result for the subscriber. `false` once the call ended.
    pub fn send(&self, task: WireTask) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        self.cq.post(Completion {
            tag: self.tag,
            ok: true,
            event: ServerEvent::StreamItem(Box::new(task)),
        });
        true
    }

    /// End the stream with `status`.
    pub fn close(&self, status: StatusCode) {
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        self.cq.post(Completion {
            tag: self.tag,
            ok: true,
            event: ServerEvent::StreamClosed(status),
        });
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }
}

// ── Per-call contexts ─────────────────────────────────────────────────────────

enum UnaryStep {
    Create,
    Finish,
}

enum StreamStep {
    Create,
    Streaming,
    Finish,
}

struct StreamState {
    step: StreamStep,
    conn: Option<ConnHandle>,
    call_id: u64,
    buffered: VecDeque<WireTask>,
    write_in_flight: bool,
    /// Set when the sink closed; the trailer goes out after pending writes.
    closed: Option<StatusCode>,
    sink_alive: Arc<AtomicBool>,
}

enum CallContext {
    Unary { op: MsgType, step: UnaryStep },
    Stream(StreamState),
}

impl CallContext {
    fn new(op: MsgType) -> Self {
        if op == MsgType::ListenResults {
            Self::Stream(StreamState {
                step: StreamStep::Create,
                conn: None,
                call_id: 0,
                buffered: VecDeque::new(),
                write_in_flight: false,
                closed: None,
                sink_alive: Arc::new(AtomicBool::new(true)),
            })
        } else {
            Self::Unary {
                op,
                step: UnaryStep::Create,
            }
        }
    }

    fn op(&self) -> MsgType {
        match self {
            Self::Unary { op, .. } => *op,
            Self::Stream(_) => MsgType::ListenResults,
        }
    }
}

/// What the driver does with the context after an event.
enum Disposition {
    Keep,
    /// Destroy; arm a replacement unless shutting down.
    Destroy,
}

// ── Registry of armed contexts ────────────────────────────────────────────────

struct ArmedTag {
    queue: usize,
    tag: u64,
}

struct PendingCall {
    conn: ConnHandle,
    call_id: u64,
    payload: Bytes,
}

#[derive(Default)]
struct OpState {
    armed: VecDeque<ArmedTag>,
    pending: VecDeque<PendingCall>,
}

/// Per-op pools of armed contexts and of requests waiting for one.
struct ArmedRegistry {
    ops: [Mutex<OpState>; 4],
}

impl ArmedRegistry {
    fn new() -> Self {
        Self {
            ops: [
                Mutex::new(OpState::default()),
                Mutex::new(OpState::default()),
                Mutex::new(OpState::default()),
                Mutex::new(OpState::default()),
            ],
        }
    }

    fn op(&self, op: MsgType) -> &Mutex<OpState> {
        &self.ops[(op as u8 - 1) as usize]
    }
}

// ── Shared server state ───────────────────────────────────────────────────────

struct QueueState {
    cq: Arc<ServerCq>,
    contexts: Mutex<HashMap<u64, CallContext>>,
}

struct ServerShared {
    service: Arc<dyn TaskService>,
    queues: Vec<Arc<QueueState>>,
    armed: ArmedRegistry,
    next_tag: AtomicU64,
    shutting_down: AtomicBool,
}

impl ServerShared {
    /// Create a fresh context on `queue` and offer it to the op's pool —
    /// serving a parked request immediately if one is waiting.
    fn arm_context(&self, queue: usize, op: MsgType) {
        let tag = self.next_tag.fetch_add(1, Ordering::Relaxed);
        self.queues[queue]
            .contexts
            .lock()
            .unwrap()
            .insert(tag, CallContext::new(op));
        self.register_armed(queue, tag, op);
    }

    fn register_armed(&self, queue: usize, tag: u64, op: MsgType) {
        let mut op_state = self.armed.op(op).lock().unwrap();
        if let Some(call) = op_state.pending.pop_front() {
            drop(op_state);
            self.queues[queue].cq.post(Completion {
                tag,
                ok: true,
                event: ServerEvent::Request {
                    conn: call.conn,
                    call_id: call.call_id,
                    payload: call.payload,
                },
            });
        } else {
            op_state.armed.push_back(ArmedTag { queue, tag });
        }
    }

    /// Bind an incoming request to an armed context, or park it.
    fn dispatch_request(&self, op: MsgType, conn: ConnHandle, call_id: u64, payload: Bytes) {
        let mut op_state = self.armed.op(op).lock().unwrap();
        match op_state.armed.pop_front() {
            Some(armed) => {
                drop(op_state);
                self.queues[armed.queue].cq.post(Completion {
                    tag: armed.tag,
                    ok: true,
                    event: ServerEvent::Request {
                        conn,
                        call_id,
                        payload,
                    },
                });
            }
            None => op_state.pending.push_back(PendingCall {
                conn,
                call_id,
                payload,
            }),
        }
    }
}

// ── Server ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct ServerOptions {
    /// Listen port; 0 picks a free port.
    pub port: u16,
    /// Completion queues (and driver threads).
    pub queue_count: usize,
    /// Pre-armed contexts per queue.
    pub initial_contexts: usize,
}

impl ServerOptions {
    pub fn from_config(config: &DtsConfig) -> Self {
        Self {
            port: config.server.port,
            queue_count: config.queue_count(),
            initial_contexts: config.initial_contexts(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind listen socket: {0}")]
    Bind(std::io::Error),
    #[error("failed to start transport runtime: {0}")]
    Runtime(std::io::Error),
}

pub struct Server {
    local_addr: SocketAddr,
    shared: Arc<ServerShared>,
    drivers: Vec<std::thread::JoinHandle<()>>,
    accept: Option<tokio::task::JoinHandle<()>>,
    runtime: Option<tokio::runtime::Runtime>,
}

impl Server {
    /// Bind, pre-arm contexts, and start drivers and the accept loop.
    pub fn start(
        options: ServerOptions,
        service: Arc<dyn TaskService>,
    ) -> Result<Self, ServerError> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .thread_name("dts-rpc-io")
            .enable_all()
            .build()
            .map_err(ServerError::Runtime)?;

        let listener = runtime
            .block_on(TcpListener::bind(("0.0.0.0", options.port)))
            .map_err(ServerError::Bind)?;
        let local_addr = listener.local_addr().map_err(ServerError::Bind)?;

        let queue_count = options.queue_count.max(1);
        let queues: Vec<Arc<QueueState>> = (0..queue_count)
            .map(|_| {
                Arc::new(QueueState {
                    cq: Arc::new(CompletionQueue::new()),
                    contexts: Mutex::new(HashMap::new()),
                })
            })
            .collect();

        let shared = Arc::new(ServerShared {
            service,
            queues,
            armed: ArmedRegistry::new(),
            next_tag: AtomicU64::new(1),
            shutting_down: AtomicBool::new(false),
        });

        // Pre-arm: every queue gets listeners for every op so a burst on any
        // single op never starves the tail of the queue.
        for queue in 0..queue_count {
            for i in 0..options.initial_contexts.max(MsgType::ALL.len()) {
                let op = MsgType::ALL[i % MsgType::ALL.len()];
                shared.arm_context(queue, op);
            }
        }

        let drivers = (0..queue_count)
            .map(|index| {
                let shared = shared.clone();
                std::thread::Builder::new()
                    .name(format!("dts-cq-{index}"))
                    .spawn(move || driver_loop(shared, index))
                    .expect("failed to spawn completion-queue driver")
            })
            .collect();

        let accept = runtime.spawn(accept_loop(listener, shared.clone()));

        tracing::info!(
            addr = %local_addr,
            queues = queue_count,
            contexts_per_queue = options.initial_contexts,
            "rpc server listening"
        );

        Ok(Self {
            local_addr,
            shared,
            drivers,
            accept: Some(accept),
            runtime: Some(runtime),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Graceful shutdown: stop accepting, drain every queue, join drivers,
    /// stop the transport runtime. Idempotent.
    pub fn shutdown(&mut self) {
        if self.shared.shutting_down.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::info!("rpc server shutting down");

        if let Some(accept) = self.accept.take() {
            accept.abort();
        }
        for queue in &self.shared.queues {
            queue.cq.shutdown();
        }
        for driver in self.drivers.drain(..) {
            let _ = driver.join();
        }
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_timeout(Duration::from_secs(1));
        }
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

async fn accept_loop(listener: TcpListener, shared: Arc<ServerShared>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "connection accepted");
                tokio::spawn(connection_loop(stream, shared.clone()));
            }
            Err(error) => {
                tracing::warn!(%error, "accept failed");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        }
    }
}

async fn connection_loop(stream: TcpStream, shared: Arc<ServerShared>) {
    let _ = stream.set_nodelay(true);
    let (mut read_half, mut write_half) = stream.into_split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();
    let conn = ConnHandle { tx };

    // Writer: owns the write half. After the first failure it keeps draining
    // so every queued frame still resolves its completion as failed.
    tokio::spawn(async move {
        let mut broken = false;
        while let Some(outbound) = rx.recv().await {
            let ok = if broken {
                false
            } else {
                match frame::write_frame(&mut write_half, &outbound.header, &outbound.payload).await
                {
                    Ok(()) => true,
                    Err(error) => {
                        tracing::debug!(%error, "connection write failed");
                        broken = true;
                        false
                    }
                }
            };
            if let Some((cq, tag)) = outbound.completion {
                cq.post(Completion {
                    tag,
                    ok,
                    event: ServerEvent::Sent,
                });
            }
        }
    });

    loop {
        match frame::read_frame(&mut read_half).await {
            Ok((header, payload)) => {
                let call_id = header.call_id;
                if header.is_response() {
                    tracing::debug!(call_id, "client sent a response frame; closing");
                    break;
                }
                match header.op() {
                    Some(op) => {
                        shared.dispatch_request(op, conn.clone(), call_id, payload);
                    }
                    None => {
                        // Unknown operation: answer directly, no context.
                        let raw_type = header.msg_type;
                        let mut reply = FrameHeader::response(
                            MsgType::SubmitTask,
                            call_id,
                            StatusCode::Unimplemented,
                            0,
                        );
                        reply.msg_type = raw_type | RESPONSE_BIT;
                        conn.send(Outbound {
                            header: reply,
                            payload: Bytes::new(),
                            completion: None,
                        });
                    }
                }
            }
            Err(FrameError::Io(error)) => {
                if error.kind() != std::io::ErrorKind::UnexpectedEof {
                    tracing::debug!(%error, "connection read failed");
                }
                break;
            }
            Err(error) => {
                tracing::warn!(%error, "protocol violation; closing connection");
                break;
            }
        }
    }
}

// ── Drivers ───────────────────────────────────────────────────────────────────

fn driver_loop(shared: Arc<ServerShared>, index: usize) {
    let queue = shared.queues[index].clone();
    loop {
        match queue.cq.next_timeout(DRIVER_WAIT) {
            Next::Event(completion) => handle_completion(&shared, &queue, index, completion),
            Next::Timeout => continue,
            Next::Shutdown => break,
        }
    }
    // Remaining contexts (armed listeners, parked streams) die with the map.
    for (_, context) in queue.contexts.lock().unwrap().drain() {
        if let CallContext::Stream(stream) = context {
            stream.sink_alive.store(false, Ordering::Release);
        }
    }
}

fn handle_completion(
    shared: &Arc<ServerShared>,
    queue: &Arc<QueueState>,
    queue_index: usize,
    completion: Completion,
) {
    let Completion { tag, ok, event } = completion;

    let mut contexts = queue.contexts.lock().unwrap();
    let Some(context) = contexts.get_mut(&tag) else {
        // Stale event for a destroyed call (e.g. a sink racing destruction).
        return;
    };

    let disposition = if ok {
        drive(shared, queue, tag, context, event)
    } else {
        if let CallContext::Stream(stream) = context {
            stream.sink_alive.store(false, Ordering::Release);
        }
        Disposition::Destroy
    };

    if let Disposition::Destroy = disposition {
        let op = context.op();
        if let CallContext::Stream(stream) = context {
            stream.sink_alive.store(false, Ordering::Release);
        }
        if !shared.shutting_down.load(Ordering::Acquire) {
            // Arm the replacement before the finished context is reclaimed
            // so the queue is never without a listener for this op.
            let fresh_tag = shared.next_tag.fetch_add(1, Ordering::Relaxed);
            contexts.insert(fresh_tag, CallContext::new(op));
            contexts.remove(&tag);
            drop(contexts);
            shared.register_armed(queue_index, fresh_tag, op);
        } else {
            contexts.remove(&tag);
        }
    }
}

fn drive(
    shared: &Arc<ServerShared>,
    queue: &Arc<QueueState>,
    tag: u64,
    context: &mut CallContext,
    event: ServerEvent,
) -> Disposition {
    match context {
        CallContext::Unary { op, step } => match step {
            UnaryStep::Create => {
                let ServerEvent::Request {
                    conn,
                    call_id,
                    payload,
                } = event
                else {
                    tracing::warn!(tag, "unary context received an event out of order");
                    return Disposition::Destroy;
                };
                let (status, body) = run_unary(shared.service.as_ref(), *op, &payload);
                conn.send(Outbound {
                    header: FrameHeader::response(*op, call_id, status, body.len() as u32),
                    payload: body,
                    completion: Some((queue.cq.clone(), tag)),
                });
                *step = UnaryStep::Finish;
                Disposition::Keep
            }
            UnaryStep::Finish => match event {
                ServerEvent::Sent => Disposition::Destroy,
                _ => {
                    tracing::warn!(tag, "unary context received an event out of order");
                    Disposition::Destroy
                }
            },
        },

        CallContext::Stream(stream) => drive_stream(shared, queue, tag, stream, event),
    }
}

fn drive_stream(
    shared: &Arc<ServerShared>,
    queue: &Arc<QueueState>,
    tag: u64,
    stream: &mut StreamState,
    event: ServerEvent,
) -> Disposition {
    match stream.step {
        StreamStep::Create => {
            let ServerEvent::Request {
                conn,
                call_id,
                payload,
            } = event
            else {
                tracing::warn!(tag, "stream context received an event out of order");
                return Disposition::Destroy;
            };
            stream.call_id = call_id;
            stream.conn = Some(conn.clone());
            match serde_json::from_slice::<SubscribeRequest>(&payload) {
                Ok(request) => {
                    let sink = StreamSink {
                        cq: queue.cq.clone(),
                        tag,
                        alive: stream.sink_alive.clone(),
                    };
                    match shared.service.listen_results(&request.client_id, sink) {
                        Ok(()) => {
                            tracing::debug!(client_id = %request.client_id, tag, "stream subscribed");
                            stream.step = StreamStep::Streaming;
                        }
                        Err(status) => {
                            send_trailer(&conn, queue, tag, call_id, status.code);
                            stream.step = StreamStep::Finish;
                        }
                    }
                }
                Err(error) => {
                    tracing::debug!(%error, "malformed subscribe request");
                    send_trailer(&conn, queue, tag, call_id, StatusCode::Internal);
                    stream.step = StreamStep::Finish;
                }
            }
            Disposition::Keep
        }

        StreamStep::Streaming => match event {
            ServerEvent::StreamItem(task) => {
                if stream.write_in_flight {
                    stream.buffered.push_back(*task);
                } else {
                    send_data_frame(queue, tag, stream, *task);
                }
                Disposition::Keep
            }
            ServerEvent::StreamClosed(status) => {
                stream.sink_alive.store(false, Ordering::Release);
                stream.closed = Some(status);
                if !stream.write_in_flight && stream.buffered.is_empty() {
                    finish_stream(queue, tag, stream, status);
                }
                Disposition::Keep
            }
            ServerEvent::Sent => {
                stream.write_in_flight = false;
                if let Some(task) = stream.buffered.pop_front() {
                    send_data_frame(queue, tag, stream, task);
                } else if let Some(status) = stream.closed {
                    finish_stream(queue, tag, stream, status);
                }
                Disposition::Keep
            }
            ServerEvent::Request { .. } => {
                tracing::warn!(tag, "stream context received an event out of order");
                Disposition::Destroy
            }
        },

        StreamStep::Finish => match event {
            ServerEvent::Sent => Disposition::Destroy,
            // Late sink traffic after the trailer went out is harmless.
            ServerEvent::StreamItem(_) | ServerEvent::StreamClosed(_) => Disposition::Keep,
            ServerEvent::Request { .. } => {
                tracing::warn!(tag, "stream context received an event out of order");
                Disposition::Destroy
            }
        },
    }
}

fn send_data_frame(queue: &Arc<QueueState>, tag: u64, stream: &mut StreamState, task: WireTask) {
    let Some(conn) = &stream.conn else { return };
    let body = Bytes::from(
        serde_json::to_vec(&task).expect("wire task serialization failed"),
    );
    conn.send(Outbound {
        header: FrameHeader::response(
            MsgType::ListenResults,
            stream.call_id,
            StatusCode::Ok,
            body.len() as u32,
        ),
        payload: body,
        completion: Some((queue.cq.clone(), tag)),
    });
    stream.write_in_flight = true;
}

fn finish_stream(queue: &Arc<QueueState>, tag: u64, stream: &mut StreamState, status: StatusCode) {
    if let Some(conn) = &stream.conn {
        send_trailer(conn, queue, tag, stream.call_id, status);
    }
    stream.step = StreamStep::Finish;
}

/// The EOS trailer: empty payload, end-of-stream flag, terminal status.
fn send_trailer(
    conn: &ConnHandle,
    queue: &Arc<QueueState>,
    tag: u64,
    call_id: u64,
    status: StatusCode,
) {
    let mut header = FrameHeader::response(MsgType::ListenResults, call_id, status, 0);
    header.flags |= FLAG_EOS;
    conn.send(Outbound {
        header,
        payload: Bytes::new(),
        completion: Some((queue.cq.clone(), tag)),
    });
}

// ── Unary handlers ────────────────────────────────────────────────────────────

fn run_unary(service: &dyn TaskService, op: MsgType, payload: &[u8]) -> (StatusCode, Bytes) {
    match op {
        MsgType::SubmitTask => match serde_json::from_slice::<WireTask>(payload) {
            Ok(task) => match service.submit_task(task) {
                Ok(accepted) => ok_body(&TaskEnvelope { task: accepted }),
                Err(status) => error_body(status),
            },
            Err(error) => error_body(Status::new(
                StatusCode::Internal,
                format!("malformed task: {error}"),
            )),
        },
        MsgType::CancelTask => match serde_json::from_slice::<TaskIdRequest>(payload) {
            Ok(request) => ok_body(&CancelResponse {
                success: service.cancel_task(&request.task_id),
            }),
            Err(error) => error_body(Status::new(
                StatusCode::Internal,
                format!("malformed cancel request: {error}"),
            )),
        },
        MsgType::QueryStatus => match serde_json::from_slice::<TaskIdRequest>(payload) {
            Ok(request) => match service.query_status(&request.task_id) {
                Ok(task) => ok_body(&task),
                Err(status) => error_body(status),
            },
            Err(error) => error_body(Status::new(
                StatusCode::Internal,
                format!("malformed query request: {error}"),
            )),
        },
        // Streams never reach the unary path.
        MsgType::ListenResults => error_body(Status::new(
            StatusCode::Internal,
            "stream op on unary path",
        )),
    }
}

fn ok_body<T: serde::Serialize>(body: &T) -> (StatusCode, Bytes) {
    let bytes = serde_json::to_vec(body).expect("response body serialization failed");
    (StatusCode::Ok, Bytes::from(bytes))
}

fn error_body(status: Status) -> (StatusCode, Bytes) {
    let bytes = serde_json::to_vec(&ErrorBody {
        message: status.message,
    })
    .expect("error body serialization failed");
    (status.code, Bytes::from(bytes))
}
