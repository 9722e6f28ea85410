//! dts-rpc — the asynchronous RPC layer of dts.
//!
//! The server side multiplexes every in-flight call onto a small set of
//! driver threads through per-call state machines and completion queues; the
//! client side exposes the four task-service calls in blocking, future, and
//! callback forms over one pumped completion queue.

pub mod client;
pub mod completion;
pub mod frame;
pub mod messages;
pub mod server;
pub mod service;

pub use client::{DtsClient, ResultCallback, RpcError};
pub use completion::{CompletionQueue, Next};
pub use server::{Server, ServerOptions, StreamSink};
pub use service::TaskService;
