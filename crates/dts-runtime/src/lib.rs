//! dts-runtime — the concurrency substrate under the dts worker.
//!
//! Plain-thread building blocks with no async dependency: a hazard-pointer
//! reclamation domain, the lock-free MPMC queue built on it, a bounded work
//! pool, one-shot result slots, a counting signal, and the one-shot timer
//! service. The RPC engine and the task executor are assembled from these.

pub mod hazard;
pub mod mpmc;
pub mod oneshot;
pub mod pool;
pub mod signal;
pub mod timer;

pub use mpmc::MpmcQueue;
pub use oneshot::{oneshot, OneshotReceiver, OneshotSender, RecvError};
pub use pool::{PoolError, WorkPool};
pub use signal::Signal;
pub use timer::{TimerEvent, TimerHandle, TimerService};
