//! Bounded work pool.
//!
//! Closures come in from any number of producers and run on a resizable set
//! of workers. The queue is the lock-free [`MpmcQueue`] bounded by a capacity
//! counter; wake-ups go through the counting [`Signal`] with a 200 ms bounded
//! wait so the stop flag is observed promptly. A closure that panics is
//! counted and swallowed — the worker survives.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::hazard;
use crate::mpmc::MpmcQueue;
use crate::oneshot::{oneshot, OneshotReceiver};
use crate::signal::Signal;

const WORKER_WAIT: Duration = Duration::from_millis(200);

type Job = Box<dyn FnOnce() + Send + 'static>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum PoolError {
    #[error("enqueue on a pool that is shutting down")]
    ShuttingDown,
}

struct PoolInner {
    queue: MpmcQueue<Job>,
    capacity: usize,
    signal: Signal,
    stop: AtomicBool,
    target_threads: AtomicUsize,
    active_threads: AtomicUsize,
    queued: AtomicUsize,
    completed: AtomicUsize,
    panicked: AtomicUsize,
}

/// Fixed-capacity multi-producer work pool with runtime resize.
pub struct WorkPool {
    inner: Arc<PoolInner>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkPool {
    /// Start `threads` workers over a queue of capacity `queue_capacity`.
    pub fn new(threads: usize, queue_capacity: usize) -> Self {
        let inner = Arc::new(PoolInner {
            queue: MpmcQueue::new(),
            capacity: queue_capacity.max(1),
            signal: Signal::new(),
            stop: AtomicBool::new(false),
            target_threads: AtomicUsize::new(threads),
            active_threads: AtomicUsize::new(0),
            queued: AtomicUsize::new(0),
            completed: AtomicUsize::new(0),
            panicked: AtomicUsize::new(0),
        });

        let pool = Self {
            inner,
            workers: Mutex::new(Vec::with_capacity(threads)),
        };
        pool.spawn_workers(threads);
        pool
    }

    fn spawn_workers(&self, count: usize) {
        let mut workers = self.workers.lock().unwrap();
        for _ in 0..count {
            let inner = self.inner.clone();
            workers.push(std::thread::spawn(move || worker_loop(inner)));
        }
    }

    /// Append a closure. Backs off cooperatively while the queue is full;
    /// fails once the pool is stopping.
    pub fn enqueue<F>(&self, job: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let inner = &self.inner;
        if inner.stop.load(Ordering::Acquire) {
            return Err(PoolError::ShuttingDown);
        }

        // Reserve a queue position first so the bound is exact.
        loop {
            if inner.stop.load(Ordering::Acquire) {
                return Err(PoolError::ShuttingDown);
            }
            let queued = inner.queued.load(Ordering::Acquire);
            if queued < inner.capacity {
                if inner
                    .queued
                    .compare_exchange_weak(queued, queued + 1, Ordering::AcqRel, Ordering::Acquire)
                    .is_ok()
                {
                    break;
                }
            } else {
                std::thread::yield_now();
            }
        }

        inner.queue.push(Box::new(job));
        inner.signal.notify(1);
        Ok(())
    }

    /// As [`enqueue`](Self::enqueue), capturing the closure's return value in
    /// a one-shot slot. A panicking closure closes the slot instead.
    pub fn enqueue_future<F, R>(&self, job: F) -> Result<OneshotReceiver<R>, PoolError>
    where
        F: FnOnce() -> R + Send + 'static,
        R: Send + 'static,
    {
        let (tx, rx) = oneshot();
        self.enqueue(move || {
            let _ = tx.send(job());
        })?;
        Ok(rx)
    }

    /// Raise the target worker count by `n`, spawning immediately.
    pub fn add_threads(&self, n: usize) {
        self.inner.target_threads.fetch_add(n, Ordering::AcqRel);
        self.spawn_workers(n);
    }

    /// Lower the target worker count by `n`; surplus workers exit
    /// cooperatively, one at a time.
    pub fn remove_threads(&self, n: usize) {
        let _ = self
            .inner
            .target_threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |target| {
                Some(target.saturating_sub(n))
            });
    }

    /// Stop accepting work, discard everything still queued, wake all
    /// workers. Joined workers are not restarted.
    pub fn shutdown(&self) {
        let inner = &self.inner;
        if inner.stop.swap(true, Ordering::AcqRel) {
            return;
        }
        while inner.queue.pop().is_some() {
            inner.queued.fetch_sub(1, Ordering::AcqRel);
        }
        inner.signal.notify(inner.active_threads.load(Ordering::Acquire).max(1));
    }

    /// Closures currently queued (admitted, not yet run).
    pub fn tasks_left(&self) -> usize {
        self.inner.queued.load(Ordering::Acquire)
    }

    /// Workers currently alive.
    pub fn thread_count(&self) -> usize {
        self.inner.active_threads.load(Ordering::Acquire)
    }

    /// Closures run to completion, panics included.
    pub fn completed_count(&self) -> usize {
        self.inner.completed.load(Ordering::Acquire)
    }

    /// Closures that panicked inside the firewall.
    pub fn panicked_count(&self) -> usize {
        self.inner.panicked.load(Ordering::Acquire)
    }
}

impl Drop for WorkPool {
    fn drop(&mut self) {
        self.shutdown();
        let workers = std::mem::take(&mut *self.workers.lock().unwrap());
        for worker in workers {
            let _ = worker.join();
        }
    }
}

fn worker_loop(inner: Arc<PoolInner>) {
    inner.active_threads.fetch_add(1, Ordering::AcqRel);

    while !inner.stop.load(Ordering::Acquire) {
        if inner.signal.wait_timeout(WORKER_WAIT) {
            if let Some(job) = inner.queue.pop() {
                inner.queued.fetch_sub(1, Ordering::AcqRel);
                if panic::catch_unwind(AssertUnwindSafe(job)).is_err() {
                    inner.panicked.fetch_add(1, Ordering::Relaxed);
                    tracing::warn!("work-pool closure panicked");
                }
                inner.completed.fetch_add(1, Ordering::Relaxed);
            }
        }

        // Cooperative shrink: when actives exceed the target, exactly one
        // worker claims the exit per CAS round.
        loop {
            let active = inner.active_threads.load(Ordering::Acquire);
            let target = inner.target_threads.load(Ordering::Acquire);
            if active <= target {
                break;
            }
            if inner
                .active_threads
                .compare_exchange(active, active - 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
            {
                hazard::flush_thread();
                return;
            }
        }
    }

    inner.active_threads.fetch_sub(1, Ordering::AcqRel);
    hazard::flush_thread();
}
