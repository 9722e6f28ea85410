//! One-shot timer service.
//!
//! A single dedicated thread owns a deadline heap and fires callbacks in
//! deadline order — the process-wide timer loop behind task deadlines and
//! retry backoff. Callbacks receive [`TimerEvent::Fired`] on expiry or
//! [`TimerEvent::Cancelled`] when the entry was cancelled or the service is
//! shutting down, and always run on the timer thread, outside the service
//! lock.

use std::cmp::Ordering as CmpOrdering;
use std::collections::{BinaryHeap, HashSet};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

/// Why a timer callback is running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Fired,
    Cancelled,
}

type TimerFn = Box<dyn FnOnce(TimerEvent) + Send + 'static>;

struct Entry {
    deadline: Instant,
    id: u64,
    callback: TimerFn,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.deadline == other.deadline && self.id == other.id
    }
}
impl Eq for Entry {}

impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

// Min-heap by deadline: reverse the natural order.
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        other
            .deadline
            .cmp(&self.deadline)
            .then_with(|| other.id.cmp(&self.id))
    }
}

struct TimerState {
    entries: BinaryHeap<Entry>,
    cancelled: HashSet<u64>,
    next_id: u64,
    shutdown: bool,
}

struct TimerShared {
    state: Mutex<TimerState>,
    condvar: Condvar,
}

/// Handle to one scheduled timer. Dropping it does NOT cancel the timer.
pub struct TimerHandle {
    id: u64,
    shared: Arc<TimerShared>,
}

impl TimerHandle {
    /// Cancel the entry; its callback runs with [`TimerEvent::Cancelled`].
    /// A no-op once the callback already ran.
    pub fn cancel(&self) {
        let mut state = self.shared.state.lock().unwrap();
        state.cancelled.insert(self.id);
        self.shared.condvar.notify_all();
    }
}

/// Single-threaded one-shot timer loop.
pub struct TimerService {
    shared: Arc<TimerShared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl TimerService {
    pub fn new() -> Self {
        let shared = Arc::new(TimerShared {
            state: Mutex::new(TimerState {
                entries: BinaryHeap::new(),
                cancelled: HashSet::new(),
                next_id: 1,
                shutdown: false,
            }),
            condvar: Condvar::new(),
        });
        let thread = {
            let shared = shared.clone();
            std::thread::spawn(move || timer_loop(shared))
        };
        Self {
            shared,
            thread: Mutex::new(Some(thread)),
        }
    }

    /// Arm a one-shot timer `delay` from now. Scheduling against a service
    /// that already shut down runs the callback as cancelled, inline.
    pub fn schedule<F>(&self, delay: Duration, callback: F) -> TimerHandle
    where
        F: FnOnce(TimerEvent) + Send + 'static,
    {
        let mut state = self.shared.state.lock().unwrap();
        let id = state.next_id;
        state.next_id += 1;
        if state.shutdown {
            drop(state);
            callback(TimerEvent::Cancelled);
            return TimerHandle {
                id,
                shared: self.shared.clone(),
            };
        }
        state.entries.push(Entry {
            deadline: Instant::now() + delay,
            id,
            callback: Box::new(callback),
        });
        self.shared.condvar.notify_all();
        TimerHandle {
            id,
            shared: self.shared.clone(),
        }
    }

    /// Stop the loop. Every pending entry's callback runs once with
    /// [`TimerEvent::Cancelled`]; the timer thread is joined.
    pub fn shutdown(&self) {
        {
            let mut state = self.shared.state.lock().unwrap();
            if state.shutdown {
                return;
            }
            state.shutdown = true;
            self.shared.condvar.notify_all();
        }
        if let Some(thread) = self.thread.lock().unwrap().take() {
            let _ = thread.join();
        }
    }

    /// Pending entries, for observability.
    pub fn pending(&self) -> usize {
        self.shared.state.lock().unwrap().entries.len()
    }
}

impl Default for TimerService {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for TimerService {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn timer_loop(shared: Arc<TimerShared>) {
    loop {
        // Collect at most one callback per lock hold; run it outside.
        let (callback, event) = {
            let mut state = shared.state.lock().unwrap();
            loop {
                if state.shutdown {
                    // Drain everything as cancelled, then exit.
                    drop(state);
                    drain_cancelled(&shared);
                    return;
                }
                let now = Instant::now();
                let due = match state.entries.peek() {
                    None => None,
                    Some(top) => {
                        if state.cancelled.contains(&top.id) || top.deadline <= now {
                            Some(())
                        } else {
                            None
                        }
                    }
                };
                match due {
                    Some(()) => {
                        let entry = state.entries.pop().unwrap();
                        let event = if state.cancelled.remove(&entry.id) {
                            TimerEvent::Cancelled
                        } else {
                            TimerEvent::Fired
                        };
                        break (entry.callback, event);
                    }
                    None => {
                        state = match state.entries.peek().map(|top| top.deadline) {
                            None => shared.condvar.wait(state).unwrap(),
                            Some(deadline) => {
                                let timeout = deadline.saturating_duration_since(now);
                                shared.condvar.wait_timeout(state, timeout).unwrap().0
                            }
                        };
                    }
                }
            }
        };
        callback(event);
    }
}

fn drain_cancelled(shared: &Arc<TimerShared>) {
    loop {
        let entry = {
            let mut state = shared.state.lock().unwrap();
            match state.entries.pop() {
                None => return,
                Some(entry) => {
                    state.cancelled.remove(&entry.id);
                    entry
                }
            }
        };
        (entry.callback)(TimerEvent::Cancelled);
    }
}
