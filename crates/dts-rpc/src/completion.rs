//! Completion queues.
//!
//! The event source the driver threads block on. Transport tasks, stream
//! sinks, and writer completions all post here; one driver drains each
//! queue and re-enters the per-call state machine bound to the event's tag.
//!
//! Built on the substrate: the lock-free [`MpmcQueue`] carries the events
//! and the counting [`Signal`] wakes the driver with a bounded wait so
//! shutdown is observed promptly. After [`shutdown`](CompletionQueue::shutdown),
//! `next_timeout` keeps returning buffered events until the queue is drained
//! — destructors for in-flight calls still run — and only then reports
//! [`Next::Shutdown`].

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dts_runtime::{MpmcQueue, Signal};

/// Outcome of one bounded wait on the queue.
pub enum Next<E> {
    Event(E),
    Timeout,
    Shutdown,
}

pub struct CompletionQueue<E> {
    events: MpmcQueue<E>,
    signal: Signal,
    shut_down: AtomicBool,
}

impl<E: Send> CompletionQueue<E> {
    pub fn new() -> Self {
        Self {
            events: MpmcQueue::new(),
            signal: Signal::new(),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Post one event. Always accepted — shutdown drains, it does not drop.
    pub fn post(&self, event: E) {
        self.events.push(event);
        self.signal.notify(1);
    }

    /// Block up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Next<E> {
        let _signalled = self.signal.wait_timeout(timeout);
        if let Some(event) = self.events.pop() {
            return Next::Event(event);
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Next::Shutdown;
        }
        Next::Timeout
    }

    /// Flag shutdown and wake every waiter. Events already queued are still
    /// delivered by subsequent `next_timeout` calls.
    pub fn shutdown(&self) {
        self.shut_down.store(true, Ordering::Release);
        self.signal.notify(1024);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }
}

impl<E: Send> Default for CompletionQueue<E> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivers_posted_events_in_order() {
        let cq = CompletionQueue::new();
        cq.post(1u32);
        cq.post(2);
        assert!(matches!(cq.next_timeout(Duration::from_millis(10)), Next::Event(1)));
        assert!(matches!(cq.next_timeout(Duration::from_millis(10)), Next::Event(2)));
        assert!(matches!(cq.next_timeout(Duration::from_millis(10)), Next::Timeout));
    }

    #[test]
    fn drains_remaining_events_after_shutdown() {
        let cq = CompletionQueue::new();
        cq.post("pending");
        cq.shutdown();
        assert!(matches!(
            cq.next_timeout(Duration::from_millis(10)),
            Next::Event("pending")
        ));
        assert!(matches!(
            cq.next_timeout(Duration::from_millis(10)),
            Next::Shutdown
        ));
    }

    #[test]
    fn shutdown_wakes_a_blocked_waiter() {
        let cq = std::sync::Arc::new(CompletionQueue::<u32>::new());
        let waiter = {
            let cq = cq.clone();
            std::thread::spawn(move || {
                loop {
                    match cq.next_timeout(Duration::from_secs(5)) {
                        Next::Shutdown => return true,
                        Next::Timeout => continue,
                        Next::Event(_) => return false,
                    }
                }
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        cq.shutdown();
        assert!(waiter.join().unwrap());
    }
}
