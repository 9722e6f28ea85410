//! One-shot result slots.
//!
//! The future half of `WorkPool::enqueue_future` and the delivery slot
//! behind every asynchronous RPC call: a value crosses from producer to
//! consumer exactly once. Dropping the sender without sending closes the
//! slot, which the receiver observes as an error rather than a hang — that
//! is how a panicked pool closure surfaces.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

enum State<T> {
    Empty,
    Value(T),
    Taken,
    Closed,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    condvar: Condvar,
}

pub struct OneshotSender<T> {
    inner: Arc<Inner<T>>,
    sent: bool,
}

pub struct OneshotReceiver<T> {
    inner: Arc<Inner<T>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("one-shot slot closed before a value was delivered")]
pub struct RecvError;

/// Create a connected sender/receiver pair.
pub fn oneshot<T>() -> (OneshotSender<T>, OneshotReceiver<T>) {
    let inner = Arc::new(Inner {
        state: Mutex::new(State::Empty),
        condvar: Condvar::new(),
    });
    (
        OneshotSender {
            inner: inner.clone(),
            sent: false,
        },
        OneshotReceiver { inner },
    )
}

impl<T> OneshotSender<T> {
    /// Deliver the value. Returns it back if the slot was already closed.
    pub fn send(mut self, value: T) -> Result<(), T> {
        let mut state = self.inner.state.lock().unwrap();
        match &*state {
            State::Empty => {
                *state = State::Value(value);
                self.sent = true;
                self.inner.condvar.notify_all();
                Ok(())
            }
            _ => Err(value),
        }
    }
}

impl<T> Drop for OneshotSender<T> {
    fn drop(&mut self) {
        if self.sent {
            return;
        }
        let mut state = self.inner.state.lock().unwrap();
        if matches!(&*state, State::Empty) {
            *state = State::Closed;
            self.inner.condvar.notify_all();
        }
    }
}

impl<T> OneshotReceiver<T> {
    /// Block until the value arrives or the sender is dropped.
    pub fn recv(self) -> Result<T, RecvError> {
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, State::Taken) {
                State::Value(value) => return Ok(value),
                State::Closed => {
                    *state = State::Closed;
                    return Err(RecvError);
                }
                State::Taken => return Err(RecvError),
                State::Empty => {
                    *state = State::Empty;
                    state = self.inner.condvar.wait(state).unwrap();
                }
            }
        }
    }

    /// Block up to `timeout`. `Ok(None)` means the slot is still empty.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Option<T>, RecvError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock().unwrap();
        loop {
            match std::mem::replace(&mut *state, State::Taken) {
                State::Value(value) => return Ok(Some(value)),
                State::Closed => {
                    *state = State::Closed;
                    return Err(RecvError);
                }
                State::Taken => return Err(RecvError),
                State::Empty => {
                    *state = State::Empty;
                    let now = Instant::now();
                    if now >= deadline {
                        return Ok(None);
                    }
                    let (guard, _) = self
                        .inner
                        .condvar
                        .wait_timeout(state, deadline - now)
                        .unwrap();
                    state = guard;
                }
            }
        }
    }

    /// Non-blocking read. The value is taken at most once.
    pub fn try_recv(&self) -> Result<Option<T>, RecvError> {
        let mut state = self.inner.state.lock().unwrap();
        match std::mem::replace(&mut *state, State::Taken) {
            State::Value(value) => Ok(Some(value)),
            State::Closed => {
                *state = State::Closed;
                Err(RecvError)
            }
            State::Taken => Err(RecvError),
            State::Empty => {
                *state = State::Empty;
                Ok(None)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_crosses_once() {
        let (tx, rx) = oneshot();
        tx.send(7).unwrap();
        assert_eq!(rx.recv(), Ok(7));
    }

    #[test]
    fn second_read_observes_taken() {
        let (tx, rx) = oneshot();
        tx.send(1).unwrap();
        assert_eq!(rx.try_recv(), Ok(Some(1)));
        assert_eq!(rx.try_recv(), Err(RecvError));
    }

    #[test]
    fn dropped_sender_closes_the_slot() {
        let (tx, rx) = oneshot::<u32>();
        drop(tx);
        assert_eq!(rx.recv(), Err(RecvError));
    }

    #[test]
    fn recv_blocks_until_send() {
        let (tx, rx) = oneshot();
        let sender = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(20));
            tx.send("late").unwrap();
        });
        assert_eq!(rx.recv(), Ok("late"));
        sender.join().unwrap();
    }

    #[test]
    fn recv_timeout_reports_empty() {
        let (tx, rx) = oneshot::<u32>();
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Ok(None));
        tx.send(3).unwrap();
        assert_eq!(rx.recv_timeout(Duration::from_millis(10)), Ok(Some(3)));
    }
}
