//! Counting signal with bounded waits.
//!
//! The work pool's wake-up primitive: producers add permits, workers wait
//! with a short timeout so a stop flag is observed promptly even when no
//! work arrives.

use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

#[derive(Default)]
pub struct Signal {
    permits: Mutex<usize>,
    condvar: Condvar,
}

impl Signal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `n` permits and wake waiters.
    pub fn notify(&self, n: usize) {
        let mut permits = self.permits.lock().unwrap();
        *permits += n;
        if n == 1 {
            self.condvar.notify_one();
        } else {
            self.condvar.notify_all();
        }
    }

    /// Take one permit, waiting at most `timeout`. Returns whether a permit
    /// was taken.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap();
        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (guard, result) = self
                .condvar
                .wait_timeout(permits, deadline - now)
                .unwrap();
            permits = guard;
            if result.timed_out() && *permits == 0 {
                return false;
            }
        }
        *permits -= 1;
        true
    }
}
