//! Monotonic clock for task timestamps.
//!
//! All lifecycle timestamps (`submit_ts`, `start_ts`, `finish_ts`) are
//! milliseconds on this clock. It never goes backwards, so deadline math
//! (`timeout_ms - (now - submit_ts)`) is immune to wall-clock steps.

use std::sync::OnceLock;
use std::time::Instant;

static EPOCH: OnceLock<Instant> = OnceLock::new();

/// Milliseconds since the process-wide epoch (initialized at first use).
pub fn now_ms() -> i64 {
    let epoch = *EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_millis() as i64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic() {
        let a = now_ms();
        let b = now_ms();
        assert!(b >= a);
    }
}
