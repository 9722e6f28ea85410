//! Error kinds shared across the service.
//!
//! Handler faults are classified by kind at the executor: `Transient` plus
//! remaining budget means retry, everything else becomes a terminal state
//! with `error_msg` set. Errors never cross a worker boundary as panics.

/// Classification of a task-level failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Retryable: peer unreachable, connection refused, operation aborted.
    Transient,
    /// Deadline elapsed.
    Timeout,
    /// Cooperative cancellation observed.
    Cancelled,
    /// Schema or field missing, unknown function, admission failure.
    Invariant,
    /// Submission after stop.
    ShuttingDown,
    /// Wire-level failure surfaced by the completion queue.
    Transport,
}

/// A handler or executor fault, carrying its retry classification.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn connection_refused() -> Self {
        Self::new(ErrorKind::Transient, "connection refused")
    }

    pub fn host_unreachable() -> Self {
        Self::new(ErrorKind::Transient, "host unreachable")
    }

    pub fn aborted() -> Self {
        Self::new(ErrorKind::Transient, "operation aborted")
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "task cancelled")
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Invariant, message)
    }

    /// Only transient faults qualify for the retry path.
    pub fn is_retryable(&self) -> bool {
        self.kind == ErrorKind::Transient
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_transient_is_retryable() {
        assert!(TaskError::connection_refused().is_retryable());
        assert!(TaskError::host_unreachable().is_retryable());
        assert!(TaskError::aborted().is_retryable());
        assert!(!TaskError::cancelled().is_retryable());
        assert!(!TaskError::invariant("boom").is_retryable());
    }
}
