//! Error types for the cluster contracts.

use crate::job::JobId;
use thiserror::Error;

/// Errors surfaced by queue-cluster operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The queue node could not be reached. Transient: callers log and
    /// continue, or retry with backoff.
    #[error("queue node unreachable: {0}")]
    Unreachable(String),

    /// The job is not currently claimed by this consumer. Returned by
    /// `ack`/`wait` when the retry window elapsed and the job was handed
    /// to another consumer, or when it was deleted.
    #[error("job {0} is not in flight")]
    NotInFlight(JobId),

    /// The client has been closed.
    #[error("queue cluster client is closed")]
    Closed,
}

impl QueueError {
    /// Whether retrying the operation against the same node can succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable(_))
    }
}

/// Errors surfaced by a single lock-cluster member.
///
/// A member that answers is authoritative about its own key state, so the
/// conditional operations report plain `bool` outcomes; only failing to get
/// an answer at all is an error.
#[derive(Debug, Error)]
pub enum LockStoreError {
    #[error("lock node unreachable: {0}")]
    Unreachable(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transient_classification() {
        assert!(QueueError::Unreachable("node-1".into()).is_transient());
        assert!(!QueueError::Closed.is_transient());
    }
}
