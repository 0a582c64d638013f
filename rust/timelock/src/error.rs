//! Error types for the timelock service.

use std::time::Duration;

use thiserror::Error;

use crate::paxos::NodeId;

/// Errors surfaced by the timestamp and lock entry points.
///
/// The first six variants form the client-visible taxonomy: every one of them
/// is recoverable by retrying with backoff, and carries what a client library
/// needs to retry transparently (a redirect hint or a reason).
#[derive(Debug, Error)]
pub enum TimelockError {
    /// This node is not the leader of the current term.
    #[error("not current leader, leader hint: {leader_hint:?}")]
    NotCurrentLeader {
        /// Node that most recently held or contested leadership.
        leader_hint: Option<NodeId>,
    },

    /// The proposal log's backing store has not finished initializing.
    #[error("timelock is not initialized yet: {reason}")]
    NotInitialized {
        /// Last initialization failure, if any.
        reason: String,
    },

    /// The caller's lock wait budget ran out.
    #[error("blocking timeout acquiring lock {lock_name} after {waited:?}")]
    BlockingTimeout {
        /// Lock that could not be granted in time.
        lock_name: String,
        /// How long the caller actually waited.
        waited: Duration,
    },

    /// The request was invalidated by a term change.
    #[error("leadership lost during request (term {term})")]
    LeaderLost {
        /// Term the request was issued under.
        term: u64,
    },

    /// The acceptor could not durably persist a promise or acceptance.
    #[error("storage failure: {0}")]
    StorageFailure(String),

    /// No quorum, reservation timeout, or a full wait queue.
    #[error("service unavailable: {0}")]
    ServiceUnavailable(String),

    /// The caller cancelled a blocking acquisition.
    #[error("request cancelled")]
    Cancelled,

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl TimelockError {
    /// Whether a client should retry the request (possibly elsewhere).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            TimelockError::NotCurrentLeader { .. }
                | TimelockError::NotInitialized { .. }
                | TimelockError::BlockingTimeout { .. }
                | TimelockError::LeaderLost { .. }
                | TimelockError::StorageFailure(_)
                | TimelockError::ServiceUnavailable(_)
        )
    }

    /// HTTP-equivalent status a transport layer should map this error to.
    ///
    /// All retryable conditions map to 503 so clients treat them as
    /// "try again" rather than hard failures.
    pub fn http_status(&self) -> u16 {
        match self {
            e if e.is_retryable() => 503,
            TimelockError::Cancelled => 499,
            TimelockError::InvalidArgument(_) => 400,
            _ => 500,
        }
    }

    /// Redirect target carried by `NotCurrentLeader`.
    pub fn leader_hint(&self) -> Option<NodeId> {
        match self {
            TimelockError::NotCurrentLeader { leader_hint } => *leader_hint,
            _ => None,
        }
    }
}

impl From<crate::storage::StorageError> for TimelockError {
    fn from(e: crate::storage::StorageError) -> Self {
        match e {
            crate::storage::StorageError::NotInitialized(reason) => {
                TimelockError::NotInitialized { reason }
            }
            other => TimelockError::StorageFailure(other.to_string()),
        }
    }
}

impl From<bincode::Error> for TimelockError {
    fn from(e: bincode::Error) -> Self {
        TimelockError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for TimelockError {
    fn from(e: serde_json::Error) -> Self {
        TimelockError::Config(e.to_string())
    }
}

/// Result type for timelock operations.
pub type Result<T> = std::result::Result<T, TimelockError>;
