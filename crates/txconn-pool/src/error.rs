//! Pool and listener error types.

use std::time::Duration;

use thiserror::Error;
use txconn_xa::{BoxError, CoordinatorError, TxId};

use crate::listener::ListenerId;

/// Errors raised by the pool and by connection listeners.
#[derive(Debug, Error)]
pub enum PoolError {
    /// No connection became available within the blocking timeout.
    #[error("pool '{pool}' exhausted: no connection available within {timeout:?}")]
    PoolExhausted {
        /// Pool name.
        pool: String,
        /// Timeout that elapsed.
        timeout: Duration,
    },

    /// The factory failed to create or validate a connection.
    #[error("pool '{pool}' failed to create a connection after {attempts} attempt(s)")]
    ResourceCreationFailed {
        /// Pool name.
        pool: String,
        /// Number of attempts made.
        attempts: u32,
        /// Last failure.
        #[source]
        source: BoxError,
    },

    /// The pool has been closed.
    #[error("pool is closed")]
    PoolClosed,

    /// Invalid pool configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// The listener is already taking part in a transaction.
    #[error("listener {listener} is already enlisted in {tx}")]
    AlreadyEnlisted {
        /// Listener concerned.
        listener: ListenerId,
        /// Transaction the listener is enlisted in.
        tx: TxId,
    },

    /// The listener's state machine rejected the operation.
    #[error("listener {listener} cannot {operation} while {state}")]
    InvalidTransition {
        /// Listener concerned.
        listener: ListenerId,
        /// Rejected operation.
        operation: &'static str,
        /// State the listener was in.
        state: String,
    },

    /// The coordinator refused or failed the enlistment.
    #[error("enlisting listener {listener} in {tx} failed: {reason}")]
    EnlistmentFailed {
        /// Listener concerned.
        listener: ListenerId,
        /// Target transaction.
        tx: TxId,
        /// Failure description.
        reason: String,
        /// Coordinator failure, if any.
        #[source]
        source: Option<CoordinatorError>,
    },

    /// Ending the branch with the coordinator failed.
    #[error("delisting listener {listener} from {tx} failed: {reason}")]
    DelistFailed {
        /// Listener concerned.
        listener: ListenerId,
        /// Transaction concerned.
        tx: TxId,
        /// Failure description.
        reason: String,
        /// Coordinator failure, if any.
        #[source]
        source: Option<CoordinatorError>,
    },
}

impl PoolError {
    /// Check if the caller may retry the failed operation.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::PoolExhausted { .. })
    }
}
