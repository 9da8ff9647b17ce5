//! Manager error types.

use thiserror::Error;
use txconn_pool::{HandleId, PoolError};
use txconn_xa::{CoordinatorError, TxId, TxStatus, XaError};

/// Result type for manager operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Closed classification of every error the manager reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// No connection became available within the blocking timeout.
    PoolExhausted,
    /// The factory failed to create or validate a connection.
    ResourceCreationFailed,
    /// Enlistment was refused or failed; the connection was evicted.
    EnlistmentFailed,
    /// Branch mismatch, double enlistment or invalid state transition.
    ProtocolViolation,
    /// Handles were still open when a context was left in error mode.
    UnclosedConnectionsDetected,
    /// A handle is not tracked by the current context.
    UnknownConnection,
    /// The ambient transaction cannot accept work.
    TransactionNotActive,
    /// A coordinator call failed.
    Coordinator,
    /// A handle was used while closed or disconnected.
    Disconnected,
    /// The manager or its pool has been shut down.
    Shutdown,
    /// Invalid configuration values.
    Configuration,
}

/// Errors reported by the enlistment manager and association cache.
#[derive(Debug, Error)]
pub enum Error {
    /// Pool or listener failure.
    #[error(transparent)]
    Pool(#[from] PoolError),

    /// Resource adapter failure.
    #[error(transparent)]
    Xa(#[from] XaError),

    /// Coordinator failure.
    #[error(transparent)]
    Coordinator(#[from] CoordinatorError),

    /// The ambient transaction is not active.
    #[error("transaction {tx} is {status}")]
    TransactionNotActive {
        /// The ambient transaction.
        tx: TxId,
        /// Its status.
        status: TxStatus,
    },

    /// Handles were closed on behalf of the caller at context exit.
    #[error("{count} connection(s) were not closed before leaving context {context}")]
    UnclosedConnections {
        /// The context that was left.
        context: String,
        /// Number of handles closed.
        count: usize,
    },

    /// A handle is not tracked under the current context.
    #[error("connection {handle} is not tracked by '{manager}' in the current context")]
    UnknownConnection {
        /// The handle.
        handle: HandleId,
        /// Manager name.
        manager: String,
    },

    /// The handle is not associated with a connection.
    #[error("connection handle {0} is disconnected")]
    Disconnected(HandleId),

    /// The handle has been closed.
    #[error("connection handle {0} is closed")]
    Closed(HandleId),

    /// The manager has been shut down.
    #[error("connection manager '{0}' is shut down")]
    Shutdown(String),

    /// Protocol misuse detected by the manager or cache.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    /// Classify the error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Pool(e) => match e {
                PoolError::PoolExhausted { .. } => ErrorKind::PoolExhausted,
                PoolError::ResourceCreationFailed { .. } => ErrorKind::ResourceCreationFailed,
                PoolError::PoolClosed => ErrorKind::Shutdown,
                PoolError::Config(_) => ErrorKind::Configuration,
                PoolError::AlreadyEnlisted { .. } | PoolError::InvalidTransition { .. } => {
                    ErrorKind::ProtocolViolation
                }
                PoolError::EnlistmentFailed { .. } => ErrorKind::EnlistmentFailed,
                PoolError::DelistFailed { .. } => ErrorKind::Coordinator,
            },
            Self::Xa(e) if e.is_protocol_violation() => ErrorKind::ProtocolViolation,
            Self::Xa(XaError::InvalidArgument(_)) => ErrorKind::Configuration,
            Self::Xa(_) | Self::Coordinator(_) => ErrorKind::Coordinator,
            Self::TransactionNotActive { .. } => ErrorKind::TransactionNotActive,
            Self::UnclosedConnections { .. } => ErrorKind::UnclosedConnectionsDetected,
            Self::UnknownConnection { .. } => ErrorKind::UnknownConnection,
            Self::Disconnected(_) | Self::Closed(_) => ErrorKind::Disconnected,
            Self::Shutdown(_) => ErrorKind::Shutdown,
            Self::Protocol(_) => ErrorKind::ProtocolViolation,
            Self::Config(_) => ErrorKind::Configuration,
        }
    }

    /// Check if the caller may retry after backing off.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.kind() == ErrorKind::PoolExhausted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_error_kinds() {
        let exhausted: Error = PoolError::PoolExhausted {
            pool: "p".into(),
            timeout: Duration::from_millis(1),
        }
        .into();
        assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);
        assert!(exhausted.is_retryable());

        let closed: Error = PoolError::PoolClosed.into();
        assert_eq!(closed.kind(), ErrorKind::Shutdown);
        assert!(!closed.is_retryable());
    }

    #[test]
    fn test_xa_error_kinds() {
        let protocol: Error = XaError::protocol("wrong branch").into();
        assert_eq!(protocol.kind(), ErrorKind::ProtocolViolation);

        let rm: Error = XaError::resource_manager("boom", "io".into()).into();
        assert_eq!(rm.kind(), ErrorKind::Coordinator);
    }

    #[test]
    fn test_misc_kinds() {
        assert_eq!(
            Error::UnclosedConnections {
                context: "k".into(),
                count: 1
            }
            .kind(),
            ErrorKind::UnclosedConnectionsDetected
        );
        assert_eq!(
            Error::Closed(HandleId::next()).kind(),
            ErrorKind::Disconnected
        );
        assert_eq!(
            Error::TransactionNotActive {
                tx: TxId::from_raw(1),
                status: TxStatus::MarkedRollback
            }
            .to_string(),
            "transaction tx-1 is marked for rollback"
        );
    }
}
