//! XA and coordinator error types.

use thiserror::Error;

use crate::flags::codes;

/// Boxed error used for failures reported by physical resources.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors raised by an XA resource or adapter.
///
/// Every variant maps onto an X/Open XA error code (see [`XaError::code`])
/// so a coordinator can react to it the way it would to a native resource.
#[derive(Debug, Error)]
pub enum XaError {
    /// The call violates the XA protocol (wrong branch, wrong state).
    #[error("protocol violation: {message}")]
    Protocol {
        /// What went wrong.
        message: String,
    },

    /// The branch identifier is not known to the resource manager.
    #[error("unknown transaction branch {xid}")]
    UnknownBranch {
        /// Rendered branch identifier.
        xid: String,
    },

    /// A branch with the same identifier is already active.
    #[error("duplicate transaction branch {xid}")]
    DuplicateBranch {
        /// Rendered branch identifier.
        xid: String,
    },

    /// Invalid arguments were passed to the resource.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The operation is not supported by this resource.
    #[error("operation not supported: {0}")]
    Unsupported(&'static str),

    /// The branch was rolled back by the resource manager.
    #[error("transaction branch rolled back: {message}")]
    RolledBack {
        /// Rollback reason.
        message: String,
        /// Underlying failure.
        #[source]
        source: Option<BoxError>,
    },

    /// The resource manager failed while processing the call.
    #[error("resource manager error: {message}")]
    ResourceManager {
        /// Failure description.
        message: String,
        /// Underlying failure.
        #[source]
        source: Option<BoxError>,
    },
}

impl XaError {
    /// Create a protocol violation error.
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    /// Create a resource manager error wrapping a physical failure.
    pub fn resource_manager(message: impl Into<String>, source: BoxError) -> Self {
        Self::ResourceManager {
            message: message.into(),
            source: Some(source),
        }
    }

    /// The X/Open XA code corresponding to this error.
    #[must_use]
    pub fn code(&self) -> i32 {
        match self {
            Self::Protocol { .. } => codes::XAER_PROTO,
            Self::UnknownBranch { .. } => codes::XAER_NOTA,
            Self::DuplicateBranch { .. } => codes::XAER_DUPID,
            Self::InvalidArgument(_) => codes::XAER_INVAL,
            Self::Unsupported(_) => codes::XAER_RMERR,
            Self::RolledBack { .. } => codes::XA_RBROLLBACK,
            Self::ResourceManager { .. } => codes::XAER_RMERR,
        }
    }

    /// Check if this error is a fatal protocol violation.
    ///
    /// Protocol violations are never retried and always cost the
    /// connection that produced them.
    #[must_use]
    pub fn is_protocol_violation(&self) -> bool {
        matches!(
            self,
            Self::Protocol { .. } | Self::UnknownBranch { .. } | Self::DuplicateBranch { .. }
        )
    }
}

/// Errors reported by a transaction coordinator.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    /// The transaction is not known to the coordinator.
    #[error("unknown transaction {0}")]
    UnknownTransaction(String),

    /// The transaction is in a state that does not allow the operation.
    #[error("transaction {tx} is {status}")]
    IllegalState {
        /// Rendered transaction identifier.
        tx: String,
        /// Rendered transaction status.
        status: String,
    },

    /// A resource call made by the coordinator failed.
    #[error("resource failure: {0}")]
    Resource(#[from] XaError),

    /// The transaction was rolled back instead of committed.
    #[error("transaction {0} rolled back")]
    RolledBack(String),

    /// Any other coordinator failure.
    #[error("coordinator failure: {0}")]
    Other(String),
}
