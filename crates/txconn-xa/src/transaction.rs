//! Transaction coordinator contracts.
//!
//! The pool and manager never drive commit themselves. They ask a
//! [`TransactionCoordinator`] for the ambient transaction, enlist and
//! delist resources with it, and register [`Synchronization`] callbacks
//! to learn when a transaction completes.

use std::fmt;
use std::sync::Arc;

use crate::error::CoordinatorError;
use crate::flags::XaFlags;
use crate::resource::XaResource;

/// Opaque identifier of a transaction known to a coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct TxId(u64);

impl TxId {
    /// Wrap a coordinator-assigned identifier.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// The coordinator-assigned identifier.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Status of a transaction as reported by its coordinator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TxStatus {
    /// The transaction is running.
    Active,
    /// The transaction can only roll back.
    MarkedRollback,
    /// Phase one is in progress.
    Preparing,
    /// Phase one completed.
    Prepared,
    /// Phase two commit is in progress.
    Committing,
    /// The transaction committed.
    Committed,
    /// Rollback is in progress.
    RollingBack,
    /// The transaction rolled back.
    RolledBack,
    /// The coordinator cannot tell.
    Unknown,
}

impl TxStatus {
    /// Check whether work can still be done in the transaction.
    #[must_use]
    pub fn is_active(&self) -> bool {
        matches!(self, Self::Active)
    }

    /// Check whether the transaction has not reached an outcome yet.
    #[must_use]
    pub fn is_uncommitted(&self) -> bool {
        matches!(
            self,
            Self::Active | Self::MarkedRollback | Self::Preparing | Self::Prepared
        )
    }

    /// Check whether the transaction has finished, either way.
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Committed | Self::RolledBack)
    }
}

impl fmt::Display for TxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::MarkedRollback => "marked for rollback",
            Self::Preparing => "preparing",
            Self::Prepared => "prepared",
            Self::Committing => "committing",
            Self::Committed => "committed",
            Self::RollingBack => "rolling back",
            Self::RolledBack => "rolled back",
            Self::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Callback registered with a transaction to observe its completion.
pub trait Synchronization: Send + Sync {
    /// Called before the two-phase commit process starts.
    fn before_completion(&self) {}

    /// Called after the transaction committed or rolled back.
    fn after_completion(&self, status: TxStatus);
}

/// The transaction coordinator the subsystem integrates with.
pub trait TransactionCoordinator: Send + Sync {
    /// The transaction associated with the calling thread, if any.
    fn current_transaction(&self) -> Result<Option<TxId>, CoordinatorError>;

    /// Status of a transaction.
    fn status(&self, tx: &TxId) -> Result<TxStatus, CoordinatorError>;

    /// Register a completion callback with a transaction.
    fn register_synchronization(
        &self,
        tx: &TxId,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), CoordinatorError>;

    /// Enlist a resource in a transaction.
    ///
    /// Returns `false` when the coordinator refuses the resource.
    fn enlist_resource(
        &self,
        tx: &TxId,
        resource: Arc<dyn XaResource>,
    ) -> Result<bool, CoordinatorError>;

    /// Delist a resource, ending its branch with `flags`.
    fn delist_resource(
        &self,
        tx: &TxId,
        resource: &Arc<dyn XaResource>,
        flags: XaFlags,
    ) -> Result<bool, CoordinatorError>;
}
