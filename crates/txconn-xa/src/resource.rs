//! Resource-side contracts of the XA protocol.
//!
//! [`XaResource`] is what a transaction coordinator drives during
//! two-phase commit. [`LocalTransaction`] is the simpler begin/commit/
//! rollback contract of a connection that cannot take part in two-phase
//! commit on its own; [`crate::LocalXaResource`] bridges the two.

use std::time::Duration;

use crate::error::{BoxError, XaError};
use crate::flags::{Vote, XaFlags};
use crate::xid::Xid;

/// A resource that can be enlisted in a distributed transaction.
///
/// All methods take `&self`: a resource is shared between the connection
/// that owns it and the coordinator that drives it, so implementations
/// use interior mutability for their branch state.
pub trait XaResource: Send + Sync {
    /// Associate the resource with a transaction branch.
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError>;

    /// Dissociate the resource from a transaction branch.
    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError>;

    /// Ask the resource to prepare the branch for commit.
    fn prepare(&self, xid: &Xid) -> Result<Vote, XaError>;

    /// Commit the branch, in one phase when `one_phase` is set.
    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError>;

    /// Roll back the branch.
    fn rollback(&self, xid: &Xid) -> Result<(), XaError>;

    /// Forget a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> Result<(), XaError>;

    /// List prepared branches during recovery.
    fn recover(&self, flags: XaFlags) -> Result<Vec<Xid>, XaError>;

    /// Check whether `other` talks to the same resource manager.
    ///
    /// Coordinators use this to join branches instead of starting new ones.
    fn is_same_rm(&self, other: &dyn XaResource) -> Result<bool, XaError>;

    /// Current transaction timeout. Zero means the resource default.
    fn transaction_timeout(&self) -> Result<Duration, XaError> {
        Ok(Duration::ZERO)
    }

    /// Set the transaction timeout, returning whether it was accepted.
    fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool, XaError> {
        let _ = timeout;
        Ok(false)
    }

    /// The native resource behind an adapter, if this is one.
    fn wrapped(&self) -> Option<&dyn XaResource> {
        None
    }
}

/// Resource-local transaction control offered by a physical connection.
pub trait LocalTransaction: Send + Sync {
    /// Begin a local transaction.
    fn begin(&self) -> Result<(), BoxError>;

    /// Commit the local transaction.
    fn commit(&self) -> Result<(), BoxError>;

    /// Roll back the local transaction.
    fn rollback(&self) -> Result<(), BoxError>;
}

/// Receives notification when a resource fails in a way that makes its
/// connection unusable.
pub trait FailureListener: Send + Sync {
    /// Called after a resource failure, before the error is returned to
    /// the coordinator.
    fn resource_failed(&self, error: &XaError);
}

/// Strip adapter layers off a resource.
#[must_use]
pub fn unwrap_resource(resource: &dyn XaResource) -> &dyn XaResource {
    let mut current = resource;
    while let Some(inner) = current.wrapped() {
        current = inner;
    }
    current
}

/// Identity comparison of two resources, ignoring vtables.
#[must_use]
pub fn same_resource(a: &dyn XaResource, b: &dyn XaResource) -> bool {
    std::ptr::addr_eq(a, b)
}
