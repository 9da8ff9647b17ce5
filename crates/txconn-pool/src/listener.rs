//! Per-connection listener.
//!
//! A [`ConnectionListener`] wraps exactly one physical connection and
//! tracks who is using it: the open handles, the transaction it is
//! enlisted in, and whether it is headed for destruction. Handle set and
//! enlistment state live under one lock so "free" is never observed
//! half-updated.
//!
//! Enlistment is an explicit state machine:
//!
//! ```text
//! Free -> Enlisting(tx) -> Enlisted(tx) -> Delisting(tx) -> Free
//! ```
//!
//! Invalid transitions are rejected with a typed error.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::OnceCell;
use parking_lot::Mutex;
use smallvec::SmallVec;
use txconn_xa::{TransactionCoordinator, TxId, XaFlags, XaResource};

use crate::error::PoolError;
use crate::lifecycle::{ManagedConnection, RequestKey};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of a listener, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    /// Wrap a raw identifier.
    #[must_use]
    pub const fn from_raw(id: u64) -> Self {
        Self(id)
    }

    /// The raw identifier.
    #[must_use]
    pub const fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cl-{}", self.0)
    }
}

/// Identifier of a caller-visible connection handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h-{}", self.0)
    }
}

/// Transaction association of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnlistmentState {
    /// Not associated with any transaction.
    Free,
    /// Enlistment with the coordinator is in progress.
    Enlisting(TxId),
    /// Enlisted in a transaction.
    Enlisted(TxId),
    /// Delistment from the coordinator is in progress.
    Delisting(TxId),
}

impl EnlistmentState {
    /// The transaction this state refers to.
    #[must_use]
    pub fn transaction(&self) -> Option<TxId> {
        match self {
            Self::Free => None,
            Self::Enlisting(tx) | Self::Enlisted(tx) | Self::Delisting(tx) => Some(*tx),
        }
    }
}

impl fmt::Display for EnlistmentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Free => f.write_str("free"),
            Self::Enlisting(tx) => write!(f, "enlisting in {tx}"),
            Self::Enlisted(tx) => write!(f, "enlisted in {tx}"),
            Self::Delisting(tx) => write!(f, "delisting from {tx}"),
        }
    }
}

/// Whether a listener may be recycled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    /// In service.
    Normal,
    /// Destroy instead of recycling on return.
    Destroy,
    /// The physical connection has been destroyed.
    Destroyed,
}

/// Outcome of [`ConnectionListener::unregister_handle`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleRelease {
    /// The last handle went away and the listener is free.
    Freed,
    /// Other handles or a transaction still hold the listener.
    InUse,
    /// The handle was not registered.
    Unknown,
}

#[derive(Debug)]
struct ListenerState {
    handles: SmallVec<[HandleId; 4]>,
    enlistment: EnlistmentState,
    lifecycle: Lifecycle,
    track_by_tx: Option<TxId>,
    checked_out: bool,
    last_used: Instant,
}

impl ListenerState {
    fn is_free(&self) -> bool {
        self.handles.is_empty()
            && self.enlistment == EnlistmentState::Free
            && self.track_by_tx.is_none()
    }
}

/// Wraps one physical connection and tracks its usage.
pub struct ConnectionListener<C> {
    id: ListenerId,
    pool_id: u64,
    pool_name: Arc<str>,
    connection: Arc<C>,
    request_key: RequestKey,
    resource: OnceCell<Arc<dyn XaResource>>,
    created_at: Instant,
    state: Mutex<ListenerState>,
}

impl<C: ManagedConnection> ConnectionListener<C> {
    pub(crate) fn new(
        id: ListenerId,
        pool_id: u64,
        pool_name: Arc<str>,
        connection: C,
        request_key: RequestKey,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            pool_id,
            pool_name,
            connection: Arc::new(connection),
            request_key,
            resource: OnceCell::new(),
            created_at: now,
            state: Mutex::new(ListenerState {
                handles: SmallVec::new(),
                enlistment: EnlistmentState::Free,
                lifecycle: Lifecycle::Normal,
                track_by_tx: None,
                checked_out: false,
                last_used: now,
            }),
        }
    }

    /// Listener identifier.
    #[must_use]
    pub fn id(&self) -> ListenerId {
        self.id
    }

    /// Identifier of the owning pool.
    #[must_use]
    pub fn pool_id(&self) -> u64 {
        self.pool_id
    }

    /// Name of the owning pool.
    #[must_use]
    pub fn pool_name(&self) -> &str {
        &self.pool_name
    }

    /// The physical connection.
    #[must_use]
    pub fn connection(&self) -> &Arc<C> {
        &self.connection
    }

    /// The request key the connection was created for.
    #[must_use]
    pub fn request_key(&self) -> &RequestKey {
        &self.request_key
    }

    /// When the physical connection was created.
    #[must_use]
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// The attached transactional resource.
    #[must_use]
    pub fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.resource.get().cloned()
    }

    /// Attach a transactional resource, building it with `init` on first
    /// use. Later calls return the resource already attached.
    pub fn attach_resource<E>(
        &self,
        init: impl FnOnce() -> Result<Arc<dyn XaResource>, E>,
    ) -> Result<Arc<dyn XaResource>, E> {
        self.resource.get_or_try_init(init).cloned()
    }

    /// Current enlistment state.
    #[must_use]
    pub fn enlistment(&self) -> EnlistmentState {
        self.state.lock().enlistment
    }

    /// Check whether the listener is enlisted in `tx`.
    #[must_use]
    pub fn is_enlisted_in(&self, tx: &TxId) -> bool {
        self.state.lock().enlistment == EnlistmentState::Enlisted(*tx)
    }

    /// Enlist the attached resource in `tx`.
    ///
    /// Only a `Free` listener can be enlisted; anything else fails with
    /// [`PoolError::AlreadyEnlisted`] or [`PoolError::InvalidTransition`].
    /// When the coordinator refuses or fails, the listener returns to
    /// `Free` and is marked for destruction.
    pub fn enlist(
        &self,
        coordinator: &dyn TransactionCoordinator,
        tx: &TxId,
    ) -> Result<(), PoolError> {
        let resource = {
            let mut state = self.state.lock();
            if state.lifecycle != Lifecycle::Normal {
                return Err(self.invalid("enlist", "marked for destruction"));
            }
            match state.enlistment {
                EnlistmentState::Free => {}
                EnlistmentState::Enlisted(current) => {
                    return Err(PoolError::AlreadyEnlisted {
                        listener: self.id,
                        tx: current,
                    });
                }
                other => return Err(self.invalid("enlist", other.to_string())),
            }
            let Some(resource) = self.resource.get().cloned() else {
                return Err(self.invalid("enlist", "without a transactional resource"));
            };
            state.enlistment = EnlistmentState::Enlisting(*tx);
            resource
        };

        let failure = match coordinator.enlist_resource(tx, resource) {
            Ok(true) => None,
            Ok(false) => Some(("coordinator refused the resource".to_string(), None)),
            Err(e) => Some((e.to_string(), Some(e))),
        };

        let mut state = self.state.lock();
        match failure {
            None => {
                state.enlistment = EnlistmentState::Enlisted(*tx);
                tracing::debug!(pool = %self.pool_name, listener = %self.id, tx = %tx, "enlisted");
                Ok(())
            }
            Some((reason, source)) => {
                state.enlistment = EnlistmentState::Free;
                state.lifecycle = Lifecycle::Destroy;
                tracing::warn!(
                    pool = %self.pool_name,
                    listener = %self.id,
                    tx = %tx,
                    reason = %reason,
                    "enlistment failed"
                );
                Err(PoolError::EnlistmentFailed {
                    listener: self.id,
                    tx: *tx,
                    reason,
                    source,
                })
            }
        }
    }

    /// End the listener's branch with the coordinator.
    ///
    /// A listener tracked by its transaction stays enlisted until the
    /// transaction completes, so this is a no-op for it; a `Free`
    /// listener has nothing to end. The branch ends with `SUCCESS` while
    /// the transaction is active and `FAIL` otherwise. A failed delist
    /// frees the listener and marks it for destruction.
    pub fn delist(&self, coordinator: &dyn TransactionCoordinator) -> Result<(), PoolError> {
        let tx = {
            let mut state = self.state.lock();
            if state.track_by_tx.is_some() {
                return Ok(());
            }
            match state.enlistment {
                EnlistmentState::Free => return Ok(()),
                EnlistmentState::Enlisted(tx) => {
                    state.enlistment = EnlistmentState::Delisting(tx);
                    tx
                }
                other => return Err(self.invalid("delist", other.to_string())),
            }
        };

        let flags = match coordinator.status(&tx) {
            Ok(status) if status.is_active() => XaFlags::SUCCESS,
            _ => XaFlags::FAIL,
        };

        let failure = match self.resource.get() {
            None => Some(("no transactional resource attached".to_string(), None)),
            Some(resource) => match coordinator.delist_resource(&tx, resource, flags) {
                Ok(true) => None,
                Ok(false) => Some(("coordinator refused the delist".to_string(), None)),
                Err(e) => Some((e.to_string(), Some(e))),
            },
        };

        let mut state = self.state.lock();
        if state.enlistment == EnlistmentState::Delisting(tx) {
            state.enlistment = EnlistmentState::Free;
        }
        match failure {
            None => {
                tracing::debug!(pool = %self.pool_name, listener = %self.id, tx = %tx, ?flags, "delisted");
                Ok(())
            }
            Some((reason, source)) => {
                state.lifecycle = Lifecycle::Destroy;
                Err(PoolError::DelistFailed {
                    listener: self.id,
                    tx,
                    reason,
                    source,
                })
            }
        }
    }

    /// Reset transaction state after `tx` completed.
    ///
    /// Returns `true` when this released the listener's transaction
    /// association and left it free. Completions of other transactions
    /// are ignored.
    pub fn transaction_completed(&self, tx: &TxId) -> bool {
        let mut state = self.state.lock();
        let mut changed = false;
        if state.enlistment.transaction() == Some(*tx) {
            state.enlistment = EnlistmentState::Free;
            changed = true;
        }
        if state.track_by_tx == Some(*tx) {
            state.track_by_tx = None;
            changed = true;
        }
        if changed {
            tracing::trace!(pool = %self.pool_name, listener = %self.id, tx = %tx, "transaction completed");
        }
        changed && state.is_free()
    }

    /// Bind the listener to a transaction until it completes.
    pub fn set_track_by_tx(&self, tx: Option<TxId>) {
        self.state.lock().track_by_tx = tx;
    }

    /// The transaction owning this listener, if tracked by transaction.
    #[must_use]
    pub fn track_by_tx(&self) -> Option<TxId> {
        self.state.lock().track_by_tx
    }

    /// Record a new handle on the connection.
    ///
    /// Returns `false` if the handle was already registered.
    pub fn register_handle(&self, handle: HandleId) -> bool {
        let mut state = self.state.lock();
        if state.handles.contains(&handle) {
            return false;
        }
        state.handles.push(handle);
        true
    }

    /// Remove a handle from the connection.
    pub fn unregister_handle(&self, handle: HandleId) -> HandleRelease {
        let mut state = self.state.lock();
        let Some(pos) = state.handles.iter().position(|h| *h == handle) else {
            return HandleRelease::Unknown;
        };
        state.handles.swap_remove(pos);
        if state.is_free() {
            HandleRelease::Freed
        } else {
            HandleRelease::InUse
        }
    }

    /// Number of open handles.
    #[must_use]
    pub fn handle_count(&self) -> usize {
        self.state.lock().handles.len()
    }

    /// Check whether `handle` is registered.
    #[must_use]
    pub fn has_handle(&self, handle: HandleId) -> bool {
        self.state.lock().handles.contains(&handle)
    }

    /// No handles, no enlistment and no transaction binding.
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.state.lock().is_free()
    }

    /// Claim the right to return a free, checked-out listener to its pool.
    ///
    /// Succeeds at most once per checkout, so concurrent closers and
    /// transaction completions cannot return it twice.
    pub fn claim_return(&self) -> bool {
        let mut state = self.state.lock();
        if state.checked_out && state.is_free() {
            state.checked_out = false;
            true
        } else {
            false
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    /// Mark the listener to be destroyed instead of recycled.
    pub fn mark_destroy(&self) {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Normal {
            state.lifecycle = Lifecycle::Destroy;
        }
    }

    /// Check whether the listener must not be recycled.
    #[must_use]
    pub fn should_destroy(&self) -> bool {
        self.state.lock().lifecycle != Lifecycle::Normal
    }

    /// Check whether the physical connection has been destroyed.
    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.state.lock().lifecycle == Lifecycle::Destroyed
    }

    /// How long the listener has been unused.
    #[must_use]
    pub fn idle_for(&self) -> Duration {
        self.state.lock().last_used.elapsed()
    }

    /// Transition to `Destroyed`. Returns `false` if already destroyed.
    pub(crate) fn mark_destroyed(&self) -> bool {
        let mut state = self.state.lock();
        if state.lifecycle == Lifecycle::Destroyed {
            return false;
        }
        state.lifecycle = Lifecycle::Destroyed;
        state.checked_out = false;
        true
    }

    pub(crate) fn on_checkout(&self) {
        let mut state = self.state.lock();
        state.checked_out = true;
        state.last_used = Instant::now();
    }

    pub(crate) fn touch(&self) {
        let mut state = self.state.lock();
        state.checked_out = false;
        state.last_used = Instant::now();
    }

    fn invalid(&self, operation: &'static str, state: impl Into<String>) -> PoolError {
        PoolError::InvalidTransition {
            listener: self.id,
            operation,
            state: state.into(),
        }
    }
}

impl<C> fmt::Debug for ConnectionListener<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("id", &self.id)
            .field("pool", &self.pool_name)
            .field("request_key", &self.request_key)
            .field("state", &*self.state.lock())
            .finish_non_exhaustive()
    }
}
