//! Caller-visible connection handles.
//!
//! A [`ConnectionHandle`] is what `get_connection` hands out. Several
//! handles can share one pooled connection, and the connection behind a
//! handle can change: when the association cache disconnects a context
//! the handle is detached, and on reconnection it is re-pointed at
//! whatever listener serves its request key.

use std::any::Any;
use std::backtrace::Backtrace;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use txconn_pool::{HandleId, Listener, ManagedConnectionFactory, RequestKey};

use crate::error::{Error, Result};
use crate::manager::EnlistmentManager;

/// A handle the association cache can track and close.
///
/// Every handle type registered with the cache must implement this, so
/// leaked handles can always be closed on the caller's behalf.
pub trait TrackedHandle: Send + Sync {
    /// Handle identifier.
    fn handle_id(&self) -> HandleId;

    /// Check whether the handle has been closed.
    fn is_closed(&self) -> bool;

    /// Check whether the handle currently points at a connection.
    fn is_connected(&self) -> bool;

    /// Close the handle without unregistering it from the cache.
    fn force_close(&self);

    /// Where the handle was allocated, when captured.
    fn allocation_trace(&self) -> Option<&Backtrace>;

    /// Downcast support for the owning manager.
    fn as_any(&self) -> &dyn Any;
}

/// Shared state of one handle, referenced by the handle itself and by
/// the association cache.
pub(crate) struct HandleSlot<F: ManagedConnectionFactory> {
    id: HandleId,
    request_key: RequestKey,
    listener: Mutex<Option<Arc<Listener<F>>>>,
    closed: AtomicBool,
    manager: Weak<EnlistmentManager<F>>,
    trace: Option<Backtrace>,
}

impl<F: ManagedConnectionFactory> HandleSlot<F> {
    pub(crate) fn new(
        request_key: RequestKey,
        listener: Arc<Listener<F>>,
        manager: Weak<EnlistmentManager<F>>,
        capture_trace: bool,
    ) -> Self {
        Self {
            id: HandleId::next(),
            request_key,
            listener: Mutex::new(Some(listener)),
            closed: AtomicBool::new(false),
            manager,
            trace: capture_trace.then(Backtrace::force_capture),
        }
    }

    pub(crate) fn id(&self) -> HandleId {
        self.id
    }

    pub(crate) fn request_key(&self) -> &RequestKey {
        &self.request_key
    }

    pub(crate) fn listener(&self) -> Option<Arc<Listener<F>>> {
        self.listener.lock().clone()
    }

    pub(crate) fn attach(&self, listener: Arc<Listener<F>>) {
        *self.listener.lock() = Some(listener);
    }

    pub(crate) fn detach(&self) -> Option<Arc<Listener<F>>> {
        self.listener.lock().take()
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Close once. Later calls are no-ops.
    pub(crate) fn close(&self, unregister_from_cache: bool) -> Result<()> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.manager.upgrade() {
            Some(manager) => manager.handle_closed(self, unregister_from_cache),
            None => {
                if let Some(listener) = self.detach() {
                    listener.unregister_handle(self.id);
                }
                Ok(())
            }
        }
    }
}

impl<F: ManagedConnectionFactory> TrackedHandle for HandleSlot<F> {
    fn handle_id(&self) -> HandleId {
        self.id
    }

    fn is_closed(&self) -> bool {
        HandleSlot::is_closed(self)
    }

    fn is_connected(&self) -> bool {
        self.listener.lock().is_some()
    }

    fn force_close(&self) {
        if let Err(e) = self.close(false) {
            tracing::warn!(handle = %self.id, error = %e, "error closing connection handle");
        }
    }

    fn allocation_trace(&self) -> Option<&Backtrace> {
        self.trace.as_ref()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// A caller's view of a pooled connection.
///
/// Dropping the handle closes it.
pub struct ConnectionHandle<F: ManagedConnectionFactory> {
    slot: Arc<HandleSlot<F>>,
}

impl<F: ManagedConnectionFactory> ConnectionHandle<F> {
    pub(crate) fn new(slot: Arc<HandleSlot<F>>) -> Self {
        Self { slot }
    }

    /// Handle identifier.
    #[must_use]
    pub fn id(&self) -> HandleId {
        self.slot.id
    }

    /// The request key the handle was obtained with.
    #[must_use]
    pub fn request_key(&self) -> &RequestKey {
        &self.slot.request_key
    }

    /// The physical connection currently behind the handle.
    pub fn connection(&self) -> Result<Arc<F::Connection>> {
        if self.slot.is_closed() {
            return Err(Error::Closed(self.slot.id));
        }
        self.slot
            .listener()
            .map(|listener| Arc::clone(listener.connection()))
            .ok_or(Error::Disconnected(self.slot.id))
    }

    /// The listener currently behind the handle.
    #[must_use]
    pub fn listener(&self) -> Option<Arc<Listener<F>>> {
        self.slot.listener()
    }

    /// Check whether the handle has been closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.slot.is_closed()
    }

    /// Check whether the handle currently points at a connection.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        !self.slot.is_closed() && self.slot.listener.lock().is_some()
    }

    /// Where the handle was allocated (debug mode only).
    #[must_use]
    pub fn allocation_trace(&self) -> Option<&Backtrace> {
        self.slot.trace.as_ref()
    }

    /// The cache-facing view of this handle.
    #[must_use]
    pub fn tracked(&self) -> Arc<dyn TrackedHandle> {
        Arc::clone(&self.slot) as Arc<dyn TrackedHandle>
    }

    /// Close the handle, returning the connection once no other handle
    /// or transaction holds it.
    pub fn close(self) -> Result<()> {
        self.slot.close(true)
    }
}

impl<F: ManagedConnectionFactory> Drop for ConnectionHandle<F> {
    fn drop(&mut self) {
        if self.slot.is_closed() {
            return;
        }
        if let Err(e) = self.slot.close(true) {
            tracing::warn!(handle = %self.slot.id, error = %e, "error closing dropped connection handle");
        }
    }
}

impl<F: ManagedConnectionFactory> fmt::Debug for ConnectionHandle<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.slot.id)
            .field("request_key", &self.slot.request_key)
            .field("closed", &self.slot.is_closed())
            .field(
                "listener",
                &self.slot.listener.lock().as_ref().map(|l| l.id()),
            )
            .finish()
    }
}
