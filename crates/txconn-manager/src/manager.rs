//! Transactional connection manager.
//!
//! The [`EnlistmentManager`] sits between callers and the [`Pool`]. It
//! hands out [`ConnectionHandle`]s, attaches a transactional resource to
//! each pooled connection, enlists it in the caller's transaction and
//! returns it to the pool once no handle and no transaction holds it.
//!
//! When interleaving is disabled, a connection enlisted in a transaction
//! stays bound to that transaction until it completes: every request in
//! the transaction with the same request key shares it, and closing the
//! last handle does not return it early.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use smallvec::SmallVec;
use txconn_pool::{
    HandleRelease, Listener, ListenerId, ManagedConnection, ManagedConnectionFactory, Pool,
    PoolError, RequestKey, WeakPool,
};
use txconn_xa::{
    FailureListener, LocalXaResource, Synchronization, TransactionCoordinator, TxId, TxStatus,
    WrapperConfig, XaError, XaResource, XaResourceWrapper,
};

use crate::cache::{AssociationCache, ConnectionCacheListener, ConnectionRecord, ManagerId};
use crate::config::{ManagerConfig, TransactionSupport};
use crate::error::{Error, Result};
use crate::handle::{ConnectionHandle, HandleSlot};

/// Hands out pooled connections enlisted in the caller's transaction.
pub struct EnlistmentManager<F: ManagedConnectionFactory> {
    id: ManagerId,
    this: Weak<Self>,
    config: ManagerConfig,
    pool: Pool<F>,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    cache: Option<Arc<AssociationCache>>,
    shutdown: AtomicBool,
}

impl<F: ManagedConnectionFactory> EnlistmentManager<F> {
    /// Create a builder for a manager over `pool`.
    #[must_use]
    pub fn builder(pool: Pool<F>) -> ManagerBuilder<F> {
        ManagerBuilder::new(pool)
    }

    /// Manager identifier.
    #[must_use]
    pub fn id(&self) -> ManagerId {
        self.id
    }

    /// The manager configuration.
    #[must_use]
    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The underlying pool.
    #[must_use]
    pub fn pool(&self) -> &Pool<F> {
        &self.pool
    }

    /// The association cache, if any.
    #[must_use]
    pub fn cache(&self) -> Option<&Arc<AssociationCache>> {
        self.cache.as_ref()
    }

    /// Check whether the manager has been shut down.
    #[must_use]
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Get a handle to a connection serving `key`.
    ///
    /// Inside an active transaction the connection is enlisted before the
    /// handle is returned; when that fails the connection is evicted and
    /// no handle is returned.
    pub fn get_connection(&self, key: &RequestKey) -> Result<ConnectionHandle<F>> {
        if self.is_shutdown() {
            return Err(Error::Shutdown(self.config.name.clone()));
        }

        let tx = self.ambient_transaction()?;
        let listener = self.allocate(key, tx)?;

        if let Err(e) = self.enlist_if_needed(&listener, key, tx) {
            if listener.handle_count() == 0 {
                self.pool.evict(&listener);
            }
            return Err(e);
        }

        let capture_trace = self.cache.as_ref().is_some_and(|c| c.config().debug);
        let slot = Arc::new(HandleSlot::new(
            key.clone(),
            Arc::clone(&listener),
            self.this.clone(),
            capture_trace,
        ));
        listener.register_handle(slot.id());

        if let (Some(cache), Some(this)) = (&self.cache, self.this.upgrade()) {
            let record = ConnectionRecord::new(Arc::clone(&slot) as _, key.clone());
            cache.register_connection(this, record);
        }

        tracing::trace!(
            manager = %self.config.name,
            listener = %listener.id(),
            handle = %slot.id(),
            tx = ?tx,
            "connection handed out"
        );
        Ok(ConnectionHandle::new(slot))
    }

    /// Give a listener back.
    ///
    /// With `force_destroy` the physical connection is destroyed.
    /// Otherwise the listener returns to the pool once nothing holds it.
    /// Listeners owned by another pool are always destroyed.
    pub fn return_connection(&self, listener: &Arc<Listener<F>>, force_destroy: bool) {
        if listener.pool_id() != self.pool.id() {
            self.pool.release(listener);
            return;
        }

        if force_destroy {
            listener.mark_destroy();
            self.pool.evict(listener);
            return;
        }

        if listener.claim_return() {
            self.pool.release(listener);
        } else {
            tracing::trace!(manager = %self.config.name, listener = %listener.id(), "connection still in use, not returned");
        }
    }

    /// Stop handing out connections, drop cached associations and close
    /// the pool.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(cache) = &self.cache {
            cache.unregister_manager(self.id);
        }
        self.pool.close();
        tracing::info!(manager = %self.config.name, "connection manager shut down");
    }

    /// The transaction new connections should be enlisted in.
    fn ambient_transaction(&self) -> Result<Option<TxId>> {
        if self.config.transaction_support == TransactionSupport::NoTransaction {
            return Ok(None);
        }
        let Some(coordinator) = &self.coordinator else {
            return Ok(None);
        };
        let Some(tx) = coordinator.current_transaction()? else {
            return Ok(None);
        };

        match coordinator.status(&tx)? {
            status if status.is_active() => Ok(Some(tx)),
            TxStatus::MarkedRollback if self.config.allow_marked_for_rollback => {
                tracing::debug!(manager = %self.config.name, tx = %tx, "transaction marked for rollback, not enlisting");
                Ok(None)
            }
            status => Err(Error::TransactionNotActive { tx, status }),
        }
    }

    fn allocate(&self, key: &RequestKey, tx: Option<TxId>) -> Result<Arc<Listener<F>>> {
        if !self.config.interleaving {
            if let Some(listener) = tx.and_then(|tx| self.pool.find_transaction_bound(tx, key)) {
                tracing::trace!(manager = %self.config.name, listener = %listener.id(), "reusing transaction-bound connection");
                return Ok(listener);
            }
        }

        let listener = self.acquire_with_retry(key)?;
        if let Err(e) = self.attach_resource(&listener) {
            tracing::warn!(manager = %self.config.name, listener = %listener.id(), error = %e, "could not attach transactional resource");
            self.pool.evict(&listener);
            return Err(e);
        }
        Ok(listener)
    }

    fn acquire_with_retry(&self, key: &RequestKey) -> Result<Arc<Listener<F>>> {
        let mut attempt = 0;
        loop {
            match self.pool.acquire(key) {
                Ok(listener) => return Ok(listener),
                Err(
                    e @ (PoolError::PoolExhausted { .. } | PoolError::ResourceCreationFailed { .. }),
                ) if attempt < self.config.allocation_retry => {
                    attempt += 1;
                    tracing::debug!(
                        manager = %self.config.name,
                        attempt,
                        error = %e,
                        "allocation failed, retrying"
                    );
                    if !self.config.allocation_retry_wait.is_zero() {
                        std::thread::sleep(self.config.allocation_retry_wait);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    fn attach_resource(&self, listener: &Arc<Listener<F>>) -> Result<()> {
        if listener.xa_resource().is_some() {
            return Ok(());
        }

        let connection = listener.connection();
        let resource: Arc<dyn XaResource> = match self.config.transaction_support {
            TransactionSupport::NoTransaction => return Ok(()),
            TransactionSupport::LocalTransaction => {
                let Some(local) = connection.local_transaction() else {
                    tracing::debug!(manager = %self.config.name, listener = %listener.id(), "connection offers no local transaction");
                    return Ok(());
                };
                let adapter =
                    LocalXaResource::new(format!("{}/{}", self.config.name, listener.id()), local);
                adapter.set_failure_listener(Box::new(EvictOnFailure {
                    pool: self.pool.downgrade(),
                    listener: Arc::downgrade(listener),
                }));
                Arc::new(adapter) as Arc<dyn XaResource>
            }
            TransactionSupport::XaTransaction => {
                let Some(native) = connection.xa_resource() else {
                    tracing::debug!(manager = %self.config.name, listener = %listener.id(), "connection offers no XA resource");
                    return Ok(());
                };
                if self.config.wrap_xa_resource {
                    let wrapper = XaResourceWrapper::new(native, self.wrapper_config(connection))?;
                    wrapper.set_failure_listener(Box::new(EvictOnFailure {
                        pool: self.pool.downgrade(),
                        listener: Arc::downgrade(listener),
                    }));
                    Arc::new(wrapper) as Arc<dyn XaResource>
                } else {
                    native
                }
            }
        };

        if let Some(timeout) = self.config.xa_resource_timeout {
            if !resource.set_transaction_timeout(timeout)? {
                tracing::debug!(manager = %self.config.name, listener = %listener.id(), ?timeout, "resource rejected transaction timeout");
            }
        }

        listener.attach_resource(|| Ok::<_, Error>(resource))?;
        Ok(())
    }

    fn wrapper_config(&self, connection: &F::Connection) -> WrapperConfig {
        let config = WrapperConfig::new(self.config.name.clone())
            .pad_xid(self.config.pad_xid)
            .same_rm_override(self.config.same_rm_override);
        match connection.metadata() {
            Some(product) => config.product(product.name, product.version),
            None => WrapperConfig {
                product_name: Some(self.config.name.clone()),
                ..config
            },
        }
    }

    /// Enlist `listener` in `tx` unless it already is.
    fn enlist_if_needed(
        &self,
        listener: &Arc<Listener<F>>,
        key: &RequestKey,
        tx: Option<TxId>,
    ) -> Result<()> {
        let (Some(tx), Some(coordinator)) = (tx, &self.coordinator) else {
            return Ok(());
        };
        if listener.xa_resource().is_none() || listener.is_enlisted_in(&tx) {
            return Ok(());
        }

        if let Err(e) = listener.enlist(coordinator.as_ref(), &tx) {
            if !matches!(e, PoolError::AlreadyEnlisted { .. }) {
                self.pool.evict(listener);
            }
            return Err(e.into());
        }

        let sync = Arc::new(TxCompletion {
            manager: self.this.clone(),
            listener: Arc::clone(listener),
            tx,
            key: key.clone(),
        });
        if let Err(e) = coordinator.register_synchronization(&tx, sync) {
            tracing::warn!(manager = %self.config.name, listener = %listener.id(), tx = %tx, error = %e, "could not register completion callback");
            if let Err(delist) = listener.delist(coordinator.as_ref()) {
                tracing::debug!(listener = %listener.id(), error = %delist, "delist after failed registration failed");
            }
            self.pool.evict(listener);
            return Err(PoolError::EnlistmentFailed {
                listener: listener.id(),
                tx,
                reason: e.to_string(),
                source: Some(e),
            }
            .into());
        }

        if !self.config.interleaving {
            listener.set_track_by_tx(Some(tx));
            self.pool.bind_transaction(tx, key.clone(), listener);
        }
        Ok(())
    }

    fn transaction_completed(
        &self,
        listener: &Arc<Listener<F>>,
        tx: TxId,
        key: &RequestKey,
        status: TxStatus,
    ) {
        if !self.config.interleaving {
            self.pool.unbind_transaction(tx, key);
        }
        let freed = listener.transaction_completed(&tx);
        tracing::trace!(manager = %self.config.name, listener = %listener.id(), tx = %tx, %status, freed, "transaction completed");
        if freed && listener.claim_return() {
            self.pool.release(listener);
        }
    }

    /// The last handle on `listener` went away: delist it and, when
    /// nothing else holds it, return it to the pool.
    ///
    /// Delist failures are logged; they are only returned when
    /// `error_strict` is set.
    pub fn managed_connection_disconnected(&self, listener: &Arc<Listener<F>>) -> Result<()> {
        let mut failure = None;
        if let Some(coordinator) = &self.coordinator {
            if let Err(e) = listener.delist(coordinator.as_ref()) {
                tracing::warn!(manager = %self.config.name, listener = %listener.id(), error = %e, "delist failed");
                failure = Some(e);
            }
        }

        if listener.claim_return() || listener.is_destroyed() {
            self.pool.release(listener);
        }

        match failure {
            Some(e) if self.config.error_strict => Err(e.into()),
            _ => Ok(()),
        }
    }

    /// `listener` was picked up again for a reconnecting context: enlist
    /// it in the current transaction. On failure it is disconnected again.
    pub fn managed_connection_reconnected(
        &self,
        listener: &Arc<Listener<F>>,
        key: &RequestKey,
        tx: Option<TxId>,
    ) -> Result<()> {
        if let Err(e) = self.enlist_if_needed(listener, key, tx) {
            if !listener.is_destroyed() && listener.handle_count() == 0 {
                if let Err(disconnect) = self.managed_connection_disconnected(listener) {
                    tracing::debug!(listener = %listener.id(), error = %disconnect, "disconnect after failed reconnect failed");
                }
            }
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn handle_closed(&self, slot: &HandleSlot<F>, unregister_from_cache: bool) -> Result<()> {
        let mut result = Ok(());
        if unregister_from_cache {
            if let Some(cache) = &self.cache {
                if let Err(e) = cache.unregister_connection(self.id, slot.id()) {
                    tracing::warn!(manager = %self.config.name, handle = %slot.id(), error = %e, "closed handle was not tracked");
                    result = Err(e);
                }
            }
        }

        let Some(listener) = slot.detach() else {
            return result;
        };

        if listener.unregister_handle(slot.id()) == HandleRelease::Unknown {
            tracing::warn!(manager = %self.config.name, listener = %listener.id(), handle = %slot.id(), "handle was not registered with its connection");
        }
        tracing::trace!(manager = %self.config.name, listener = %listener.id(), handle = %slot.id(), "handle closed");

        if listener.handle_count() == 0 {
            let disconnected = self.managed_connection_disconnected(&listener);
            result = result.and(disconnected);
        }
        result
    }

    /// Detach `slots` from their listeners, then disconnect every listener
    /// left without handles.
    fn detach_all<'a>(&self, slots: impl IntoIterator<Item = &'a HandleSlot<F>>) -> Result<()> {
        let mut listeners: SmallVec<[Arc<Listener<F>>; 4]> = SmallVec::new();
        for slot in slots {
            let Some(listener) = slot.detach() else {
                continue;
            };
            listener.unregister_handle(slot.id());
            if !listeners.iter().any(|l| l.id() == listener.id()) {
                listeners.push(listener);
            }
        }

        let mut first_error = None;
        for listener in &listeners {
            if listener.handle_count() > 0 {
                continue;
            }
            if let Err(e) = self.managed_connection_disconnected(listener) {
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn slots<'a>(&self, records: &'a [ConnectionRecord]) -> impl Iterator<Item = &'a HandleSlot<F>> {
        records.iter().filter_map(|record| {
            let slot = record.handle().as_any().downcast_ref::<HandleSlot<F>>();
            if slot.is_none() {
                tracing::warn!(handle = %record.handle_id(), "record does not belong to this manager");
            }
            slot
        })
    }
}

impl<F: ManagedConnectionFactory> ConnectionCacheListener for EnlistmentManager<F> {
    fn id(&self) -> ManagerId {
        self.id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn transaction_started(&self, records: &[ConnectionRecord]) -> Result<()> {
        let Some(tx) = self.ambient_transaction()? else {
            return Ok(());
        };

        let mut seen: SmallVec<[ListenerId; 4]> = SmallVec::new();
        for slot in self.slots(records) {
            let Some(listener) = slot.listener() else {
                continue;
            };
            if seen.contains(&listener.id()) {
                continue;
            }
            seen.push(listener.id());
            self.enlist_if_needed(&listener, slot.request_key(), Some(tx))?;
        }
        Ok(())
    }

    fn disconnect(&self, records: &[ConnectionRecord]) -> Result<()> {
        self.detach_all(self.slots(records))
    }

    fn reconnect(&self, records: &[ConnectionRecord]) -> Result<()> {
        let tx = self.ambient_transaction()?;
        let mut by_key: HashMap<RequestKey, Arc<Listener<F>>> = HashMap::new();
        let mut attached: Vec<&HandleSlot<F>> = Vec::new();

        for slot in self.slots(records) {
            if slot.is_closed() {
                continue;
            }

            let listener = match by_key.get(slot.request_key()) {
                Some(listener) => Arc::clone(listener),
                None => {
                    let reconnected = self.allocate(slot.request_key(), tx).and_then(|listener| {
                        self.managed_connection_reconnected(&listener, slot.request_key(), tx)?;
                        Ok(listener)
                    });
                    match reconnected {
                        Ok(listener) => {
                            by_key.insert(slot.request_key().clone(), Arc::clone(&listener));
                            listener
                        }
                        Err(e) => {
                            if let Err(undo) = self.detach_all(attached) {
                                tracing::debug!(error = %undo, "disconnect after failed reconnect failed");
                            }
                            return Err(e);
                        }
                    }
                }
            };

            listener.register_handle(slot.id());
            slot.attach(listener);
            attached.push(slot);
        }

        tracing::debug!(
            manager = %self.config.name,
            handles = attached.len(),
            connections = by_key.len(),
            "reconnected handles"
        );
        Ok(())
    }
}

impl<F: ManagedConnectionFactory> fmt::Debug for EnlistmentManager<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnlistmentManager")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("shutdown", &self.is_shutdown())
            .finish_non_exhaustive()
    }
}

/// Builder for [`EnlistmentManager`].
pub struct ManagerBuilder<F: ManagedConnectionFactory> {
    pool: Pool<F>,
    config: ManagerConfig,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    cache: Option<Arc<AssociationCache>>,
}

impl<F: ManagedConnectionFactory> ManagerBuilder<F> {
    /// Create a builder over `pool`.
    #[must_use]
    pub fn new(pool: Pool<F>) -> Self {
        Self {
            pool,
            config: ManagerConfig::default(),
            coordinator: None,
            cache: None,
        }
    }

    /// Set the manager configuration.
    #[must_use]
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the transaction coordinator.
    #[must_use]
    pub fn coordinator(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// Track handles in an association cache.
    #[must_use]
    pub fn cache(mut self, cache: Arc<AssociationCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Build the manager.
    pub fn build(self) -> Result<Arc<EnlistmentManager<F>>> {
        self.config.validate()?;

        if self.coordinator.is_none()
            && self.config.transaction_support != TransactionSupport::NoTransaction
        {
            tracing::debug!(manager = %self.config.name, "no coordinator configured, connections will not be enlisted");
        }

        let manager = Arc::new_cyclic(|this| EnlistmentManager {
            id: ManagerId::next(),
            this: this.clone(),
            config: self.config,
            pool: self.pool,
            coordinator: self.coordinator,
            cache: self.cache,
            shutdown: AtomicBool::new(false),
        });

        tracing::info!(
            manager = %manager.config.name,
            pool = %manager.pool.name(),
            interleaving = manager.config.interleaving,
            support = ?manager.config.transaction_support,
            "connection manager created"
        );
        Ok(manager)
    }
}

/// Returns or releases a connection when its transaction completes.
struct TxCompletion<F: ManagedConnectionFactory> {
    manager: Weak<EnlistmentManager<F>>,
    listener: Arc<Listener<F>>,
    tx: TxId,
    key: RequestKey,
}

impl<F: ManagedConnectionFactory> Synchronization for TxCompletion<F> {
    fn after_completion(&self, status: TxStatus) {
        match self.manager.upgrade() {
            Some(manager) => manager.transaction_completed(&self.listener, self.tx, &self.key, status),
            None => {
                self.listener.transaction_completed(&self.tx);
            }
        }
    }
}

/// Evicts a connection whose resource failed fatally.
struct EvictOnFailure<F: ManagedConnectionFactory> {
    pool: WeakPool<F>,
    listener: Weak<Listener<F>>,
}

impl<F: ManagedConnectionFactory> FailureListener for EvictOnFailure<F> {
    fn resource_failed(&self, error: &XaError) {
        let (Some(pool), Some(listener)) = (self.pool.upgrade(), self.listener.upgrade()) else {
            return;
        };
        tracing::warn!(
            pool = %pool.name(),
            listener = %listener.id(),
            error = %error,
            "evicting connection after resource failure"
        );
        listener.mark_destroy();
        pool.evict(&listener);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::ErrorKind;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use txconn_pool::PoolBuilder;
    use txconn_xa::BoxError;

    #[derive(Debug)]
    struct Conn;
    impl ManagedConnection for Conn {}

    #[derive(Default)]
    struct Factory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
    }

    impl ManagedConnectionFactory for Factory {
        type Connection = Conn;

        fn create(&self, _: &RequestKey) -> std::result::Result<Conn, BoxError> {
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Conn)
        }
        fn validate(&self, _: &Conn) -> std::result::Result<(), BoxError> {
            Ok(())
        }
        fn matches(&self, _: &Conn, _: &RequestKey) -> bool {
            true
        }
        fn destroy(&self, _: &Conn) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn manager(max: u32) -> Arc<EnlistmentManager<Factory>> {
        let pool = PoolBuilder::new()
            .name("unit")
            .max_connections(max)
            .connection_timeout(Duration::from_millis(20))
            .build(Factory::default())
            .unwrap();
        EnlistmentManager::builder(pool)
            .config(ManagerConfig::new().name("unit"))
            .build()
            .unwrap()
    }

    #[test]
    fn test_handles_share_nothing_without_transaction() {
        let manager = manager(2);
        let key = RequestKey::none();

        let first = manager.get_connection(&key).unwrap();
        let second = manager.get_connection(&key).unwrap();
        assert_ne!(
            first.listener().unwrap().id(),
            second.listener().unwrap().id()
        );
        assert_eq!(manager.pool().status().in_use, 2);

        first.close().unwrap();
        second.close().unwrap();
        let status = manager.pool().status();
        assert_eq!(status.in_use, 0);
        assert_eq!(status.available, 2);
    }

    #[test]
    fn test_dropping_handle_returns_connection() {
        let manager = manager(1);
        let handle = manager.get_connection(&RequestKey::none()).unwrap();
        assert!(handle.connection().is_ok());
        drop(handle);
        assert_eq!(manager.pool().status().available, 1);
        assert!(manager.get_connection(&RequestKey::none()).is_ok());
    }

    #[test]
    fn test_exhaustion_is_retryable() {
        let manager = manager(1);
        let _held = manager.get_connection(&RequestKey::none()).unwrap();
        let err = manager.get_connection(&RequestKey::none()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::PoolExhausted);
        assert!(err.is_retryable());
    }

    #[test]
    fn test_allocation_retry_waits_for_release() {
        let pool = PoolBuilder::new()
            .max_connections(1)
            .connection_timeout(Duration::from_millis(10))
            .build(Factory::default())
            .unwrap();
        let manager = EnlistmentManager::builder(pool)
            .config(ManagerConfig::new().allocation_retry(20, Duration::from_millis(10)))
            .build()
            .unwrap();

        let held = manager.get_connection(&RequestKey::none()).unwrap();
        let releaser = std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(30));
            held.close().unwrap();
        });
        assert!(manager.get_connection(&RequestKey::none()).is_ok());
        releaser.join().unwrap();
    }

    #[test]
    fn test_force_destroy_evicts() {
        let manager = manager(1);
        let handle = manager.get_connection(&RequestKey::none()).unwrap();
        let listener = handle.listener().unwrap();

        manager.return_connection(&listener, true);
        assert!(listener.is_destroyed());
        assert_eq!(manager.pool().factory().destroyed.load(Ordering::SeqCst), 1);

        handle.close().unwrap();
        assert_eq!(manager.pool().status().total, 0);
    }

    #[test]
    fn test_foreign_listener_is_destroyed() {
        let ours = manager(1);
        let theirs = manager(1);
        let handle = theirs.get_connection(&RequestKey::none()).unwrap();
        let listener = handle.listener().unwrap();

        ours.return_connection(&listener, false);
        assert!(listener.is_destroyed());
        assert_eq!(ours.pool().status().total, 0);

        handle.close().unwrap();
        assert_eq!(theirs.pool().status().total, 0);
    }

    #[test]
    fn test_closed_handle_reports_closed() {
        let manager = manager(1);
        let handle = manager.get_connection(&RequestKey::none()).unwrap();
        let tracked = handle.tracked();
        tracked.force_close();
        assert!(handle.is_closed());
        assert_eq!(handle.connection().unwrap_err().kind(), ErrorKind::Disconnected);
    }

    #[test]
    fn test_shutdown_rejects_requests() {
        let manager = manager(1);
        manager.shutdown();
        let err = manager.get_connection(&RequestKey::none()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Shutdown);
        assert!(manager.pool().is_closed());
    }
}
