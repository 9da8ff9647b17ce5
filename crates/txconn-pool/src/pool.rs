//! Connection pool implementation.
//!
//! The pool owns a bounded set of [`ConnectionListener`]s. Callers block
//! in [`Pool::acquire`] until a matching listener is free, a new one can be
//! created, or the blocking timeout elapses. Physical I/O (create,
//! validate, cleanup, destroy) never runs under the pool lock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use hashbrown::HashMap;
use parking_lot::{Condvar, Mutex};
use txconn_xa::{BoxError, TxId};

use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::lifecycle::{ManagedConnection, ManagedConnectionFactory, RequestKey};
use crate::listener::{ConnectionListener, ListenerId};

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// Listener type handed out by a pool over factory `F`.
pub type Listener<F> = ConnectionListener<<F as ManagedConnectionFactory>::Connection>;

/// What [`Pool::flush`] closes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushMode {
    /// Close idle connections only.
    IdleConnections,
    /// Close idle connections now and checked-out ones when returned.
    Gracefully,
    /// Close every connection, including checked-out ones.
    AllConnections,
}

/// A bounded pool of transactional connections.
///
/// # Example
///
/// ```rust,ignore
/// use std::time::Duration;
/// use txconn_pool::{PoolBuilder, RequestKey};
///
/// let pool = PoolBuilder::new()
///     .name("orders")
///     .min_connections(2)
///     .max_connections(20)
///     .connection_timeout(Duration::from_secs(5))
///     .build(factory)?;
///
/// let listener = pool.acquire(&RequestKey::none())?;
/// // hand the listener to an enlistment manager...
/// pool.release(&listener);
/// ```
pub struct Pool<F: ManagedConnectionFactory> {
    inner: Arc<PoolInner<F>>,
}

impl<F: ManagedConnectionFactory> Clone for Pool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

/// Weak reference to a pool, for callbacks that must not keep it alive.
pub struct WeakPool<F: ManagedConnectionFactory> {
    inner: Weak<PoolInner<F>>,
}

impl<F: ManagedConnectionFactory> WeakPool<F> {
    /// Upgrade to a strong reference if the pool still exists.
    #[must_use]
    pub fn upgrade(&self) -> Option<Pool<F>> {
        self.inner.upgrade().map(|inner| Pool { inner })
    }
}

impl<F: ManagedConnectionFactory> Clone for WeakPool<F> {
    fn clone(&self) -> Self {
        Self {
            inner: Weak::clone(&self.inner),
        }
    }
}

struct PoolInner<F: ManagedConnectionFactory> {
    id: u64,
    name: Arc<str>,
    config: PoolConfig,
    factory: F,

    state: Mutex<PoolState<F>>,
    /// Signalled whenever capacity or an idle listener becomes available.
    available: Condvar,

    closed: AtomicBool,
    next_listener_id: AtomicU64,
    created_at: Instant,
    metrics: Mutex<PoolMetricsInner>,
    reaper: Arc<ReaperSignal>,
}

struct PoolState<F: ManagedConnectionFactory> {
    idle: VecDeque<Arc<Listener<F>>>,
    checked_out: HashMap<ListenerId, Arc<Listener<F>>>,
    creating: u32,
    tx_bound: HashMap<(TxId, RequestKey), ListenerId>,
}

impl<F: ManagedConnectionFactory> PoolState<F> {
    fn total(&self) -> u32 {
        let listeners = u32::try_from(self.idle.len() + self.checked_out.len()).unwrap_or(u32::MAX);
        listeners.saturating_add(self.creating)
    }

    fn forget(&mut self, id: ListenerId) -> Option<Arc<Listener<F>>> {
        self.tx_bound.retain(|_, bound| *bound != id);
        if let Some(listener) = self.checked_out.remove(&id) {
            return Some(listener);
        }
        let pos = self.idle.iter().position(|l| l.id() == id)?;
        self.idle.remove(pos)
    }
}

/// Internal metrics tracking.
#[derive(Debug, Default)]
struct PoolMetricsInner {
    connections_created: u64,
    connections_closed: u64,
    creations_failed: u64,
    checkouts_successful: u64,
    checkouts_failed: u64,
    validations_performed: u64,
    validations_failed: u64,
    cleanups_failed: u64,
}

#[derive(Default)]
struct ReaperSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl ReaperSignal {
    /// Sleep for `interval`; returns `true` once the reaper must stop.
    fn wait(&self, interval: Duration) -> bool {
        let mut stopped = self.stopped.lock();
        if !*stopped {
            self.wake.wait_for(&mut stopped, interval);
        }
        *stopped
    }

    fn stop(&self) {
        *self.stopped.lock() = true;
        self.wake.notify_all();
    }
}

impl<F: ManagedConnectionFactory> Drop for PoolInner<F> {
    fn drop(&mut self) {
        self.reaper.stop();
    }
}

impl<F: ManagedConnectionFactory> Pool<F> {
    /// Create a pool over `factory`.
    ///
    /// Prefills to `min_connections` and starts the reaper when configured.
    pub fn new(factory: F, config: PoolConfig) -> Result<Self, PoolError> {
        config.validate()?;

        let inner = Arc::new(PoolInner {
            id: NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed),
            name: Arc::from(config.name.as_str()),
            config: config.clone(),
            factory,
            state: Mutex::new(PoolState {
                idle: VecDeque::new(),
                checked_out: HashMap::new(),
                creating: 0,
                tx_bound: HashMap::new(),
            }),
            available: Condvar::new(),
            closed: AtomicBool::new(false),
            next_listener_id: AtomicU64::new(1),
            created_at: Instant::now(),
            metrics: Mutex::new(PoolMetricsInner::default()),
            reaper: Arc::new(ReaperSignal::default()),
        });

        tracing::info!(
            pool = %config.name,
            min = config.min_connections,
            max = config.max_connections,
            "connection pool created"
        );

        let pool = Self { inner };
        if config.prefill {
            pool.prefill();
        }
        if config.reaper_interval.is_some() {
            pool.start_reaper();
        }
        Ok(pool)
    }

    /// Pool identifier, unique within the process.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    /// Pool name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The factory behind the pool.
    #[must_use]
    pub fn factory(&self) -> &F {
        &self.inner.factory
    }

    /// Get the pool configuration.
    #[must_use]
    pub fn config(&self) -> &PoolConfig {
        &self.inner.config
    }

    /// A weak reference to this pool.
    #[must_use]
    pub fn downgrade(&self) -> WeakPool<F> {
        WeakPool {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Get a listener serving `key`.
    ///
    /// Returns an idle listener the factory matches against `key`, creates
    /// one if the pool has room, or makes room by destroying an idle
    /// listener that does not match. Otherwise blocks up to the
    /// connection timeout and fails with [`PoolError::PoolExhausted`].
    pub fn acquire(&self, key: &RequestKey) -> Result<Arc<Listener<F>>, PoolError> {
        let inner = &self.inner;
        let deadline = Instant::now() + inner.config.connection_timeout;
        let mut skip_idle = false;

        tracing::trace!(pool = %inner.name, key = %key, "acquiring connection");

        loop {
            let mut state = inner.state.lock();
            if self.is_closed() {
                return Err(PoolError::PoolClosed);
            }

            let matched = if skip_idle {
                None
            } else {
                state
                    .idle
                    .iter()
                    .position(|l| inner.factory.matches(l.connection(), key))
                    .and_then(|pos| state.idle.remove(pos))
            };

            if let Some(listener) = matched {
                state.checked_out.insert(listener.id(), Arc::clone(&listener));
                drop(state);

                if inner.config.validate_on_match && !self.validate_listener(&listener) {
                    self.destroy_checked_out(&listener);
                    if inner.config.use_fast_fail {
                        skip_idle = true;
                    }
                    continue;
                }

                listener.on_checkout();
                inner.metrics.lock().checkouts_successful += 1;
                tracing::trace!(pool = %inner.name, listener = %listener.id(), "checked out idle connection");
                return Ok(listener);
            }

            if state.total() < inner.config.max_connections {
                state.creating += 1;
                drop(state);
                return self.create_checked_out(key);
            }

            if let Some(victim) = state.idle.pop_front() {
                state.creating += 1;
                drop(state);
                tracing::debug!(
                    pool = %inner.name,
                    listener = %victim.id(),
                    "destroying unmatched idle connection to make room"
                );
                self.destroy(&victim);
                return self.create_checked_out(key);
            }

            let timed_out = inner.available.wait_until(&mut state, deadline).timed_out();
            if timed_out && Instant::now() >= deadline {
                drop(state);
                inner.metrics.lock().checkouts_failed += 1;
                tracing::debug!(pool = %inner.name, key = %key, "pool exhausted");
                return Err(PoolError::PoolExhausted {
                    pool: inner.name.to_string(),
                    timeout: inner.config.connection_timeout,
                });
            }
        }
    }

    /// Return a listener after use.
    ///
    /// Runs the connection's cleanup, then either recycles the listener
    /// or destroys it when it is marked for destruction, cleanup failed,
    /// the pool is closed or over capacity. Releasing a listener that is
    /// not checked out is logged and ignored.
    pub fn release(&self, listener: &Arc<Listener<F>>) {
        let inner = &self.inner;

        if listener.pool_id() != inner.id {
            tracing::warn!(
                pool = %inner.name,
                listener = %listener.id(),
                owner = %listener.pool_name(),
                "connection returned to a foreign pool, destroying"
            );
            self.destroy(listener);
            return;
        }

        if listener.is_destroyed() {
            if inner.state.lock().forget(listener.id()).is_some() {
                inner.available.notify_one();
            }
            tracing::trace!(pool = %inner.name, listener = %listener.id(), "destroyed connection returned");
            return;
        }

        if inner.state.lock().checked_out.remove(&listener.id()).is_none() {
            tracing::warn!(
                pool = %inner.name,
                listener = %listener.id(),
                "connection returned twice or not checked out, ignoring"
            );
            return;
        }

        if let Err(e) = listener.connection().cleanup() {
            inner.metrics.lock().cleanups_failed += 1;
            tracing::warn!(pool = %inner.name, listener = %listener.id(), error = %e, "cleanup failed");
            listener.mark_destroy();
        }

        if listener.should_destroy() || self.is_closed() {
            self.destroy(listener);
            inner.available.notify_one();
            return;
        }

        let mut state = inner.state.lock();
        state.tx_bound.retain(|_, bound| *bound != listener.id());
        if state.total() >= inner.config.max_connections {
            drop(state);
            self.destroy(listener);
            return;
        }
        listener.touch();
        state.idle.push_back(Arc::clone(listener));
        drop(state);

        inner.available.notify_one();
        tracing::trace!(pool = %inner.name, listener = %listener.id(), "connection returned");
    }

    /// Forcibly destroy a listener, wherever it is held.
    pub fn evict(&self, listener: &Arc<Listener<F>>) {
        let found = self.inner.state.lock().forget(listener.id()).is_some();
        if found || listener.pool_id() == self.inner.id {
            tracing::debug!(pool = %self.inner.name, listener = %listener.id(), "evicting connection");
            self.destroy(listener);
        }
        self.inner.available.notify_one();
    }

    /// Bind a checked-out listener to `(tx, key)` so later requests in the
    /// same transaction share it.
    pub fn bind_transaction(&self, tx: TxId, key: RequestKey, listener: &Arc<Listener<F>>) {
        self.inner
            .state
            .lock()
            .tx_bound
            .insert((tx, key), listener.id());
    }

    /// Remove the transaction binding for `(tx, key)`.
    pub fn unbind_transaction(&self, tx: TxId, key: &RequestKey) {
        self.inner.state.lock().tx_bound.remove(&(tx, key.clone()));
    }

    /// Find the listener bound to `(tx, key)`, if it is still checked out.
    #[must_use]
    pub fn find_transaction_bound(&self, tx: TxId, key: &RequestKey) -> Option<Arc<Listener<F>>> {
        let state = self.inner.state.lock();
        let id = state.tx_bound.get(&(tx, key.clone()))?;
        state.checked_out.get(id).cloned()
    }

    /// Open idle connections up to `min_connections`.
    pub fn prefill(&self) -> usize {
        self.fill_to(self.inner.config.min_connections)
    }

    /// Open idle connections until the pool holds `target` (capped at the
    /// maximum). Returns the number created.
    pub fn fill_to(&self, target: u32) -> usize {
        let inner = &self.inner;
        let target = target.min(inner.config.max_connections);
        let mut created = 0;

        loop {
            {
                let mut state = inner.state.lock();
                if self.is_closed() || state.total() >= target {
                    break;
                }
                state.creating += 1;
            }

            match self.create_listener(&RequestKey::none()) {
                Ok(listener) => {
                    let mut state = inner.state.lock();
                    state.creating -= 1;
                    state.idle.push_back(listener);
                    drop(state);
                    inner.available.notify_one();
                    created += 1;
                }
                Err(e) => {
                    inner.state.lock().creating -= 1;
                    inner.available.notify_one();
                    tracing::warn!(pool = %inner.name, error = %e, "unable to fill pool");
                    break;
                }
            }
        }

        if created > 0 {
            tracing::debug!(pool = %inner.name, created, "pool filled");
        }
        created
    }

    /// Destroy connections idle longer than the idle timeout, keeping at
    /// least `min_connections`, then refill to the minimum.
    pub fn remove_idle_connections(&self) -> usize {
        let inner = &self.inner;
        let timeout = inner.config.idle_timeout;

        let expired: Vec<_> = {
            let mut state = inner.state.lock();
            let mut total = state.total();
            let mut expired = Vec::new();
            let mut kept = VecDeque::with_capacity(state.idle.len());
            while let Some(listener) = state.idle.pop_front() {
                if total > inner.config.min_connections && listener.idle_for() >= timeout {
                    total -= 1;
                    expired.push(listener);
                } else {
                    kept.push_back(listener);
                }
            }
            state.idle = kept;
            expired
        };

        let removed = expired.len();
        for listener in &expired {
            self.destroy(listener);
        }
        if removed > 0 {
            tracing::debug!(pool = %inner.name, removed, "idle connections removed");
            inner.available.notify_all();
        }

        self.prefill();
        removed
    }

    /// Validate every idle connection, destroying the ones that fail.
    /// Returns the number destroyed.
    pub fn validate_connections(&self) -> usize {
        let inner = &self.inner;

        let candidates: Vec<_> = {
            let mut state = inner.state.lock();
            let drained: Vec<_> = state.idle.drain(..).collect();
            for listener in &drained {
                state.checked_out.insert(listener.id(), Arc::clone(listener));
            }
            drained
        };

        let mut failed = 0;
        for listener in &candidates {
            if self.validate_listener(listener) {
                let mut state = inner.state.lock();
                state.checked_out.remove(&listener.id());
                state.idle.push_back(Arc::clone(listener));
                drop(state);
                inner.available.notify_one();
            } else {
                failed += 1;
                self.destroy_checked_out(listener);
            }
        }

        if failed > 0 {
            tracing::debug!(pool = %inner.name, failed, "background validation destroyed connections");
            self.prefill();
        }
        failed
    }

    /// Close connections according to `mode`, then refill to the minimum.
    pub fn flush(&self, mode: FlushMode) {
        let inner = &self.inner;

        let (idle, checked_out): (Vec<_>, Vec<_>) = {
            let mut state = inner.state.lock();
            let idle = state.idle.drain(..).collect();
            let checked_out = state.checked_out.values().cloned().collect();
            if mode == FlushMode::AllConnections {
                state.checked_out.clear();
                state.tx_bound.clear();
            }
            (idle, checked_out)
        };

        for listener in &idle {
            self.destroy(listener);
        }
        match mode {
            FlushMode::IdleConnections => {}
            FlushMode::Gracefully => checked_out.iter().for_each(|l| l.mark_destroy()),
            FlushMode::AllConnections => checked_out.iter().for_each(|l| self.destroy(l)),
        }

        inner.available.notify_all();
        tracing::info!(pool = %inner.name, ?mode, "pool flushed");

        if !self.is_closed() {
            self.prefill();
        }
    }

    /// Start the background reaper thread.
    ///
    /// The thread holds only a weak reference and exits when the pool is
    /// closed or dropped. Returns `false` if no reaper interval is set or
    /// the thread could not be spawned.
    pub fn start_reaper(&self) -> bool {
        let Some(interval) = self.inner.config.reaper_interval else {
            return false;
        };
        let validation = self.inner.config.background_validation;
        let signal = Arc::clone(&self.inner.reaper);
        let weak = self.downgrade();

        let spawned = std::thread::Builder::new()
            .name(format!("txconn-reaper-{}", self.inner.name))
            .spawn(move || {
                let mut last_validation = Instant::now();
                while !signal.wait(interval) {
                    let Some(pool) = weak.upgrade() else { break };
                    if pool.is_closed() {
                        break;
                    }
                    pool.remove_idle_connections();
                    if validation.is_some_and(|every| last_validation.elapsed() >= every) {
                        pool.validate_connections();
                        last_validation = Instant::now();
                    }
                }
                tracing::trace!("reaper stopped");
            });

        match spawned {
            Ok(_) => true,
            Err(e) => {
                tracing::warn!(pool = %self.inner.name, error = %e, "unable to start reaper");
                false
            }
        }
    }

    /// Get the current pool status.
    #[must_use]
    pub fn status(&self) -> PoolStatus {
        let state = self.inner.state.lock();
        let available = u32::try_from(state.idle.len()).unwrap_or(u32::MAX);
        let in_use = u32::try_from(state.checked_out.len()).unwrap_or(u32::MAX);
        PoolStatus {
            available,
            in_use,
            creating: state.creating,
            total: state.total(),
            max: self.inner.config.max_connections,
        }
    }

    /// Get pool metrics.
    #[must_use]
    pub fn metrics(&self) -> PoolMetrics {
        let inner = self.inner.metrics.lock();
        PoolMetrics {
            connections_created: inner.connections_created,
            connections_closed: inner.connections_closed,
            creations_failed: inner.creations_failed,
            checkouts_successful: inner.checkouts_successful,
            checkouts_failed: inner.checkouts_failed,
            validations_performed: inner.validations_performed,
            validations_failed: inner.validations_failed,
            cleanups_failed: inner.cleanups_failed,
            uptime: self.inner.created_at.elapsed(),
        }
    }

    /// Close the pool.
    ///
    /// Idle connections are destroyed now, checked-out ones when they are
    /// returned. Blocked callers fail with [`PoolError::PoolClosed`].
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.reaper.stop();

        let (idle, checked_out): (Vec<_>, Vec<_>) = {
            let mut state = self.inner.state.lock();
            (
                state.idle.drain(..).collect(),
                state.checked_out.values().cloned().collect(),
            )
        };
        for listener in &idle {
            self.destroy(listener);
        }
        for listener in &checked_out {
            listener.mark_destroy();
        }

        self.inner.available.notify_all();
        tracing::info!(pool = %self.inner.name, "connection pool closed");
    }

    /// Check if the pool is closed.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn next_listener_id(&self) -> ListenerId {
        ListenerId::from_raw(self.inner.next_listener_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Create a listener, retrying failed attempts.
    fn create_listener(&self, key: &RequestKey) -> Result<Arc<Listener<F>>, PoolError> {
        let inner = &self.inner;
        let attempts = inner.config.creation_retries.saturating_add(1);
        let mut last_error: Option<BoxError> = None;

        for attempt in 1..=attempts {
            match self.create_once(key) {
                Ok(listener) => {
                    inner.metrics.lock().connections_created += 1;
                    tracing::debug!(
                        pool = %inner.name,
                        listener = %listener.id(),
                        key = %key,
                        attempt,
                        "connection created"
                    );
                    return Ok(listener);
                }
                Err(e) => {
                    inner.metrics.lock().creations_failed += 1;
                    tracing::debug!(pool = %inner.name, attempt, error = %e, "connection creation failed");
                    last_error = Some(e);
                }
            }
        }

        Err(PoolError::ResourceCreationFailed {
            pool: inner.name.to_string(),
            attempts,
            source: last_error.unwrap_or_else(|| "no creation attempt made".into()),
        })
    }

    fn create_once(&self, key: &RequestKey) -> Result<Arc<Listener<F>>, BoxError> {
        let inner = &self.inner;
        let connection = inner.factory.create(key)?;

        if inner.config.validate_on_create {
            inner.metrics.lock().validations_performed += 1;
            if let Err(e) = inner.factory.validate(&connection) {
                inner.metrics.lock().validations_failed += 1;
                inner.factory.destroy(&connection);
                return Err(e);
            }
        }

        Ok(Arc::new(ConnectionListener::new(
            self.next_listener_id(),
            inner.id,
            Arc::clone(&inner.name),
            connection,
            key.clone(),
        )))
    }

    /// Create a listener for a caller that already reserved a slot.
    fn create_checked_out(&self, key: &RequestKey) -> Result<Arc<Listener<F>>, PoolError> {
        let inner = &self.inner;
        let result = self.create_listener(key);

        let mut state = inner.state.lock();
        state.creating -= 1;
        match result {
            Ok(listener) => {
                if self.is_closed() {
                    drop(state);
                    self.destroy(&listener);
                    return Err(PoolError::PoolClosed);
                }
                state.checked_out.insert(listener.id(), Arc::clone(&listener));
                drop(state);
                listener.on_checkout();
                inner.metrics.lock().checkouts_successful += 1;
                Ok(listener)
            }
            Err(e) => {
                drop(state);
                inner.available.notify_one();
                inner.metrics.lock().checkouts_failed += 1;
                Err(e)
            }
        }
    }

    fn validate_listener(&self, listener: &Listener<F>) -> bool {
        let inner = &self.inner;
        inner.metrics.lock().validations_performed += 1;
        match inner.factory.validate(listener.connection()) {
            Ok(()) => true,
            Err(e) => {
                inner.metrics.lock().validations_failed += 1;
                tracing::debug!(pool = %inner.name, listener = %listener.id(), error = %e, "validation failed");
                false
            }
        }
    }

    fn destroy_checked_out(&self, listener: &Arc<Listener<F>>) {
        self.inner.state.lock().forget(listener.id());
        self.destroy(listener);
        self.inner.available.notify_one();
    }

    fn destroy(&self, listener: &Listener<F>) {
        if !listener.mark_destroyed() {
            return;
        }
        self.inner.factory.destroy(listener.connection());
        self.inner.metrics.lock().connections_closed += 1;
        tracing::debug!(pool = %self.inner.name, listener = %listener.id(), "connection destroyed");
    }
}

impl<F: ManagedConnectionFactory> std::fmt::Debug for Pool<F> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("id", &self.inner.id)
            .field("name", &self.inner.name)
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

/// Builder for creating a connection pool.
///
/// # Example
///
/// ```rust,ignore
/// let pool = PoolBuilder::new()
///     .pool_config(pool_config)
///     .build(factory)?;
/// ```
pub struct PoolBuilder {
    pool_config: PoolConfig,
}

impl PoolBuilder {
    /// Create a new pool builder with default settings.
    pub fn new() -> Self {
        Self {
            pool_config: PoolConfig::default(),
        }
    }

    /// Set the pool configuration.
    #[must_use]
    pub fn pool_config(mut self, config: PoolConfig) -> Self {
        self.pool_config = config;
        self
    }

    /// Set the pool name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.pool_config.name = name.into();
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.pool_config.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.pool_config.max_connections = count;
        self
    }

    /// Set the connection acquisition timeout.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.pool_config.idle_timeout = timeout;
        self
    }

    /// Enable or disable validation before checkout.
    #[must_use]
    pub fn validate_on_match(mut self, enabled: bool) -> Self {
        self.pool_config.validate_on_match = enabled;
        self
    }

    /// Enable or disable prefill.
    #[must_use]
    pub fn prefill(mut self, enabled: bool) -> Self {
        self.pool_config.prefill = enabled;
        self
    }

    /// Build the pool.
    pub fn build<F: ManagedConnectionFactory>(self, factory: F) -> Result<Pool<F>, PoolError> {
        Pool::new(factory, self.pool_config)
    }
}

impl Default for PoolBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Status information about the pool.
#[derive(Debug, Clone, Copy)]
pub struct PoolStatus {
    /// Number of idle connections available.
    pub available: u32,
    /// Number of connections currently in use.
    pub in_use: u32,
    /// Number of connections being created.
    pub creating: u32,
    /// Total number of connections.
    pub total: u32,
    /// Maximum allowed connections.
    pub max: u32,
}

impl PoolStatus {
    /// Calculate the utilization percentage.
    #[must_use]
    pub fn utilization(&self) -> f64 {
        if self.max == 0 {
            return 0.0;
        }
        (f64::from(self.in_use) / f64::from(self.max)) * 100.0
    }

    /// Check if the pool is at capacity.
    #[must_use]
    pub fn is_at_capacity(&self) -> bool {
        self.total >= self.max
    }
}

/// Metrics collected from the pool.
#[derive(Debug, Clone)]
pub struct PoolMetrics {
    /// Total connections created since pool start.
    pub connections_created: u64,
    /// Total connections destroyed since pool start.
    pub connections_closed: u64,
    /// Failed creation attempts.
    pub creations_failed: u64,
    /// Successful connection checkouts.
    pub checkouts_successful: u64,
    /// Failed connection checkouts (timeouts, creation failures).
    pub checkouts_failed: u64,
    /// Validations performed.
    pub validations_performed: u64,
    /// Validations that failed.
    pub validations_failed: u64,
    /// Cleanups on return that failed.
    pub cleanups_failed: u64,
    /// Time since pool creation.
    pub uptime: Duration,
}

impl PoolMetrics {
    /// Calculate checkout success rate (0.0 to 1.0).
    #[must_use]
    pub fn checkout_success_rate(&self) -> f64 {
        let total = self.checkouts_successful + self.checkouts_failed;
        if total == 0 {
            return 1.0;
        }
        self.checkouts_successful as f64 / total as f64
    }

    /// Calculate validation success rate (0.0 to 1.0).
    #[must_use]
    pub fn validation_success_rate(&self) -> f64 {
        if self.validations_performed == 0 {
            return 1.0;
        }
        let successful = self.validations_performed - self.validations_failed;
        successful as f64 / self.validations_performed as f64
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    struct Conn {
        key: RequestKey,
        cleanups: AtomicUsize,
        dirty: AtomicBool,
    }

    impl ManagedConnection for Conn {
        fn cleanup(&self) -> Result<(), BoxError> {
            self.cleanups.fetch_add(1, Ordering::SeqCst);
            if self.dirty.load(Ordering::SeqCst) {
                return Err("session state could not be reset".into());
            }
            Ok(())
        }
    }

    #[derive(Default)]
    struct Factory {
        created: AtomicUsize,
        destroyed: AtomicUsize,
        failures_left: AtomicUsize,
        invalid: AtomicBool,
    }

    impl ManagedConnectionFactory for Factory {
        type Connection = Conn;

        fn create(&self, key: &RequestKey) -> Result<Conn, BoxError> {
            let fail = self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if fail {
                return Err("backend unavailable".into());
            }
            self.created.fetch_add(1, Ordering::SeqCst);
            Ok(Conn {
                key: key.clone(),
                cleanups: AtomicUsize::new(0),
                dirty: AtomicBool::new(false),
            })
        }

        fn validate(&self, _: &Conn) -> Result<(), BoxError> {
            if self.invalid.load(Ordering::SeqCst) {
                Err("stale".into())
            } else {
                Ok(())
            }
        }

        fn matches(&self, connection: &Conn, key: &RequestKey) -> bool {
            connection.key == *key || key.info().is_none()
        }

        fn destroy(&self, _: &Conn) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn pool(config: PoolConfig) -> Pool<Factory> {
        Pool::new(Factory::default(), config).unwrap()
    }

    #[test]
    fn test_pool_status_utilization() {
        let status = PoolStatus {
            available: 5,
            in_use: 5,
            creating: 0,
            total: 10,
            max: 20,
        };
        assert!((status.utilization() - 25.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_pool_status_at_capacity() {
        let status = PoolStatus {
            available: 0,
            in_use: 10,
            creating: 0,
            total: 10,
            max: 10,
        };
        assert!(status.is_at_capacity());

        let status2 = PoolStatus {
            available: 5,
            in_use: 5,
            creating: 0,
            total: 10,
            max: 20,
        };
        assert!(!status2.is_at_capacity());
    }

    #[test]
    fn test_pool_metrics_success_rates() {
        let metrics = PoolMetrics {
            connections_created: 10,
            connections_closed: 2,
            creations_failed: 0,
            checkouts_successful: 90,
            checkouts_failed: 10,
            validations_performed: 100,
            validations_failed: 5,
            cleanups_failed: 0,
            uptime: Duration::from_secs(3600),
        };

        assert!((metrics.checkout_success_rate() - 0.9).abs() < f64::EPSILON);
        assert!((metrics.validation_success_rate() - 0.95).abs() < f64::EPSILON);
    }

    #[test]
    fn test_builder_fluent() {
        let builder = PoolBuilder::new()
            .min_connections(5)
            .max_connections(50)
            .validate_on_match(true);

        assert_eq!(builder.pool_config.min_connections, 5);
        assert_eq!(builder.pool_config.max_connections, 50);
        assert!(builder.pool_config.validate_on_match);
    }

    #[test]
    fn test_acquire_release_reuses_connection() {
        let pool = pool(PoolConfig::new());
        let key = RequestKey::new("alice");

        let first = pool.acquire(&key).unwrap();
        let id = first.id();
        assert!(first.claim_return());
        pool.release(&first);

        let second = pool.acquire(&key).unwrap();
        assert_eq!(second.id(), id);
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 1);
        assert_eq!(pool.status().in_use, 1);
    }

    #[test]
    fn test_double_release_ignored() {
        let pool = pool(PoolConfig::new());
        let listener = pool.acquire(&RequestKey::none()).unwrap();
        pool.release(&listener);
        pool.release(&listener);
        assert_eq!(pool.status().available, 1);
        assert_eq!(pool.status().total, 1);
    }

    #[test]
    fn test_exhausted_after_timeout() {
        let pool = pool(
            PoolConfig::new()
                .max_connections(1)
                .connection_timeout(Duration::from_millis(50)),
        );
        let _held = pool.acquire(&RequestKey::none()).unwrap();

        let started = Instant::now();
        let err = pool.acquire(&RequestKey::none()).unwrap_err();
        assert!(matches!(err, PoolError::PoolExhausted { .. }));
        assert!(err.is_retryable());
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert_eq!(pool.status().total, 1);
    }

    #[test]
    fn test_blocked_acquire_gets_released_listener() {
        let pool = pool(
            PoolConfig::new()
                .max_connections(1)
                .connection_timeout(Duration::from_secs(5)),
        );
        let held = pool.acquire(&RequestKey::none()).unwrap();
        let held_id = held.id();

        let waiter = {
            let pool = pool.clone();
            std::thread::spawn(move || pool.acquire(&RequestKey::none()).map(|l| l.id()))
        };

        std::thread::sleep(Duration::from_millis(50));
        pool.release(&held);

        let got = waiter.join().unwrap().unwrap();
        assert_eq!(got, held_id);
        assert_eq!(pool.factory().created.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unmatched_idle_destroyed_to_make_room() {
        let pool = pool(PoolConfig::new().max_connections(1));
        let alice = pool.acquire(&RequestKey::new("alice")).unwrap();
        pool.release(&alice);

        let bob = pool.acquire(&RequestKey::new("bob")).unwrap();
        assert_ne!(bob.id(), alice.id());
        assert!(alice.is_destroyed());
        assert_eq!(pool.factory().destroyed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_creation_retried_once() {
        let factory = Factory::default();
        factory.failures_left.store(1, Ordering::SeqCst);
        let pool = Pool::new(factory, PoolConfig::new()).unwrap();
        assert!(pool.acquire(&RequestKey::none()).is_ok());

        pool.factory().failures_left.store(2, Ordering::SeqCst);
        let err = pool.acquire(&RequestKey::new("other")).unwrap_err();
        assert!(matches!(err, PoolError::ResourceCreationFailed { attempts: 2, .. }));
        assert_eq!(pool.status().total, 1);
        assert_eq!(pool.status().creating, 0);
    }

    #[test]
    fn test_validate_on_match_destroys_stale() {
        let pool = pool(PoolConfig::new().validate_on_match(true));
        let first = pool.acquire(&RequestKey::none()).unwrap();
        pool.release(&first);

        pool.factory().invalid.store(true, Ordering::SeqCst);
        let second = pool.acquire(&RequestKey::none()).unwrap();
        assert_ne!(second.id(), first.id());
        assert!(first.is_destroyed());
    }

    #[test]
    fn test_marked_listener_destroyed_on_release() {
        let pool = pool(PoolConfig::new());
        let listener = pool.acquire(&RequestKey::none()).unwrap();
        listener.mark_destroy();
        pool.release(&listener);
        assert!(listener.is_destroyed());
        assert_eq!(pool.status().total, 0);
    }

    #[test]
    fn test_release_runs_cleanup() {
        let pool = pool(PoolConfig::new());
        let clean = pool.acquire(&RequestKey::new("a")).unwrap();
        pool.release(&clean);
        assert_eq!(clean.connection().cleanups.load(Ordering::SeqCst), 1);
        assert!(!clean.is_destroyed());
        assert_eq!(pool.status().available, 1);

        let dirty = pool.acquire(&RequestKey::new("b")).unwrap();
        dirty.connection().dirty.store(true, Ordering::SeqCst);
        pool.release(&dirty);
        assert_eq!(dirty.connection().cleanups.load(Ordering::SeqCst), 1);
        assert!(dirty.is_destroyed());
        assert_eq!(pool.status().total, 1);
    }

    #[test]
    fn test_evict_removes_listener() {
        let pool = pool(PoolConfig::new());
        let listener = pool.acquire(&RequestKey::none()).unwrap();
        pool.evict(&listener);
        assert!(listener.is_destroyed());
        assert_eq!(pool.status().total, 0);

        let next = pool.acquire(&RequestKey::none()).unwrap();
        assert_ne!(next.id(), listener.id());
    }

    #[test]
    fn test_transaction_binding() {
        let pool = pool(PoolConfig::new());
        let key = RequestKey::new("alice");
        let tx = TxId::from_raw(7);
        let listener = pool.acquire(&key).unwrap();

        pool.bind_transaction(tx, key.clone(), &listener);
        let bound = pool.find_transaction_bound(tx, &key).unwrap();
        assert_eq!(bound.id(), listener.id());
        assert!(pool.find_transaction_bound(TxId::from_raw(8), &key).is_none());

        pool.unbind_transaction(tx, &key);
        assert!(pool.find_transaction_bound(tx, &key).is_none());
    }

    #[test]
    fn test_prefill_and_idle_removal_respect_minimum() {
        let pool = pool(
            PoolConfig::new()
                .min_connections(2)
                .max_connections(5)
                .idle_timeout(Duration::ZERO)
                .prefill(true),
        );
        assert_eq!(pool.status().available, 2);

        let a = pool.acquire(&RequestKey::none()).unwrap();
        let b = pool.acquire(&RequestKey::none()).unwrap();
        let c = pool.acquire(&RequestKey::none()).unwrap();
        for l in [&a, &b, &c] {
            pool.release(l);
        }
        assert_eq!(pool.status().total, 3);

        assert_eq!(pool.remove_idle_connections(), 1);
        assert_eq!(pool.status().total, 2);
    }

    #[test]
    fn test_background_validation() {
        let pool = pool(PoolConfig::new().min_connections(2).prefill(true));
        assert_eq!(pool.validate_connections(), 0);

        pool.factory().invalid.store(true, Ordering::SeqCst);
        assert_eq!(pool.validate_connections(), 2);
        // refill happens without validate_on_create
        assert_eq!(pool.status().available, 2);
    }

    #[test]
    fn test_flush_modes() {
        let pool = pool(PoolConfig::new());
        let held = pool.acquire(&RequestKey::none()).unwrap();
        let idle = pool.acquire(&RequestKey::none()).unwrap();
        pool.release(&idle);

        pool.flush(FlushMode::Gracefully);
        assert!(idle.is_destroyed());
        assert!(!held.is_destroyed());
        assert!(held.should_destroy());

        pool.release(&held);
        assert!(held.is_destroyed());
        assert_eq!(pool.status().total, 0);

        let held = pool.acquire(&RequestKey::none()).unwrap();
        pool.flush(FlushMode::AllConnections);
        assert!(held.is_destroyed());
        pool.release(&held);
        assert_eq!(pool.status().total, 0);
    }

    #[test]
    fn test_close_fails_acquire() {
        let pool = pool(PoolConfig::new());
        pool.close();
        assert!(pool.is_closed());
        assert!(matches!(
            pool.acquire(&RequestKey::none()),
            Err(PoolError::PoolClosed)
        ));
    }

    #[test]
    fn test_reaper_removes_idle() {
        let pool = pool(
            PoolConfig::new()
                .idle_timeout(Duration::from_millis(10))
                .reaper_interval(Some(Duration::from_millis(20))),
        );
        let listener = pool.acquire(&RequestKey::none()).unwrap();
        pool.release(&listener);

        let deadline = Instant::now() + Duration::from_secs(5);
        while pool.status().total > 0 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(pool.status().total, 0);
        pool.close();
    }

    #[derive(Debug, Clone)]
    enum Step {
        Acquire(u8),
        Release(usize),
        Evict(usize),
    }

    fn step() -> impl Strategy<Value = Step> {
        prop_oneof![
            (0u8..3).prop_map(Step::Acquire),
            any::<usize>().prop_map(Step::Release),
            any::<usize>().prop_map(Step::Evict),
        ]
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn live_count_never_exceeds_max(
            max in 1u32..4,
            steps in proptest::collection::vec(step(), 0..40),
        ) {
            let pool = pool(
                PoolConfig::new()
                    .max_connections(max)
                    .connection_timeout(Duration::ZERO),
            );
            let mut held: Vec<Arc<Listener<Factory>>> = Vec::new();

            for step in steps {
                match step {
                    Step::Acquire(k) => {
                        if let Ok(l) = pool.acquire(&RequestKey::new(format!("k{k}"))) {
                            held.push(l);
                        }
                    }
                    Step::Release(i) if !held.is_empty() => {
                        let l = held.swap_remove(i % held.len());
                        pool.release(&l);
                    }
                    Step::Evict(i) if !held.is_empty() => {
                        let l = held.swap_remove(i % held.len());
                        pool.evict(&l);
                    }
                    _ => {}
                }

                let status = pool.status();
                prop_assert!(status.total <= max);
                prop_assert_eq!(status.in_use as usize, held.len());
                let live = pool.factory().created.load(Ordering::SeqCst)
                    - pool.factory().destroyed.load(Ordering::SeqCst);
                prop_assert!(live <= max as usize);
            }
        }
    }
}
