//! Thread-scoped association cache.
//!
//! Callers bracket units of work with [`AssociationCache::push`] and
//! [`AssociationCache::pop`] (or the [`ContextGuard`] returned by
//! [`AssociationCache::enter`]). Handles obtained inside a context are
//! recorded against it. Leaving the outermost occurrence of a context
//! disconnects its handles from their pooled connections and saves the
//! records under the context key; entering an equal key again, on any
//! thread, reconnects them.
//!
//! The context stack is thread-local and keyed by cache instance. Saved
//! association sets live in a shared concurrent map so that another
//! thread can pick them up.
//!
//! In debug mode handles still open when their context is left are
//! closed on the caller's behalf and logged together with the
//! backtrace of their allocation.

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use hashbrown::HashMap;
use parking_lot::Mutex;
use txconn_pool::{HandleId, RequestKey};
use txconn_xa::{Synchronization, TransactionCoordinator, TxStatus};
use uuid::Uuid;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::handle::TrackedHandle;

static NEXT_CACHE_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_MANAGER_ID: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static STACKS: RefCell<HashMap<u64, Vec<Context>>> = RefCell::new(HashMap::new());
}

/// Identifier of a connection manager registered with a cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ManagerId(u64);

impl ManagerId {
    /// Allocate a fresh identifier.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_MANAGER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for ManagerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cm-{}", self.0)
    }
}

/// Opaque key identifying a unit of work.
///
/// Keys compare by value: a new key equal to a saved one reconnects the
/// saved associations.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ContextKey(Arc<str>);

impl ContextKey {
    /// A key no other key equals.
    #[must_use]
    pub fn unique() -> Self {
        Self(Arc::from(Uuid::new_v4().to_string()))
    }

    /// A key identified by `name`.
    #[must_use]
    pub fn named(name: impl Into<Arc<str>>) -> Self {
        Self(name.into())
    }

    /// The key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ContextKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A tracked handle together with the request key it was obtained for.
#[derive(Clone)]
pub struct ConnectionRecord {
    handle: Arc<dyn TrackedHandle>,
    request_key: RequestKey,
}

impl ConnectionRecord {
    /// Create a record.
    pub fn new(handle: Arc<dyn TrackedHandle>, request_key: RequestKey) -> Self {
        Self {
            handle,
            request_key,
        }
    }

    /// The tracked handle.
    #[must_use]
    pub fn handle(&self) -> &Arc<dyn TrackedHandle> {
        &self.handle
    }

    /// The handle identifier.
    #[must_use]
    pub fn handle_id(&self) -> HandleId {
        self.handle.handle_id()
    }

    /// The request key.
    #[must_use]
    pub fn request_key(&self) -> &RequestKey {
        &self.request_key
    }
}

impl fmt::Debug for ConnectionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionRecord")
            .field("handle", &self.handle.handle_id())
            .field("request_key", &self.request_key)
            .field("closed", &self.handle.is_closed())
            .finish()
    }
}

/// A connection manager as seen by the cache.
pub trait ConnectionCacheListener: Send + Sync {
    /// Manager identifier.
    fn id(&self) -> ManagerId;

    /// Manager name, for diagnostics.
    fn name(&self) -> &str;

    /// A user transaction began while `records` were open; enlist them.
    fn transaction_started(&self, records: &[ConnectionRecord]) -> Result<()>;

    /// Detach `records` from their connections at context exit.
    fn disconnect(&self, records: &[ConnectionRecord]) -> Result<()>;

    /// Re-attach `records` to connections at context entry.
    fn reconnect(&self, records: &[ConnectionRecord]) -> Result<()>;
}

#[derive(Clone)]
struct ManagerRecords {
    manager_id: ManagerId,
    manager: Arc<dyn ConnectionCacheListener>,
    records: Vec<ConnectionRecord>,
}

struct Context {
    key: ContextKey,
    managers: Vec<ManagerRecords>,
}

impl Context {
    fn merge(&mut self, batches: Vec<ManagerRecords>) {
        for batch in batches {
            match self
                .managers
                .iter_mut()
                .find(|b| b.manager_id == batch.manager_id)
            {
                Some(existing) => existing.records.extend(batch.records),
                None => self.managers.push(batch),
            }
        }
    }
}

/// Tracks which handles each unit of work holds.
pub struct AssociationCache {
    id: u64,
    config: CacheConfig,
    coordinator: Option<Arc<dyn TransactionCoordinator>>,
    saved: DashMap<ContextKey, Vec<ManagerRecords>>,
}

impl AssociationCache {
    /// Create a cache.
    pub fn new(config: CacheConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            id: NEXT_CACHE_ID.fetch_add(1, Ordering::Relaxed),
            config,
            coordinator: None,
            saved: DashMap::new(),
        })
    }

    /// Use `coordinator` to defer debug-mode closing to transaction
    /// completion.
    #[must_use]
    pub fn with_coordinator(mut self, coordinator: Arc<dyn TransactionCoordinator>) -> Self {
        self.coordinator = Some(coordinator);
        self
    }

    /// The cache configuration.
    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Number of contexts on the calling thread's stack.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.with_stack(|stack| stack.len())
    }

    /// Check whether associations are saved under `key`.
    #[must_use]
    pub fn has_saved(&self, key: &ContextKey) -> bool {
        self.saved.contains_key(key)
    }

    /// Enter a context.
    ///
    /// Entering a key equal to one already on the stack only pushes.
    /// Otherwise associations saved under the key are removed from the
    /// shared map and reconnected. If any manager fails to reconnect,
    /// the ones already reconnected are disconnected again, the saved
    /// set is restored and nothing is pushed.
    pub fn push(&self, key: ContextKey) -> Result<()> {
        let reentrant = self.with_stack(|stack| stack.iter().any(|c| c.key == key));

        let saved = if reentrant {
            None
        } else {
            self.saved.remove(&key).map(|(_, saved)| saved)
        };

        let mut managers = Vec::new();
        if let Some(saved) = saved {
            let mut reconnected: Vec<ManagerRecords> = Vec::new();
            let mut failure = None;
            for batch in &saved {
                let live = open_records(&batch.records);
                if live.is_empty() {
                    continue;
                }
                if let Err(e) = batch.manager.reconnect(&live) {
                    tracing::warn!(context = %key, manager = %batch.manager.name(), error = %e, "reconnect failed");
                    failure = Some(e);
                    break;
                }
                reconnected.push(ManagerRecords {
                    manager_id: batch.manager_id,
                    manager: Arc::clone(&batch.manager),
                    records: live,
                });
            }

            if let Some(e) = failure {
                for done in &reconnected {
                    if let Err(e) = done.manager.disconnect(&done.records) {
                        tracing::warn!(context = %key, manager = %done.manager.name(), error = %e, "disconnect after failed reconnect failed");
                    }
                }
                self.saved.insert(key, saved);
                return Err(e);
            }

            tracing::debug!(context = %key, managers = reconnected.len(), "reconnected saved associations");
            managers = reconnected;
        }

        self.with_stack(|stack| stack.push(Context { key, managers }));
        Ok(())
    }

    /// Leave the innermost context.
    ///
    /// When an equal key remains deeper on the stack, the records move to
    /// that context and nothing is disconnected. Otherwise open handles
    /// are disconnected and saved under the key, or, in debug mode,
    /// closed.
    pub fn pop(&self) -> Result<()> {
        let popped = self.with_stack(|stack| {
            let context = stack.pop()?;
            match stack.iter_mut().rev().find(|c| c.key == context.key) {
                Some(outer) => {
                    outer.merge(context.managers);
                    Some(None)
                }
                None => Some(Some(context)),
            }
        });

        let context = match popped {
            None => return Err(Error::Protocol("no context to leave".into())),
            Some(None) => return Ok(()),
            Some(Some(context)) => context,
        };

        let mut first_error = None;
        let mut closed_now = 0;
        let mut keep = Vec::new();

        for batch in context.managers {
            let live = open_records(&batch.records);
            if live.is_empty() {
                continue;
            }
            if self.config.debug {
                closed_now += self.close_leaked(&context.key, batch.manager.name(), live);
                continue;
            }
            if let Err(e) = batch.manager.disconnect(&live) {
                tracing::warn!(context = %context.key, manager = %batch.manager.name(), error = %e, "disconnect failed");
                first_error.get_or_insert(e);
            }
            keep.push(ManagerRecords {
                records: live,
                ..batch
            });
        }

        if !keep.is_empty() {
            tracing::trace!(context = %context.key, managers = keep.len(), "saving associations");
            self.saved
                .entry(context.key.clone())
                .or_default()
                .extend(keep);
        }

        if let Some(e) = first_error {
            return Err(e);
        }
        if self.config.error && closed_now > 0 {
            return Err(Error::UnclosedConnections {
                context: context.key.to_string(),
                count: closed_now,
            });
        }
        Ok(())
    }

    /// Enter a context, leaving it when the guard drops.
    pub fn enter(&self, key: ContextKey) -> Result<ContextGuard<'_>> {
        self.push(key)?;
        Ok(ContextGuard {
            cache: self,
            exited: false,
        })
    }

    /// Record a handle against the innermost context.
    ///
    /// Returns `false` when the calling thread is outside any context.
    pub fn register_connection(
        &self,
        manager: Arc<dyn ConnectionCacheListener>,
        record: ConnectionRecord,
    ) -> bool {
        let manager_id = manager.id();
        self.with_stack(|stack| {
            let Some(context) = stack.last_mut() else {
                return false;
            };
            match context
                .managers
                .iter_mut()
                .find(|b| b.manager_id == manager_id)
            {
                Some(batch) => batch.records.push(record),
                None => context.managers.push(ManagerRecords {
                    manager_id,
                    manager,
                    records: vec![record],
                }),
            }
            true
        })
    }

    /// Forget a handle recorded against the innermost context.
    ///
    /// Outside any context, or when the context holds nothing for the
    /// manager, this does nothing: handles may be closed in a different
    /// context than the one that obtained them.
    pub fn unregister_connection(&self, manager: ManagerId, handle: HandleId) -> Result<()> {
        let unknown = self.with_stack(|stack| {
            let batch = stack
                .last_mut()?
                .managers
                .iter_mut()
                .find(|b| b.manager_id == manager)?;
            match batch.records.iter().position(|r| r.handle_id() == handle) {
                Some(pos) => {
                    batch.records.remove(pos);
                    None
                }
                None => Some(Arc::clone(&batch.manager)),
            }
        });

        match unknown {
            None => Ok(()),
            Some(manager) => Err(Error::UnknownConnection {
                handle,
                manager: manager.name().to_string(),
            }),
        }
    }

    /// A user transaction began on the calling thread: enlist every
    /// connection the innermost context holds.
    pub fn user_transaction_started(&self) -> Result<()> {
        let batches = self.with_stack(|stack| {
            stack
                .last()
                .map(|c| c.managers.clone())
                .unwrap_or_default()
        });
        for batch in batches {
            let live = open_records(&batch.records);
            if !live.is_empty() {
                batch.manager.transaction_started(&live)?;
            }
        }
        Ok(())
    }

    /// Drop every association of a shutting-down manager.
    pub fn unregister_manager(&self, manager: ManagerId) {
        self.saved.retain(|_, batches| {
            batches.retain(|b| b.manager_id != manager);
            !batches.is_empty()
        });
        self.with_stack(|stack| {
            for context in stack.iter_mut() {
                context.managers.retain(|b| b.manager_id != manager);
            }
        });
        tracing::debug!(manager = %manager, "manager unregistered from association cache");
    }

    fn close_leaked(&self, key: &ContextKey, manager: &str, records: Vec<ConnectionRecord>) -> usize {
        let active = self.coordinator.as_ref().and_then(|coordinator| {
            let tx = coordinator.current_transaction().ok()??;
            let status = coordinator.status(&tx).ok()?;
            status.is_active().then_some((coordinator, tx))
        });

        if let Some((coordinator, tx)) = active {
            let sync = Arc::new(CloseOnCompletion {
                context: key.clone(),
                records: Mutex::new(records.clone()),
            });
            match coordinator.register_synchronization(&tx, sync) {
                Ok(()) => {
                    tracing::debug!(context = %key, tx = %tx, count = records.len(), "closing leaked connections at transaction completion");
                    return 0;
                }
                Err(e) => {
                    tracing::warn!(context = %key, tx = %tx, error = %e, "could not defer closing, closing now");
                }
            }
        }

        let mut closed = 0;
        for record in records {
            if record.handle.is_closed() {
                continue;
            }
            log_leak(key, manager, &record);
            record.handle.force_close();
            closed += 1;
        }
        closed
    }

    fn with_stack<R>(&self, f: impl FnOnce(&mut Vec<Context>) -> R) -> R {
        STACKS.with(|stacks| f(stacks.borrow_mut().entry(self.id).or_default()))
    }
}

impl Drop for AssociationCache {
    fn drop(&mut self) {
        let _ = STACKS.try_with(|stacks| {
            if let Ok(mut stacks) = stacks.try_borrow_mut() {
                stacks.remove(&self.id);
            }
        });
    }
}

impl fmt::Debug for AssociationCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AssociationCache")
            .field("id", &self.id)
            .field("config", &self.config)
            .field("saved", &self.saved.len())
            .finish_non_exhaustive()
    }
}

/// Leaves its context when dropped.
#[must_use = "the context is left as soon as the guard is dropped"]
pub struct ContextGuard<'a> {
    cache: &'a AssociationCache,
    exited: bool,
}

impl ContextGuard<'_> {
    /// Leave the context, reporting what the pop reported.
    pub fn exit(mut self) -> Result<()> {
        self.exited = true;
        self.cache.pop()
    }
}

impl Drop for ContextGuard<'_> {
    fn drop(&mut self) {
        if self.exited {
            return;
        }
        if let Err(e) = self.cache.pop() {
            tracing::warn!(error = %e, "error leaving context");
        }
    }
}

/// Closes handles still open when their transaction completes.
struct CloseOnCompletion {
    context: ContextKey,
    records: Mutex<Vec<ConnectionRecord>>,
}

impl Synchronization for CloseOnCompletion {
    fn after_completion(&self, status: TxStatus) {
        let records = std::mem::take(&mut *self.records.lock());
        for record in records {
            if record.handle.is_closed() {
                continue;
            }
            tracing::warn!(
                context = %self.context,
                handle = %record.handle_id(),
                %status,
                "closing a connection left open at transaction completion"
            );
            record.handle.force_close();
        }
    }
}

fn open_records(records: &[ConnectionRecord]) -> Vec<ConnectionRecord> {
    records
        .iter()
        .filter(|r| !r.handle.is_closed())
        .cloned()
        .collect()
}

fn log_leak(key: &ContextKey, manager: &str, record: &ConnectionRecord) {
    match record.handle.allocation_trace() {
        Some(trace) => tracing::warn!(
            context = %key,
            manager,
            handle = %record.handle_id(),
            "closing a connection left open, allocated at:\n{trace}"
        ),
        None => tracing::warn!(
            context = %key,
            manager,
            handle = %record.handle_id(),
            "closing a connection left open"
        ),
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::any::Any;
    use std::backtrace::Backtrace;
    use std::sync::atomic::AtomicBool;

    struct FakeHandle {
        id: HandleId,
        closed: AtomicBool,
        connected: AtomicBool,
    }

    impl FakeHandle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: HandleId::next(),
                closed: AtomicBool::new(false),
                connected: AtomicBool::new(true),
            })
        }
    }

    impl TrackedHandle for FakeHandle {
        fn handle_id(&self) -> HandleId {
            self.id
        }
        fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }
        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }
        fn force_close(&self) {
            self.closed.store(true, Ordering::SeqCst);
        }
        fn allocation_trace(&self) -> Option<&Backtrace> {
            None
        }
        fn as_any(&self) -> &dyn Any {
            self
        }
    }

    #[derive(Default)]
    struct Recorder {
        id: Option<ManagerId>,
        disconnects: Mutex<Vec<Vec<HandleId>>>,
        reconnects: Mutex<Vec<Vec<HandleId>>>,
        started: Mutex<Vec<Vec<HandleId>>>,
        fail_reconnect: AtomicBool,
    }

    impl Recorder {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                id: Some(ManagerId::next()),
                ..Self::default()
            })
        }
    }

    fn ids(records: &[ConnectionRecord]) -> Vec<HandleId> {
        records.iter().map(ConnectionRecord::handle_id).collect()
    }

    impl ConnectionCacheListener for Recorder {
        fn id(&self) -> ManagerId {
            self.id.unwrap_or(ManagerId(0))
        }
        fn name(&self) -> &str {
            "recorder"
        }
        fn transaction_started(&self, records: &[ConnectionRecord]) -> Result<()> {
            self.started.lock().push(ids(records));
            Ok(())
        }
        fn disconnect(&self, records: &[ConnectionRecord]) -> Result<()> {
            self.disconnects.lock().push(ids(records));
            Ok(())
        }
        fn reconnect(&self, records: &[ConnectionRecord]) -> Result<()> {
            if self.fail_reconnect.load(Ordering::SeqCst) {
                return Err(Error::Protocol("reconnect refused".into()));
            }
            self.reconnects.lock().push(ids(records));
            Ok(())
        }
    }

    fn record(handle: &Arc<FakeHandle>) -> ConnectionRecord {
        ConnectionRecord::new(
            Arc::clone(handle) as Arc<dyn TrackedHandle>,
            RequestKey::none(),
        )
    }

    #[test]
    fn test_pop_disconnects_and_push_reconnects() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let manager = Recorder::new();
        let handle = FakeHandle::new();
        let key = ContextKey::named("unit-of-work");

        cache.push(key.clone()).unwrap();
        assert!(cache.register_connection(manager.clone(), record(&handle)));
        cache.pop().unwrap();

        assert_eq!(*manager.disconnects.lock(), vec![vec![handle.id]]);
        assert!(cache.has_saved(&key));

        cache.push(ContextKey::named("unit-of-work")).unwrap();
        assert_eq!(*manager.reconnects.lock(), vec![vec![handle.id]]);
        assert!(!cache.has_saved(&key));
        cache.pop().unwrap();
        assert_eq!(manager.disconnects.lock().len(), 2);
    }

    #[test]
    fn test_reentrant_key_keeps_connections() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let manager = Recorder::new();
        let handle = FakeHandle::new();
        let key = ContextKey::named("k");

        cache.push(key.clone()).unwrap();
        cache.push(key.clone()).unwrap();
        cache.register_connection(manager.clone(), record(&handle));
        cache.pop().unwrap();
        assert!(manager.disconnects.lock().is_empty());
        assert_eq!(cache.depth(), 1);

        cache.pop().unwrap();
        assert_eq!(*manager.disconnects.lock(), vec![vec![handle.id]]);
        assert_eq!(cache.depth(), 0);
    }

    #[test]
    fn test_pop_on_empty_stack_is_an_error() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let err = cache.pop().unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::ProtocolViolation);
    }

    #[test]
    fn test_failed_reconnect_restores_saved_set() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let manager = Recorder::new();
        let handle = FakeHandle::new();
        let key = ContextKey::named("k");

        cache.push(key.clone()).unwrap();
        cache.register_connection(manager.clone(), record(&handle));
        cache.pop().unwrap();

        manager.fail_reconnect.store(true, Ordering::SeqCst);
        assert!(cache.push(key.clone()).is_err());
        assert_eq!(cache.depth(), 0);
        assert!(cache.has_saved(&key));
    }

    #[test]
    fn test_closed_handles_are_not_saved() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let manager = Recorder::new();
        let handle = FakeHandle::new();
        let key = ContextKey::named("k");

        cache.push(key.clone()).unwrap();
        cache.register_connection(manager.clone(), record(&handle));
        handle.force_close();
        cache.pop().unwrap();

        assert!(manager.disconnects.lock().is_empty());
        assert!(!cache.has_saved(&key));
    }

    #[test]
    fn test_unregister_connection_rules() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let manager = Recorder::new();
        let other = Recorder::new();
        let handle = FakeHandle::new();

        // Outside a context.
        assert!(cache.unregister_connection(manager.id(), handle.id).is_ok());
        assert!(!cache.register_connection(manager.clone(), record(&handle)));

        cache.push(ContextKey::unique()).unwrap();
        cache.register_connection(manager.clone(), record(&handle));

        // Untracked manager.
        assert!(cache.unregister_connection(other.id(), handle.id).is_ok());

        assert!(cache.unregister_connection(manager.id(), handle.id).is_ok());
        let err = cache
            .unregister_connection(manager.id(), handle.id)
            .unwrap_err();
        assert_eq!(err.kind(), crate::ErrorKind::UnknownConnection);
        cache.pop().unwrap();
    }

    #[test]
    fn test_user_transaction_started_notifies_managers() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let manager = Recorder::new();
        let (a, b) = (FakeHandle::new(), FakeHandle::new());

        cache.push(ContextKey::unique()).unwrap();
        cache.register_connection(manager.clone(), record(&a));
        cache.register_connection(manager.clone(), record(&b));
        cache.user_transaction_started().unwrap();
        assert_eq!(*manager.started.lock(), vec![vec![a.id, b.id]]);
        cache.pop().unwrap();
    }

    #[test]
    fn test_debug_mode_closes_leaks() {
        let cache = AssociationCache::new(CacheConfig::new().debug(true)).unwrap();
        let manager = Recorder::new();
        let handle = FakeHandle::new();
        let key = ContextKey::named("k");

        cache.push(key.clone()).unwrap();
        cache.register_connection(manager.clone(), record(&handle));
        cache.pop().unwrap();

        assert!(handle.is_closed());
        assert!(manager.disconnects.lock().is_empty());
        assert!(!cache.has_saved(&key));
    }

    #[test]
    fn test_error_mode_reports_leaks() {
        let cache = AssociationCache::new(CacheConfig::new().error(true)).unwrap();
        let manager = Recorder::new();
        let handle = FakeHandle::new();

        cache.push(ContextKey::unique()).unwrap();
        cache.register_connection(manager.clone(), record(&handle));
        let err = cache.pop().unwrap_err();
        assert!(matches!(err, Error::UnclosedConnections { count: 1, .. }));
        assert!(handle.is_closed());
    }

    #[test]
    fn test_unregister_manager_drops_saved_records() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        let manager = Recorder::new();
        let handle = FakeHandle::new();
        let key = ContextKey::named("k");

        cache.push(key.clone()).unwrap();
        cache.register_connection(manager.clone(), record(&handle));
        cache.pop().unwrap();
        assert!(cache.has_saved(&key));

        cache.unregister_manager(manager.id());
        assert!(!cache.has_saved(&key));
    }

    #[test]
    fn test_guard_pops_on_drop() {
        let cache = AssociationCache::new(CacheConfig::default()).unwrap();
        {
            let _guard = cache.enter(ContextKey::unique()).unwrap();
            assert_eq!(cache.depth(), 1);
        }
        assert_eq!(cache.depth(), 0);

        let guard = cache.enter(ContextKey::unique()).unwrap();
        assert!(guard.exit().is_ok());
        assert_eq!(cache.depth(), 0);
    }

    #[test]
    fn test_caches_have_separate_stacks() {
        let first = AssociationCache::new(CacheConfig::default()).unwrap();
        let second = AssociationCache::new(CacheConfig::default()).unwrap();
        first.push(ContextKey::unique()).unwrap();
        assert_eq!(first.depth(), 1);
        assert_eq!(second.depth(), 0);
        first.pop().unwrap();
    }

    #[derive(Debug, Clone)]
    enum Op {
        Push(u8),
        Pop,
        Register,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![(0u8..3).prop_map(Op::Push), Just(Op::Pop), Just(Op::Register)]
    }

    proptest! {
        #[test]
        fn saved_sets_follow_outermost_exit(ops in proptest::collection::vec(op(), 0..48)) {
            let cache = AssociationCache::new(CacheConfig::default()).unwrap();
            let manager = Recorder::new();
            let key = |k: u8| ContextKey::named(format!("ctx-{k}"));

            // (key, handle count) per context, and saved counts per key
            let mut stack: Vec<(u8, usize)> = Vec::new();
            let mut saved: HashMap<u8, usize> = HashMap::new();

            for op in ops {
                match op {
                    Op::Push(k) => {
                        cache.push(key(k)).unwrap();
                        let carried = if stack.iter().any(|(s, _)| *s == k) {
                            0
                        } else {
                            saved.remove(&k).unwrap_or(0)
                        };
                        stack.push((k, carried));
                    }
                    Op::Pop => {
                        let result = cache.pop();
                        match stack.pop() {
                            None => prop_assert!(result.is_err()),
                            Some((k, count)) => {
                                prop_assert!(result.is_ok());
                                match stack.iter_mut().rev().find(|(s, _)| *s == k) {
                                    Some(outer) => outer.1 += count,
                                    None if count > 0 => *saved.entry(k).or_default() += count,
                                    None => {}
                                }
                            }
                        }
                    }
                    Op::Register => {
                        let handle = FakeHandle::new();
                        let registered = cache.register_connection(manager.clone(), record(&handle));
                        prop_assert_eq!(registered, !stack.is_empty());
                        if let Some(top) = stack.last_mut() {
                            top.1 += 1;
                        }
                    }
                }

                prop_assert_eq!(cache.depth(), stack.len());
                for k in 0..3 {
                    prop_assert_eq!(cache.has_saved(&key(k)), saved.contains_key(&k));
                }
            }

            let disconnected: usize = manager.disconnects.lock().iter().map(Vec::len).sum();
            let reconnected: usize = manager.reconnects.lock().iter().map(Vec::len).sum();
            let parked: usize = saved.values().sum();
            prop_assert_eq!(disconnected - reconnected, parked);
        }
    }
}
