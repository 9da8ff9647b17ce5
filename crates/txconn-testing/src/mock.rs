//! Scripted connections and factory.
//!
//! [`MockFactory`] produces [`MockConnection`]s that offer a local
//! transaction, an XA resource, or neither. Every interaction is counted
//! or recorded so tests can assert on it, and failures can be scripted
//! ahead of time.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use thiserror::Error;
use txconn_pool::{ManagedConnection, ManagedConnectionFactory, ProductInfo, RequestKey};
use txconn_xa::{
    BoxError, LocalTransaction, Vote, XaError, XaFlags, XaResource, Xid, same_resource,
    unwrap_resource,
};

/// Failures produced by mock connections.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum MockError {
    /// Scripted creation failure.
    #[error("connection refused")]
    ConnectionRefused,
    /// Scripted validation failure.
    #[error("connection {0} is broken")]
    Broken(u64),
    /// Scripted cleanup failure.
    #[error("cleanup of connection {0} failed")]
    Cleanup(u64),
    /// Scripted local transaction failure.
    #[error("local {0} failed")]
    Local(&'static str),
}

/// What the connections of a [`MockFactory`] offer.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum MockSupport {
    /// Neither a local transaction nor an XA resource.
    None,
    /// A local transaction.
    Local,
    /// A native XA resource.
    #[default]
    Xa,
}

/// One call received by a [`MockXaResource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaCall {
    /// `start`
    Start(Xid, XaFlags),
    /// `end`
    End(Xid, XaFlags),
    /// `prepare`
    Prepare(Xid),
    /// `commit`
    Commit(Xid, bool),
    /// `rollback`
    Rollback(Xid),
    /// `forget`
    Forget(Xid),
    /// `set_transaction_timeout`
    SetTimeout(Duration),
}

/// Native XA resource that records every call.
#[derive(Debug, Default)]
pub struct MockXaResource {
    calls: Mutex<Vec<XaCall>>,
    fail_prepare: AtomicBool,
    fail_commit: AtomicBool,
    timeout: Mutex<Duration>,
}

impl MockXaResource {
    /// Create a resource.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Calls received so far.
    #[must_use]
    pub fn calls(&self) -> Vec<XaCall> {
        self.calls.lock().clone()
    }

    /// Branch identifiers passed to `start`.
    #[must_use]
    pub fn started(&self) -> Vec<Xid> {
        self.calls
            .lock()
            .iter()
            .filter_map(|call| match call {
                XaCall::Start(xid, _) => Some(xid.clone()),
                _ => None,
            })
            .collect()
    }

    /// Make `prepare` fail.
    pub fn fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Make `commit` fail.
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }

    fn record(&self, call: XaCall) {
        self.calls.lock().push(call);
    }
}

impl XaResource for MockXaResource {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        self.record(XaCall::Start(xid.clone(), flags));
        Ok(())
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        self.record(XaCall::End(xid.clone(), flags));
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        self.record(XaCall::Prepare(xid.clone()));
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(XaError::RolledBack {
                message: format!("prepare of {xid} refused"),
                source: None,
            });
        }
        Ok(Vote::Commit)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        self.record(XaCall::Commit(xid.clone(), one_phase));
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(XaError::resource_manager(
                format!("commit of {xid} failed"),
                Box::new(MockError::Local("commit")),
            ));
        }
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.record(XaCall::Rollback(xid.clone()));
        Ok(())
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        self.record(XaCall::Forget(xid.clone()));
        Ok(())
    }

    fn recover(&self, _flags: XaFlags) -> Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> Result<bool, XaError> {
        Ok(same_resource(self, unwrap_resource(other)))
    }

    fn transaction_timeout(&self) -> Result<Duration, XaError> {
        Ok(*self.timeout.lock())
    }

    fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool, XaError> {
        self.record(XaCall::SetTimeout(timeout));
        *self.timeout.lock() = timeout;
        Ok(true)
    }
}

/// Local transaction that counts calls.
#[derive(Debug, Default)]
pub struct MockLocalTransaction {
    begins: AtomicUsize,
    commits: AtomicUsize,
    rollbacks: AtomicUsize,
    fail_commit: AtomicBool,
}

impl MockLocalTransaction {
    /// Number of `begin` calls.
    #[must_use]
    pub fn begins(&self) -> usize {
        self.begins.load(Ordering::SeqCst)
    }

    /// Number of successful `commit` calls.
    #[must_use]
    pub fn commits(&self) -> usize {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of `rollback` calls.
    #[must_use]
    pub fn rollbacks(&self) -> usize {
        self.rollbacks.load(Ordering::SeqCst)
    }

    /// Make `commit` fail.
    pub fn fail_commit(&self, fail: bool) {
        self.fail_commit.store(fail, Ordering::SeqCst);
    }
}

impl LocalTransaction for MockLocalTransaction {
    fn begin(&self) -> Result<(), BoxError> {
        self.begins.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn commit(&self) -> Result<(), BoxError> {
        if self.fail_commit.load(Ordering::SeqCst) {
            return Err(Box::new(MockError::Local("commit")));
        }
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn rollback(&self) -> Result<(), BoxError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// A physical connection produced by [`MockFactory`].
#[derive(Debug)]
pub struct MockConnection {
    serial: u64,
    key: RequestKey,
    support: MockSupport,
    local: Arc<MockLocalTransaction>,
    xa: Arc<MockXaResource>,
    metadata: Option<ProductInfo>,
    broken: AtomicBool,
    fail_cleanup: AtomicBool,
    cleanups: AtomicUsize,
}

impl MockConnection {
    /// Creation order within the factory, starting at 1.
    #[must_use]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    /// The request key the connection was created for.
    #[must_use]
    pub fn key(&self) -> &RequestKey {
        &self.key
    }

    /// The local transaction, whatever the configured support.
    #[must_use]
    pub fn local(&self) -> &Arc<MockLocalTransaction> {
        &self.local
    }

    /// The native XA resource, whatever the configured support.
    #[must_use]
    pub fn xa(&self) -> &Arc<MockXaResource> {
        &self.xa
    }

    /// Make validation of this connection fail.
    pub fn break_connection(&self) {
        self.broken.store(true, Ordering::SeqCst);
    }

    /// Make cleanup of this connection fail.
    pub fn fail_cleanup(&self, fail: bool) {
        self.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    /// Number of cleanups run.
    #[must_use]
    pub fn cleanups(&self) -> usize {
        self.cleanups.load(Ordering::SeqCst)
    }
}

impl ManagedConnection for MockConnection {
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        (self.support == MockSupport::Xa).then(|| Arc::clone(&self.xa) as Arc<dyn XaResource>)
    }

    fn local_transaction(&self) -> Option<Arc<dyn LocalTransaction>> {
        (self.support == MockSupport::Local)
            .then(|| Arc::clone(&self.local) as Arc<dyn LocalTransaction>)
    }

    fn cleanup(&self) -> Result<(), BoxError> {
        self.cleanups.fetch_add(1, Ordering::SeqCst);
        if self.fail_cleanup.load(Ordering::SeqCst) {
            return Err(Box::new(MockError::Cleanup(self.serial)));
        }
        Ok(())
    }

    fn metadata(&self) -> Option<ProductInfo> {
        self.metadata.clone()
    }
}

/// Factory producing [`MockConnection`]s.
///
/// A connection matches a request key only if it was created for an
/// equal key.
#[derive(Debug, Default)]
pub struct MockFactory {
    support: MockSupport,
    metadata: Option<ProductInfo>,
    next_serial: AtomicU64,
    created: AtomicUsize,
    destroyed: AtomicUsize,
    validations: AtomicUsize,
    failing_creates: AtomicUsize,
}

impl MockFactory {
    /// Factory whose connections offer `support`.
    #[must_use]
    pub fn new(support: MockSupport) -> Self {
        Self {
            support,
            ..Self::default()
        }
    }

    /// Report `product` as the connections' metadata.
    #[must_use]
    pub fn with_metadata(mut self, product: ProductInfo) -> Self {
        self.metadata = Some(product);
        self
    }

    /// Make the next `count` creations fail.
    pub fn fail_next_creates(&self, count: usize) {
        self.failing_creates.store(count, Ordering::SeqCst);
    }

    /// Connections created.
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    /// Connections destroyed.
    #[must_use]
    pub fn destroyed(&self) -> usize {
        self.destroyed.load(Ordering::SeqCst)
    }

    /// Validations performed.
    #[must_use]
    pub fn validations(&self) -> usize {
        self.validations.load(Ordering::SeqCst)
    }

    /// Connections alive.
    #[must_use]
    pub fn live(&self) -> usize {
        self.created().saturating_sub(self.destroyed())
    }
}

impl ManagedConnectionFactory for MockFactory {
    type Connection = MockConnection;

    fn create(&self, key: &RequestKey) -> Result<MockConnection, BoxError> {
        let take_failure = self
            .failing_creates
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if take_failure {
            tracing::debug!(key = %key, "mock connection refused");
            return Err(Box::new(MockError::ConnectionRefused));
        }

        let serial = self.next_serial.fetch_add(1, Ordering::SeqCst) + 1;
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(MockConnection {
            serial,
            key: key.clone(),
            support: self.support,
            local: Arc::default(),
            xa: Arc::default(),
            metadata: self.metadata.clone(),
            broken: AtomicBool::new(false),
            fail_cleanup: AtomicBool::new(false),
            cleanups: AtomicUsize::new(0),
        })
    }

    fn validate(&self, connection: &MockConnection) -> Result<(), BoxError> {
        self.validations.fetch_add(1, Ordering::SeqCst);
        if connection.broken.load(Ordering::SeqCst) {
            return Err(Box::new(MockError::Broken(connection.serial)));
        }
        Ok(())
    }

    fn matches(&self, connection: &MockConnection, key: &RequestKey) -> bool {
        connection.key == *key
    }

    fn destroy(&self, _connection: &MockConnection) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_scripted_create_failures() {
        let factory = MockFactory::new(MockSupport::Xa);
        factory.fail_next_creates(2);
        assert!(factory.create(&RequestKey::none()).is_err());
        assert!(factory.create(&RequestKey::none()).is_err());

        let connection = factory.create(&RequestKey::none()).unwrap();
        assert_eq!(connection.serial(), 1);
        assert_eq!(factory.created(), 1);
    }

    #[test]
    fn test_support_selects_capabilities() {
        let xa = MockFactory::new(MockSupport::Xa)
            .create(&RequestKey::none())
            .unwrap();
        assert!(xa.xa_resource().is_some());
        assert!(xa.local_transaction().is_none());

        let local = MockFactory::new(MockSupport::Local)
            .create(&RequestKey::none())
            .unwrap();
        assert!(local.xa_resource().is_none());
        assert!(local.local_transaction().is_some());
    }

    #[test]
    fn test_matching_and_validation() {
        let factory = MockFactory::default();
        let connection = factory.create(&RequestKey::new("alice")).unwrap();
        assert!(factory.matches(&connection, &RequestKey::new("alice")));
        assert!(!factory.matches(&connection, &RequestKey::new("bob")));

        assert!(factory.validate(&connection).is_ok());
        connection.break_connection();
        assert!(factory.validate(&connection).is_err());
        assert_eq!(factory.validations(), 2);
    }
}
