//! XA facade over a resource-local transaction.
//!
//! A connection that only supports local transactions can still be
//! enlisted with a coordinator as a single last resource: `start` begins
//! the local transaction, `prepare` votes commit without doing anything,
//! and `commit`/`rollback` finish the local transaction.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::XaError;
use crate::flags::{Vote, XaFlags};
use crate::resource::{FailureListener, LocalTransaction, XaResource, same_resource, unwrap_resource};
use crate::xid::Xid;

/// [`XaResource`] backed by a [`LocalTransaction`].
pub struct LocalXaResource {
    name: String,
    local: Arc<dyn LocalTransaction>,
    current: Mutex<Option<Xid>>,
    prepare_warned: AtomicBool,
    failure_listener: OnceCell<Box<dyn FailureListener>>,
}

impl LocalXaResource {
    /// Create an adapter for `local`. `name` identifies it in logs.
    pub fn new(name: impl Into<String>, local: Arc<dyn LocalTransaction>) -> Self {
        Self {
            name: name.into(),
            local,
            current: Mutex::new(None),
            prepare_warned: AtomicBool::new(false),
            failure_listener: OnceCell::new(),
        }
    }

    /// Install the listener told about fatal failures.
    ///
    /// Only the first listener is kept; returns `false` if one was
    /// already installed.
    pub fn set_failure_listener(&self, listener: Box<dyn FailureListener>) -> bool {
        self.failure_listener.set(listener).is_ok()
    }

    /// The branch the local transaction currently belongs to.
    #[must_use]
    pub fn current_branch(&self) -> Option<Xid> {
        self.current.lock().clone()
    }

    fn fail(&self, error: XaError) -> XaError {
        tracing::warn!(resource = %self.name, error = %error, "local resource failed");
        if let Some(listener) = self.failure_listener.get() {
            listener.resource_failed(&error);
        }
        error
    }

    /// Take the recorded branch if it matches `xid`.
    fn finish_branch(&self, xid: &Xid, operation: &str) -> Result<(), XaError> {
        let mut current = self.current.lock();
        if current.as_ref() == Some(xid) {
            *current = None;
            return Ok(());
        }

        let message = match current.as_ref() {
            Some(active) => format!("{operation} of {xid} while {active} is active"),
            None => format!("{operation} of {xid} with no active branch"),
        };
        drop(current);
        Err(self.fail(XaError::protocol(message)))
    }
}

impl XaResource for LocalXaResource {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        let mut current = self.current.lock();

        if flags.continues_branch() {
            if current.as_ref() == Some(xid) {
                return Ok(());
            }
            drop(current);
            return Err(self.fail(XaError::protocol(format!(
                "cannot join {xid}: not the active branch"
            ))));
        }

        if let Some(active) = current.as_ref() {
            let message = format!("cannot start {xid}: {active} is not complete");
            drop(current);
            return Err(self.fail(XaError::protocol(message)));
        }

        self.local
            .begin()
            .map_err(|e| XaError::resource_manager("begin local transaction", e))?;
        *current = Some(xid.clone());

        tracing::debug!(resource = %self.name, xid = %xid, "local transaction begun");
        Ok(())
    }

    fn end(&self, xid: &Xid, _flags: XaFlags) -> Result<(), XaError> {
        if self.current.lock().as_ref() == Some(xid) {
            return Ok(());
        }
        Err(self.fail(XaError::protocol(format!("end of {xid}: not the active branch"))))
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        if !self.prepare_warned.swap(true, Ordering::Relaxed) {
            tracing::warn!(
                resource = %self.name,
                xid = %xid,
                "prepare called on a local-transaction resource; it cannot take part in two-phase commit"
            );
        }
        Ok(Vote::Commit)
    }

    fn commit(&self, xid: &Xid, _one_phase: bool) -> Result<(), XaError> {
        self.finish_branch(xid, "commit")?;

        self.local.commit().map_err(|e| {
            self.fail(XaError::RolledBack {
                message: format!("local commit of {xid} failed"),
                source: Some(e),
            })
        })?;

        tracing::debug!(resource = %self.name, xid = %xid, "local transaction committed");
        Ok(())
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        self.finish_branch(xid, "rollback")?;

        self.local
            .rollback()
            .map_err(|e| self.fail(XaError::resource_manager(format!("local rollback of {xid} failed"), e)))?;

        tracing::debug!(resource = %self.name, xid = %xid, "local transaction rolled back");
        Ok(())
    }

    fn forget(&self, _xid: &Xid) -> Result<(), XaError> {
        Err(XaError::Unsupported("forget on a local-transaction resource"))
    }

    fn recover(&self, _flags: XaFlags) -> Result<Vec<Xid>, XaError> {
        Ok(Vec::new())
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> Result<bool, XaError> {
        Ok(same_resource(self, unwrap_resource(other)))
    }

    fn set_transaction_timeout(&self, _timeout: Duration) -> Result<bool, XaError> {
        Ok(false)
    }
}

impl std::fmt::Debug for LocalXaResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalXaResource")
            .field("name", &self.name)
            .field("current", &*self.current.lock())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::error::BoxError;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Recorder {
        begins: AtomicUsize,
        commits: AtomicUsize,
        rollbacks: AtomicUsize,
        fail_commit: AtomicBool,
    }

    impl LocalTransaction for Recorder {
        fn begin(&self) -> Result<(), BoxError> {
            self.begins.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn commit(&self) -> Result<(), BoxError> {
            if self.fail_commit.load(Ordering::SeqCst) {
                return Err("commit refused".into());
            }
            self.commits.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn rollback(&self) -> Result<(), BoxError> {
            self.rollbacks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct CountFailures(Arc<AtomicUsize>);

    impl FailureListener for CountFailures {
        fn resource_failed(&self, _error: &XaError) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn setup() -> (Arc<Recorder>, LocalXaResource, Arc<AtomicUsize>) {
        let recorder = Arc::new(Recorder::default());
        let resource = LocalXaResource::new("test", recorder.clone());
        let failures = Arc::new(AtomicUsize::new(0));
        assert!(resource.set_failure_listener(Box::new(CountFailures(failures.clone()))));
        (recorder, resource, failures)
    }

    #[test]
    fn test_start_commit_cycle() {
        let (recorder, resource, failures) = setup();
        let xid = Xid::generate();

        resource.start(&xid, XaFlags::NONE).unwrap();
        resource.start(&xid, XaFlags::JOIN).unwrap();
        resource.end(&xid, XaFlags::SUCCESS).unwrap();
        assert_eq!(resource.prepare(&xid).unwrap(), Vote::Commit);
        resource.commit(&xid, false).unwrap();

        assert_eq!(recorder.begins.load(Ordering::SeqCst), 1);
        assert_eq!(recorder.commits.load(Ordering::SeqCst), 1);
        assert_eq!(failures.load(Ordering::SeqCst), 0);
        assert!(resource.current_branch().is_none());
    }

    #[test]
    fn test_commit_of_other_branch_is_protocol_violation() {
        let (recorder, resource, failures) = setup();
        let a = Xid::generate();
        let b = Xid::generate();

        resource.start(&a, XaFlags::NONE).unwrap();
        let err = resource.commit(&b, true).unwrap_err();

        assert!(err.is_protocol_violation());
        assert_eq!(recorder.commits.load(Ordering::SeqCst), 0);
        assert_eq!(failures.load(Ordering::SeqCst), 1);
        assert_eq!(resource.current_branch(), Some(a));
    }

    #[test]
    fn test_start_while_active_is_rejected() {
        let (_, resource, failures) = setup();
        resource.start(&Xid::generate(), XaFlags::NONE).unwrap();
        let err = resource.start(&Xid::generate(), XaFlags::NONE).unwrap_err();
        assert!(err.is_protocol_violation());

        let err = resource.start(&Xid::generate(), XaFlags::JOIN).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_end_of_other_branch_notifies_listener() {
        let (_, resource, failures) = setup();
        let xid = Xid::generate();

        let err = resource.end(&xid, XaFlags::SUCCESS).unwrap_err();
        assert!(err.is_protocol_violation());
        assert_eq!(failures.load(Ordering::SeqCst), 1);

        resource.start(&xid, XaFlags::NONE).unwrap();
        assert!(resource.end(&Xid::generate(), XaFlags::SUCCESS).is_err());
        resource.end(&xid, XaFlags::SUCCESS).unwrap();
        assert_eq!(failures.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_commit_failure_notifies_listener() {
        let (recorder, resource, failures) = setup();
        recorder.fail_commit.store(true, Ordering::SeqCst);
        let xid = Xid::generate();

        resource.start(&xid, XaFlags::NONE).unwrap();
        let err = resource.commit(&xid, true).unwrap_err();

        assert!(matches!(err, XaError::RolledBack { .. }));
        assert_eq!(failures.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_rollback_and_recover() {
        let (recorder, resource, _) = setup();
        let xid = Xid::generate();
        resource.start(&xid, XaFlags::NONE).unwrap();
        resource.rollback(&xid).unwrap();

        assert_eq!(recorder.rollbacks.load(Ordering::SeqCst), 1);
        assert!(resource.recover(XaFlags::START_RSCAN).unwrap().is_empty());
        assert!(resource.forget(&xid).is_err());
    }

    #[test]
    fn test_same_rm_only_with_itself() {
        let (_, a, _) = setup();
        let (_, b, _) = setup();
        assert!(a.is_same_rm(&a).unwrap());
        assert!(!a.is_same_rm(&b).unwrap());
    }
}
