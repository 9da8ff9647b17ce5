//! In-memory transaction coordinator.
//!
//! Transactions are bound to the thread that began or resumed them.
//! Enlisted resources get their own branch unless they report the same
//! resource manager as an existing one, in which case they join it.
//! Commit is one-phase for a single branch and prepare-then-commit
//! otherwise. Synchronizations run around completion like they would
//! with a real coordinator.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::{self, ThreadId};

use hashbrown::HashMap;
use parking_lot::Mutex;
use txconn_xa::{
    CoordinatorError, Synchronization, TransactionCoordinator, TxId, TxStatus, Vote, XaError,
    XaFlags, XaResource, Xid, same_resource,
};

struct Branch {
    resource: Arc<dyn XaResource>,
    xid: Xid,
    joined: bool,
    ended: bool,
}

struct TxRecord {
    status: TxStatus,
    global: Xid,
    branches: Vec<Branch>,
    next_branch: u32,
    syncs: Vec<Arc<dyn Synchronization>>,
}

/// Test coordinator keeping all state in memory.
#[derive(Default)]
pub struct InMemoryCoordinator {
    next_tx: AtomicU64,
    transactions: Mutex<HashMap<TxId, TxRecord>>,
    current: Mutex<HashMap<ThreadId, TxId>>,
    refuse_enlist: AtomicBool,
    fail_registration: AtomicBool,
    fail_delist: AtomicBool,
}

impl InMemoryCoordinator {
    /// Create a coordinator.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Begin a transaction on the calling thread.
    pub fn begin(&self) -> Result<TxId, CoordinatorError> {
        let me = thread::current().id();
        let mut current = self.current.lock();
        if let Some(tx) = current.get(&me) {
            return Err(CoordinatorError::IllegalState {
                tx: tx.to_string(),
                status: "already associated with this thread".into(),
            });
        }

        let tx = TxId::from_raw(self.next_tx.fetch_add(1, Ordering::SeqCst) + 1);
        self.transactions.lock().insert(
            tx,
            TxRecord {
                status: TxStatus::Active,
                global: Xid::generate(),
                branches: Vec::new(),
                next_branch: 0,
                syncs: Vec::new(),
            },
        );
        current.insert(me, tx);
        tracing::debug!(tx = %tx, "transaction begun");
        Ok(tx)
    }

    /// Dissociate the calling thread from its transaction.
    pub fn suspend(&self) -> Option<TxId> {
        self.current.lock().remove(&thread::current().id())
    }

    /// Associate the calling thread with `tx`.
    pub fn resume(&self, tx: TxId) -> Result<(), CoordinatorError> {
        if !self.transactions.lock().contains_key(&tx) {
            return Err(CoordinatorError::UnknownTransaction(tx.to_string()));
        }
        self.current.lock().insert(thread::current().id(), tx);
        Ok(())
    }

    /// Mark `tx` rollback-only.
    pub fn mark_rollback(&self, tx: TxId) -> Result<(), CoordinatorError> {
        let mut transactions = self.transactions.lock();
        let record = transactions
            .get_mut(&tx)
            .ok_or_else(|| CoordinatorError::UnknownTransaction(tx.to_string()))?;
        record.status = TxStatus::MarkedRollback;
        Ok(())
    }

    /// Refuse subsequent enlistments.
    pub fn refuse_enlistment(&self, refuse: bool) {
        self.refuse_enlist.store(refuse, Ordering::SeqCst);
    }

    /// Fail subsequent synchronization registrations.
    pub fn fail_registration(&self, fail: bool) {
        self.fail_registration.store(fail, Ordering::SeqCst);
    }

    /// Fail subsequent delistments.
    pub fn fail_delist(&self, fail: bool) {
        self.fail_delist.store(fail, Ordering::SeqCst);
    }

    /// Number of branches enlisted in `tx`, joined ones included.
    #[must_use]
    pub fn enlisted(&self, tx: TxId) -> usize {
        self.transactions
            .lock()
            .get(&tx)
            .map_or(0, |record| record.branches.len())
    }

    /// Commit the calling thread's transaction.
    ///
    /// Returns the final status; a transaction that had to be rolled back
    /// reports [`CoordinatorError::RolledBack`].
    pub fn commit(&self) -> Result<TxStatus, CoordinatorError> {
        let tx = self.take_current()?;

        for sync in self.syncs(tx) {
            sync.before_completion();
        }

        let (marked, branches) = self.start_completion(tx, TxStatus::Preparing)?;
        if marked {
            self.rollback_branches(tx, &branches);
            self.finish(tx, TxStatus::RolledBack);
            return Err(CoordinatorError::RolledBack(tx.to_string()));
        }

        let outcome = match branches.as_slice() {
            [(resource, xid)] => resource.commit(xid, true).map_err(CoordinatorError::from),
            _ => self.two_phase(tx, &branches),
        };

        match outcome {
            Ok(()) => {
                self.finish(tx, TxStatus::Committed);
                Ok(TxStatus::Committed)
            }
            Err(e) => {
                tracing::warn!(tx = %tx, error = %e, "commit failed");
                self.finish(tx, TxStatus::RolledBack);
                Err(e)
            }
        }
    }

    /// Roll back the calling thread's transaction.
    pub fn rollback(&self) -> Result<(), CoordinatorError> {
        let tx = self.take_current()?;
        let (_, branches) = self.start_completion(tx, TxStatus::RollingBack)?;
        self.rollback_branches(tx, &branches);
        self.finish(tx, TxStatus::RolledBack);
        Ok(())
    }

    fn take_current(&self) -> Result<TxId, CoordinatorError> {
        self.suspend()
            .ok_or_else(|| CoordinatorError::Other("no transaction on this thread".into()))
    }

    fn syncs(&self, tx: TxId) -> Vec<Arc<dyn Synchronization>> {
        self.transactions
            .lock()
            .get(&tx)
            .map(|record| record.syncs.clone())
            .unwrap_or_default()
    }

    /// End open branches and return the branches owning a commit.
    fn start_completion(
        &self,
        tx: TxId,
        status: TxStatus,
    ) -> Result<(bool, Vec<(Arc<dyn XaResource>, Xid)>), CoordinatorError> {
        let (marked, to_end, owners) = {
            let mut transactions = self.transactions.lock();
            let record = transactions
                .get_mut(&tx)
                .ok_or_else(|| CoordinatorError::UnknownTransaction(tx.to_string()))?;
            let marked = record.status == TxStatus::MarkedRollback;
            record.status = status;

            let mut to_end = Vec::new();
            for branch in record.branches.iter_mut().filter(|b| !b.ended) {
                branch.ended = true;
                to_end.push((Arc::clone(&branch.resource), branch.xid.clone()));
            }
            let owners: Vec<_> = record
                .branches
                .iter()
                .filter(|b| !b.joined)
                .map(|b| (Arc::clone(&b.resource), b.xid.clone()))
                .collect();
            (marked, to_end, owners)
        };

        let flags = if marked || status == TxStatus::RollingBack {
            XaFlags::FAIL
        } else {
            XaFlags::SUCCESS
        };
        for (resource, xid) in to_end {
            if let Err(e) = resource.end(&xid, flags) {
                tracing::warn!(tx = %tx, xid = %xid, error = %e, "end failed");
            }
        }
        Ok((marked, owners))
    }

    fn two_phase(
        &self,
        tx: TxId,
        branches: &[(Arc<dyn XaResource>, Xid)],
    ) -> Result<(), CoordinatorError> {
        let mut to_commit = Vec::new();
        for (resource, xid) in branches {
            match resource.prepare(xid) {
                Ok(Vote::Commit) => to_commit.push((resource, xid)),
                Ok(Vote::ReadOnly) => {}
                Err(e) => {
                    self.rollback_branches(tx, branches);
                    return Err(CoordinatorError::Resource(e));
                }
            }
        }
        self.set_status(tx, TxStatus::Committing);
        let mut first_error: Option<XaError> = None;
        for (resource, xid) in to_commit {
            if let Err(e) = resource.commit(xid, false) {
                tracing::warn!(tx = %tx, xid = %xid, error = %e, "second-phase commit failed");
                first_error.get_or_insert(e);
            }
        }
        first_error.map_or(Ok(()), |e| Err(CoordinatorError::Resource(e)))
    }

    fn rollback_branches(&self, tx: TxId, branches: &[(Arc<dyn XaResource>, Xid)]) {
        for (resource, xid) in branches {
            if let Err(e) = resource.rollback(xid) {
                tracing::warn!(tx = %tx, xid = %xid, error = %e, "rollback failed");
            }
        }
    }

    fn set_status(&self, tx: TxId, status: TxStatus) {
        if let Some(record) = self.transactions.lock().get_mut(&tx) {
            record.status = status;
        }
    }

    fn finish(&self, tx: TxId, status: TxStatus) {
        self.set_status(tx, status);
        for sync in self.syncs(tx) {
            sync.after_completion(status);
        }
        tracing::debug!(tx = %tx, %status, "transaction completed");
    }
}

impl TransactionCoordinator for InMemoryCoordinator {
    fn current_transaction(&self) -> Result<Option<TxId>, CoordinatorError> {
        Ok(self.current.lock().get(&thread::current().id()).copied())
    }

    fn status(&self, tx: &TxId) -> Result<TxStatus, CoordinatorError> {
        self.transactions
            .lock()
            .get(tx)
            .map(|record| record.status)
            .ok_or_else(|| CoordinatorError::UnknownTransaction(tx.to_string()))
    }

    fn register_synchronization(
        &self,
        tx: &TxId,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), CoordinatorError> {
        if self.fail_registration.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Other("registration refused".into()));
        }
        let mut transactions = self.transactions.lock();
        let record = transactions
            .get_mut(tx)
            .ok_or_else(|| CoordinatorError::UnknownTransaction(tx.to_string()))?;
        if !record.status.is_uncommitted() {
            return Err(CoordinatorError::IllegalState {
                tx: tx.to_string(),
                status: record.status.to_string(),
            });
        }
        record.syncs.push(sync);
        Ok(())
    }

    fn enlist_resource(
        &self,
        tx: &TxId,
        resource: Arc<dyn XaResource>,
    ) -> Result<bool, CoordinatorError> {
        if self.refuse_enlist.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let candidates: Vec<(Arc<dyn XaResource>, Xid)> = {
            let transactions = self.transactions.lock();
            let record = transactions
                .get(tx)
                .ok_or_else(|| CoordinatorError::UnknownTransaction(tx.to_string()))?;
            if !record.status.is_active() {
                return Err(CoordinatorError::IllegalState {
                    tx: tx.to_string(),
                    status: record.status.to_string(),
                });
            }
            record
                .branches
                .iter()
                .filter(|b| !b.joined)
                .map(|b| (Arc::clone(&b.resource), b.xid.clone()))
                .collect()
        };

        let mut joined = None;
        for (existing, xid) in &candidates {
            if same_resource(existing.as_ref(), resource.as_ref())
                || existing.is_same_rm(resource.as_ref())?
            {
                joined = Some(xid.clone());
                break;
            }
        }

        let (xid, flags, joined) = match joined {
            Some(xid) => (xid, XaFlags::JOIN, true),
            None => {
                let mut transactions = self.transactions.lock();
                let record = transactions
                    .get_mut(tx)
                    .ok_or_else(|| CoordinatorError::UnknownTransaction(tx.to_string()))?;
                record.next_branch += 1;
                let xid = record.global.branch(&record.next_branch.to_be_bytes())?;
                (xid, XaFlags::NONE, false)
            }
        };

        resource.start(&xid, flags)?;
        tracing::trace!(tx = %tx, xid = %xid, joined, "resource enlisted");

        if let Some(record) = self.transactions.lock().get_mut(tx) {
            record.branches.push(Branch {
                resource,
                xid,
                joined,
                ended: false,
            });
        }
        Ok(true)
    }

    fn delist_resource(
        &self,
        tx: &TxId,
        resource: &Arc<dyn XaResource>,
        flags: XaFlags,
    ) -> Result<bool, CoordinatorError> {
        if self.fail_delist.load(Ordering::SeqCst) {
            return Err(CoordinatorError::Other("delist refused".into()));
        }

        let xid = {
            let mut transactions = self.transactions.lock();
            let record = transactions
                .get_mut(tx)
                .ok_or_else(|| CoordinatorError::UnknownTransaction(tx.to_string()))?;
            let Some(branch) = record
                .branches
                .iter_mut()
                .rev()
                .find(|b| !b.ended && same_resource(b.resource.as_ref(), resource.as_ref()))
            else {
                return Ok(false);
            };
            branch.ended = true;
            if flags.contains(XaFlags::FAIL) {
                record.status = TxStatus::MarkedRollback;
            }
            branch.xid.clone()
        };

        resource.end(&xid, flags)?;
        tracing::trace!(tx = %tx, xid = %xid, ?flags, "resource delisted");
        Ok(true)
    }
}

impl std::fmt::Debug for InMemoryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryCoordinator")
            .field("transactions", &self.transactions.lock().len())
            .finish_non_exhaustive()
    }
}
