//! Local-transaction enlistment tests.
//!
//! Connections that only offer a local transaction are enlisted through a
//! [`txconn_xa::LocalXaResource`]. A protocol violation or a failed local
//! commit makes the connection unusable and it must never be handed out
//! again.

#![allow(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use txconn_manager::{EnlistmentManager, ManagerConfig, TransactionSupport};
use txconn_pool::{PoolBuilder, RequestKey};
use txconn_testing::{InMemoryCoordinator, MockFactory, MockSupport, capture_logs};
use txconn_xa::{CoordinatorError, XaError, XaFlags, XaResource, Xid};

fn setup(max: u32) -> (Arc<InMemoryCoordinator>, Arc<EnlistmentManager<MockFactory>>) {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let pool = PoolBuilder::new()
        .name("local")
        .max_connections(max)
        .connection_timeout(Duration::from_millis(50))
        .build(MockFactory::new(MockSupport::Local))
        .unwrap();
    let manager = EnlistmentManager::builder(pool)
        .config(
            ManagerConfig::new()
                .name("local")
                .transaction_support(TransactionSupport::LocalTransaction),
        )
        .coordinator(coordinator.clone())
        .build()
        .unwrap();
    (coordinator, manager)
}

// =============================================================================
// Commit and rollback
// =============================================================================

#[test]
fn test_local_transaction_follows_coordinator() {
    let (coordinator, manager) = setup(1);

    coordinator.begin().unwrap();
    let handle = manager.get_connection(&RequestKey::none()).unwrap();
    let connection = handle.connection().unwrap();
    assert_eq!(connection.local().begins(), 1);
    drop(handle);
    coordinator.commit().unwrap();

    assert_eq!(connection.local().commits(), 1);
    assert_eq!(manager.pool().status().available, 1);

    coordinator.begin().unwrap();
    drop(manager.get_connection(&RequestKey::none()).unwrap());
    coordinator.rollback().unwrap();

    assert_eq!(connection.local().begins(), 2);
    assert_eq!(connection.local().rollbacks(), 1);
    assert_eq!(manager.pool().factory().created(), 1);
}

#[test]
fn test_local_transaction_untouched_outside_transaction() {
    let (_coordinator, manager) = setup(1);
    let handle = manager.get_connection(&RequestKey::none()).unwrap();
    let connection = handle.connection().unwrap();

    assert!(handle.listener().unwrap().xa_resource().is_some());
    assert_eq!(connection.local().begins(), 0);
}

#[test]
fn test_two_local_resources_commit_with_warning() {
    let (coordinator, manager) = setup(2);
    let (logs, _guard) = capture_logs();

    coordinator.begin().unwrap();
    let a = manager.get_connection(&RequestKey::new("a")).unwrap();
    let b = manager.get_connection(&RequestKey::new("b")).unwrap();
    let connections = [a.connection().unwrap(), b.connection().unwrap()];
    drop((a, b));
    coordinator.commit().unwrap();

    for connection in &connections {
        assert_eq!(connection.local().commits(), 1);
    }
    assert_eq!(
        logs.matching(tracing::Level::WARN, "cannot take part in two-phase commit")
            .len(),
        2
    );
}

// =============================================================================
// Failures
// =============================================================================

#[test]
fn test_branch_mismatch_evicts_connection() {
    let (coordinator, manager) = setup(1);
    coordinator.begin().unwrap();

    let handle = manager.get_connection(&RequestKey::none()).unwrap();
    let listener = handle.listener().unwrap();
    let resource = listener.xa_resource().unwrap();

    let stranger = Xid::generate();
    let err = resource.commit(&stranger, true).unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(matches!(err, XaError::Protocol { .. }));

    assert!(listener.is_destroyed());
    assert_eq!(manager.pool().factory().destroyed(), 1);
    assert_eq!(handle.connection().unwrap().local().commits(), 0);

    coordinator.rollback().unwrap();
    drop(handle);

    // The broken connection is never handed out again.
    let fresh = manager.get_connection(&RequestKey::none()).unwrap();
    assert_ne!(fresh.listener().unwrap().id(), listener.id());
    assert_eq!(fresh.connection().unwrap().serial(), 2);
    assert_eq!(manager.pool().status().total, 1);
}

#[test]
fn test_end_of_stranger_branch_evicts_connection() {
    let (coordinator, manager) = setup(1);
    coordinator.begin().unwrap();

    let handle = manager.get_connection(&RequestKey::none()).unwrap();
    let listener = handle.listener().unwrap();
    let resource = listener.xa_resource().unwrap();

    let err = resource.end(&Xid::generate(), XaFlags::SUCCESS).unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(listener.is_destroyed());
    assert_eq!(manager.pool().factory().destroyed(), 1);

    coordinator.rollback().unwrap();
    drop(handle);

    let fresh = manager.get_connection(&RequestKey::none()).unwrap();
    assert_eq!(fresh.connection().unwrap().serial(), 2);
}

#[test]
fn test_failed_local_commit_evicts_connection() {
    let (coordinator, manager) = setup(1);
    coordinator.begin().unwrap();

    let handle = manager.get_connection(&RequestKey::none()).unwrap();
    let connection = handle.connection().unwrap();
    let listener = handle.listener().unwrap();
    connection.local().fail_commit(true);
    drop(handle);

    let err = coordinator.commit().unwrap_err();
    assert!(matches!(
        err,
        CoordinatorError::Resource(XaError::RolledBack { .. })
    ));
    assert!(listener.is_destroyed());
    assert_eq!(manager.pool().status().total, 0);

    let fresh = manager.get_connection(&RequestKey::none()).unwrap();
    assert_eq!(fresh.connection().unwrap().serial(), 2);
}

#[test]
fn test_connection_without_local_transaction_is_not_enlisted() {
    let coordinator = Arc::new(InMemoryCoordinator::new());
    let pool = PoolBuilder::new()
        .max_connections(1)
        .build(MockFactory::new(MockSupport::None))
        .unwrap();
    let manager = EnlistmentManager::builder(pool)
        .config(ManagerConfig::new().transaction_support(TransactionSupport::LocalTransaction))
        .coordinator(coordinator.clone())
        .build()
        .unwrap();

    let tx = coordinator.begin().unwrap();
    let handle = manager.get_connection(&RequestKey::none()).unwrap();
    assert!(handle.listener().unwrap().xa_resource().is_none());
    assert_eq!(coordinator.enlisted(tx), 0);

    drop(handle);
    assert_eq!(manager.pool().status().available, 1);
}
