//! # txconn-xa
//!
//! Transaction vocabulary shared by the `txconn` crates.
//!
//! This crate holds everything the pool and manager need to talk to a
//! transaction coordinator without depending on one:
//!
//! - [`Xid`], [`XaFlags`], [`Vote`] and the raw XA codes
//! - the [`XaResource`] and [`LocalTransaction`] resource contracts
//! - [`LocalXaResource`], which enlists a local-only connection
//! - [`XaResourceWrapper`], which decorates a native resource
//! - [`TransactionCoordinator`] and [`Synchronization`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use txconn_xa::{LocalXaResource, XaFlags, XaResource, Xid};
//!
//! let resource = LocalXaResource::new("orders", connection.local_transaction());
//! let xid = Xid::generate();
//!
//! resource.start(&xid, XaFlags::NONE)?;
//! // work happens on the connection
//! resource.end(&xid, XaFlags::SUCCESS)?;
//! resource.commit(&xid, true)?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod error;
pub mod flags;
pub mod local;
pub mod resource;
pub mod transaction;
pub mod wrapper;
pub mod xid;

pub use error::{BoxError, CoordinatorError, XaError};
pub use flags::{Vote, XaFlags, codes};
pub use local::LocalXaResource;
pub use resource::{FailureListener, LocalTransaction, XaResource, same_resource, unwrap_resource};
pub use transaction::{Synchronization, TransactionCoordinator, TxId, TxStatus};
pub use wrapper::{WrapperConfig, XaResourceWrapper};
pub use xid::Xid;
