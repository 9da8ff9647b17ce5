//! # txconn-manager
//!
//! Transaction-aware connection management on top of `txconn-pool`.
//!
//! This is the primary public API surface of the txconn workspace. Callers
//! obtain [`ConnectionHandle`]s from an [`EnlistmentManager`]; the manager
//! enlists the pooled connection behind each handle in the caller's
//! transaction and returns it to the pool when neither a handle nor a
//! transaction holds it any more.
//!
//! ## Features
//!
//! - **Enlistment**: XA resources, optionally wrapped, and local
//!   transactions through a single-resource adapter
//! - **Transaction binding**: without interleaving, one connection per
//!   transaction and request key
//! - **Association cache**: thread-scoped contexts that disconnect handles
//!   on exit and reconnect them, on any thread, on re-entry
//! - **Leak detection**: debug mode closes handles left open and logs
//!   where they were allocated
//! - **Closed error taxonomy**: every error maps to an [`ErrorKind`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use txconn_manager::{AssociationCache, CacheConfig, ContextKey, EnlistmentManager, ManagerConfig};
//! use txconn_pool::{PoolBuilder, RequestKey};
//!
//! let pool = PoolBuilder::new().max_connections(10).build(factory)?;
//! let cache = Arc::new(AssociationCache::new(CacheConfig::default())?);
//! let manager = EnlistmentManager::builder(pool)
//!     .config(ManagerConfig::new().name("orders"))
//!     .coordinator(coordinator)
//!     .cache(Arc::clone(&cache))
//!     .build()?;
//!
//! let guard = cache.enter(ContextKey::unique())?;
//! let handle = manager.get_connection(&RequestKey::new("user=app"))?;
//! let connection = handle.connection()?;
//! // Use the connection...
//! handle.close()?;
//! guard.exit()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod cache;
pub mod config;
pub mod error;
pub mod handle;
pub mod manager;

// Configuration
pub use config::{CacheConfig, ManagerConfig, TransactionSupport};

// Error types
pub use error::{Error, ErrorKind, Result};

// Manager and handles
pub use handle::{ConnectionHandle, TrackedHandle};
pub use manager::{EnlistmentManager, ManagerBuilder};

// Association cache
pub use cache::{
    AssociationCache, ConnectionCacheListener, ConnectionRecord, ContextGuard, ContextKey,
    ManagerId,
};
