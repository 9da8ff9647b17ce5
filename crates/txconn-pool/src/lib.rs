//! # txconn-pool
//!
//! Bounded pool of physical connections for transactional resources.
//!
//! Unlike a generic object pool, every pooled connection is wrapped in a
//! [`ConnectionListener`] that knows which handles use it and which
//! transaction it is enlisted in, so a connection is only recycled once
//! nothing holds it.
//!
//! ## Features
//!
//! - Blocking checkout with a timeout and request-key matching
//! - Validation on create, on match and in the background
//! - Idle reaping that honours the minimum size, with refill
//! - Transaction-bound listeners for non-interleaved use
//! - Flush modes, status and metrics
//!
//! ## Example
//!
//! ```rust,ignore
//! use txconn_pool::{PoolBuilder, RequestKey};
//! use std::time::Duration;
//!
//! let pool = PoolBuilder::new()
//!     .min_connections(5)
//!     .max_connections(20)
//!     .idle_timeout(Duration::from_secs(300))
//!     .build(factory)?;
//!
//! let listener = pool.acquire(&RequestKey::new("user=app"))?;
//! // Use the listener's connection...
//! pool.release(&listener);
//!
//! let status = pool.status();
//! println!("Pool utilization: {:.1}%", status.utilization());
//!
//! let metrics = pool.metrics();
//! println!("Checkout success rate: {:.2}", metrics.checkout_success_rate());
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod config;
pub mod error;
pub mod lifecycle;
pub mod listener;
pub mod pool;

// Configuration
pub use config::PoolConfig;

// Error types
pub use error::PoolError;

// Pool types
pub use pool::{FlushMode, Listener, Pool, PoolBuilder, PoolMetrics, PoolStatus, WeakPool};

// Listener state
pub use listener::{
    ConnectionListener, EnlistmentState, HandleId, HandleRelease, Lifecycle, ListenerId,
};

// Lifecycle management
pub use lifecycle::{ManagedConnection, ManagedConnectionFactory, ProductInfo, RequestKey};
