//! # txconn-testing
//!
//! Test infrastructure for the `txconn` crates.
//!
//! ## Features
//!
//! - [`MockFactory`]: scripted connections offering local, XA or no
//!   transaction support
//! - [`InMemoryCoordinator`]: a thread-bound coordinator with one- and
//!   two-phase commit
//! - [`init_tracing`] and [`capture_logs`] for tests that look at logs
//!
//! ## Example
//!
//! ```rust,ignore
//! use std::sync::Arc;
//! use txconn_manager::EnlistmentManager;
//! use txconn_pool::{PoolBuilder, RequestKey};
//! use txconn_testing::{InMemoryCoordinator, MockFactory, MockSupport};
//!
//! let coordinator = Arc::new(InMemoryCoordinator::new());
//! let pool = PoolBuilder::new().max_connections(2).build(MockFactory::new(MockSupport::Xa))?;
//! let manager = EnlistmentManager::builder(pool)
//!     .coordinator(coordinator.clone())
//!     .build()?;
//!
//! coordinator.begin()?;
//! let handle = manager.get_connection(&RequestKey::none())?;
//! coordinator.commit()?;
//! ```

#![warn(missing_docs)]
#![deny(unsafe_code)]

pub mod coordinator;
pub mod mock;

use std::fmt::Write as _;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing_subscriber::layer::{Context, SubscriberExt as _};
use tracing_subscriber::util::SubscriberInitExt as _;
use tracing_subscriber::{EnvFilter, Layer};

pub use coordinator::InMemoryCoordinator;
pub use mock::{
    MockConnection, MockError, MockFactory, MockLocalTransaction, MockSupport, MockXaResource,
    XaCall,
};

/// Install a global fmt subscriber filtered by `RUST_LOG`.
///
/// Safe to call from every test; only the first call installs anything.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// One event seen by [`capture_logs`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapturedEvent {
    /// Event level.
    pub level: tracing::Level,
    /// Rendered message followed by `name=value` pairs.
    pub text: String,
}

/// Events recorded on the current thread while the guard is alive.
#[derive(Debug, Clone, Default)]
pub struct CapturedLogs {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

impl CapturedLogs {
    /// All events recorded so far.
    #[must_use]
    pub fn events(&self) -> Vec<CapturedEvent> {
        self.events.lock().clone()
    }

    /// Events at `level` whose text contains `needle`.
    #[must_use]
    pub fn matching(&self, level: tracing::Level, needle: &str) -> Vec<CapturedEvent> {
        self.events
            .lock()
            .iter()
            .filter(|event| event.level == level && event.text.contains(needle))
            .cloned()
            .collect()
    }
}

struct CaptureLayer {
    events: Arc<Mutex<Vec<CapturedEvent>>>,
}

#[derive(Default)]
struct TextVisitor {
    text: String,
}

impl tracing::field::Visit for TextVisitor {
    fn record_debug(&mut self, field: &tracing::field::Field, value: &dyn std::fmt::Debug) {
        if field.name() == "message" {
            let _ = write!(self.text, "{value:?}");
        } else {
            let _ = write!(self.text, " {}={value:?}", field.name());
        }
    }

    fn record_str(&mut self, field: &tracing::field::Field, value: &str) {
        if field.name() == "message" {
            self.text.push_str(value);
        } else {
            let _ = write!(self.text, " {}={value}", field.name());
        }
    }
}

impl<S: tracing::Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &tracing::Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = TextVisitor::default();
        event.record(&mut visitor);
        self.events.lock().push(CapturedEvent {
            level: *event.metadata().level(),
            text: visitor.text,
        });
    }
}

/// Record every event emitted on the current thread until the returned
/// guard is dropped.
#[must_use = "events are only captured while the guard is alive"]
pub fn capture_logs() -> (CapturedLogs, tracing::subscriber::DefaultGuard) {
    let logs = CapturedLogs::default();
    let layer = CaptureLayer {
        events: Arc::clone(&logs.events),
    };
    let guard = tracing_subscriber::registry().with(layer).set_default();
    (logs, guard)
}
