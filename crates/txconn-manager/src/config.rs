//! Manager and cache configuration.

use std::time::Duration;

use crate::error::Error;

/// How connections of a manager take part in transactions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum TransactionSupport {
    /// Connections are pooled but never enlisted.
    NoTransaction,
    /// Connections expose a local transaction, enlisted through an adapter.
    LocalTransaction,
    /// Connections expose a native XA resource.
    #[default]
    XaTransaction,
}

/// Configuration of an [`EnlistmentManager`](crate::EnlistmentManager).
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ManagerConfig {
    /// Manager name, used in logs and as fallback product name.
    pub name: String,

    /// Allow a connection to move between transactions while handles are
    /// open. When disabled, a connection belongs to its transaction until
    /// the transaction completes.
    pub interleaving: bool,

    /// Transaction support of the connections.
    pub transaction_support: TransactionSupport,

    /// Wrap native XA resources in an `XaResourceWrapper`.
    pub wrap_xa_resource: bool,

    /// Pad branch qualifiers to 64 bytes (wrapped resources only).
    pub pad_xid: bool,

    /// Fixed `is_same_rm` answer (wrapped resources only).
    pub same_rm_override: Option<bool>,

    /// Transaction timeout applied to each XA resource.
    pub xa_resource_timeout: Option<Duration>,

    /// Extra attempts when the pool cannot hand out a connection.
    pub allocation_retry: u32,

    /// Pause between allocation attempts.
    pub allocation_retry_wait: Duration,

    /// Report delist failures at context exit instead of only logging them.
    pub error_strict: bool,

    /// Hand out connections while the transaction is marked for rollback
    /// instead of failing. Such connections are not enlisted.
    pub allow_marked_for_rollback: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            interleaving: false,
            transaction_support: TransactionSupport::default(),
            wrap_xa_resource: true,
            pad_xid: false,
            same_rm_override: None,
            xa_resource_timeout: None,
            allocation_retry: 0,
            allocation_retry_wait: Duration::ZERO,
            error_strict: false,
            allow_marked_for_rollback: false,
        }
    }
}

impl ManagerConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the manager name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Enable or disable interleaving.
    #[must_use]
    pub fn interleaving(mut self, enabled: bool) -> Self {
        self.interleaving = enabled;
        self
    }

    /// Set the transaction support.
    #[must_use]
    pub fn transaction_support(mut self, support: TransactionSupport) -> Self {
        self.transaction_support = support;
        self
    }

    /// Enable or disable XA resource wrapping.
    #[must_use]
    pub fn wrap_xa_resource(mut self, enabled: bool) -> Self {
        self.wrap_xa_resource = enabled;
        self
    }

    /// Enable or disable branch qualifier padding.
    #[must_use]
    pub fn pad_xid(mut self, enabled: bool) -> Self {
        self.pad_xid = enabled;
        self
    }

    /// Force the `is_same_rm` answer.
    #[must_use]
    pub fn same_rm_override(mut self, value: Option<bool>) -> Self {
        self.same_rm_override = value;
        self
    }

    /// Set the XA resource transaction timeout.
    #[must_use]
    pub fn xa_resource_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.xa_resource_timeout = timeout;
        self
    }

    /// Set the allocation retry count and pause.
    #[must_use]
    pub fn allocation_retry(mut self, retries: u32, wait: Duration) -> Self {
        self.allocation_retry = retries;
        self.allocation_retry_wait = wait;
        self
    }

    /// Enable or disable strict delist error reporting.
    #[must_use]
    pub fn error_strict(mut self, enabled: bool) -> Self {
        self.error_strict = enabled;
        self
    }

    /// Allow connections in transactions marked for rollback.
    #[must_use]
    pub fn allow_marked_for_rollback(mut self, enabled: bool) -> Self {
        self.allow_marked_for_rollback = enabled;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.name.is_empty() {
            return Err(Error::Config("manager name must not be empty".into()));
        }

        if self.xa_resource_timeout.is_some_and(|t| t.is_zero()) {
            return Err(Error::Config(
                "xa_resource_timeout must be greater than 0".into(),
            ));
        }

        if self.allocation_retry_wait > Duration::from_secs(3600) {
            return Err(Error::Config(format!(
                "allocation_retry_wait of {:?} is unreasonably long",
                self.allocation_retry_wait
            )));
        }

        Ok(())
    }
}

/// Configuration of an [`AssociationCache`](crate::AssociationCache).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CacheConfig {
    /// Record allocation traces and close handles left open at context exit.
    pub debug: bool,

    /// Fail context exit when handles had to be closed. Implies `debug`.
    pub error: bool,
}

impl CacheConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Enable or disable debug mode.
    #[must_use]
    pub fn debug(mut self, enabled: bool) -> Self {
        self.debug = enabled;
        if !enabled {
            self.error = false;
        }
        self
    }

    /// Enable or disable error mode.
    #[must_use]
    pub fn error(mut self, enabled: bool) -> Self {
        self.error = enabled;
        if enabled {
            self.debug = true;
        }
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Error> {
        if self.error && !self.debug {
            return Err(Error::Config("error mode requires debug mode".into()));
        }
        Ok(())
    }
}
