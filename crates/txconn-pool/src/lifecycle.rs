//! Physical connection lifecycle contracts.
//!
//! The pool never talks to a backend itself. A [`ManagedConnectionFactory`]
//! creates, validates, matches and destroys [`ManagedConnection`]s, and the
//! pool decides when each of those happens.

use std::fmt;
use std::sync::Arc;

use txconn_xa::{BoxError, LocalTransaction, XaResource};

/// Opaque key describing what a caller asked for.
///
/// Two requests with equal keys may share a physical connection; the
/// factory decides through [`ManagedConnectionFactory::matches`] whether an
/// existing connection can serve a key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct RequestKey(Option<Arc<str>>);

impl RequestKey {
    /// Key carrying caller-specific request information.
    pub fn new(info: impl Into<Arc<str>>) -> Self {
        Self(Some(info.into()))
    }

    /// Key for a request without request information.
    #[must_use]
    pub const fn none() -> Self {
        Self(None)
    }

    /// The request information, if any.
    #[must_use]
    pub fn info(&self) -> Option<&str> {
        self.0.as_deref()
    }
}

impl fmt::Display for RequestKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(info) => f.write_str(info),
            None => f.write_str("<none>"),
        }
    }
}

/// Identity of the resource manager a connection talks to.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct ProductInfo {
    /// Product name.
    pub name: String,
    /// Product version.
    pub version: String,
}

impl ProductInfo {
    /// Create product information.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

/// A physical connection owned by the pool.
///
/// Every capability is optional: a connection without an XA resource or a
/// local transaction is pooled but never enlisted.
pub trait ManagedConnection: Send + Sync + 'static {
    /// Native two-phase commit capability.
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        None
    }

    /// Resource-local transaction capability.
    fn local_transaction(&self) -> Option<Arc<dyn LocalTransaction>> {
        None
    }

    /// Reset per-use state before the connection goes back to the pool.
    fn cleanup(&self) -> Result<(), BoxError> {
        Ok(())
    }

    /// Product identity reported by the backend.
    fn metadata(&self) -> Option<ProductInfo> {
        None
    }
}

/// Creates and maintains physical connections.
pub trait ManagedConnectionFactory: Send + Sync + 'static {
    /// The connection type produced.
    type Connection: ManagedConnection;

    /// Open a new physical connection for `key`.
    fn create(&self, key: &RequestKey) -> Result<Self::Connection, BoxError>;

    /// Check that a connection is still usable.
    fn validate(&self, connection: &Self::Connection) -> Result<(), BoxError>;

    /// Check whether an existing connection can serve `key`.
    ///
    /// Called while the pool lock is held; must not block.
    fn matches(&self, connection: &Self::Connection, key: &RequestKey) -> bool;

    /// Close a physical connection. Errors are the factory's to log.
    fn destroy(&self, connection: &Self::Connection);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_key_equality() {
        assert_eq!(RequestKey::new("alice"), RequestKey::new("alice"));
        assert_ne!(RequestKey::new("alice"), RequestKey::new("bob"));
        assert_eq!(RequestKey::none(), RequestKey::default());
        assert_eq!(RequestKey::none().to_string(), "<none>");
        assert_eq!(RequestKey::new("alice").info(), Some("alice"));
    }
}
