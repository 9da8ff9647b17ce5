//! Adapter around a native [`XaResource`].
//!
//! The wrapper normalises a driver's resource for the coordinator: it can
//! pad branch qualifiers, override the same-resource-manager answer, and
//! checks that completion calls name the branch that was started.

use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::OnceCell;
use parking_lot::Mutex;

use crate::error::XaError;
use crate::flags::{Vote, XaFlags};
use crate::resource::{FailureListener, XaResource, unwrap_resource};
use crate::xid::Xid;

/// Options for [`XaResourceWrapper`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct WrapperConfig {
    /// Pad branch qualifiers to [`Xid::MAX_BQUAL_SIZE`] bytes.
    pub pad_xid: bool,
    /// Fixed answer for `is_same_rm`, bypassing the native resource.
    pub same_rm_override: Option<bool>,
    /// Product name of the resource manager.
    pub product_name: Option<String>,
    /// Product version of the resource manager.
    pub product_version: Option<String>,
    /// Name of the resource, used in logs.
    pub resource_name: String,
}

impl WrapperConfig {
    /// Create a configuration for the named resource.
    #[must_use]
    pub fn new(resource_name: impl Into<String>) -> Self {
        Self {
            resource_name: resource_name.into(),
            ..Self::default()
        }
    }

    /// Enable or disable branch qualifier padding.
    #[must_use]
    pub fn pad_xid(mut self, enabled: bool) -> Self {
        self.pad_xid = enabled;
        self
    }

    /// Force the result of `is_same_rm`.
    #[must_use]
    pub fn same_rm_override(mut self, value: Option<bool>) -> Self {
        self.same_rm_override = value;
        self
    }

    /// Set the product identity reported by the resource manager.
    #[must_use]
    pub fn product(mut self, name: impl Into<String>, version: impl Into<String>) -> Self {
        self.product_name = Some(name.into());
        self.product_version = Some(version.into());
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), XaError> {
        if self.resource_name.is_empty() {
            return Err(XaError::InvalidArgument(
                "resource_name must not be empty".into(),
            ));
        }
        Ok(())
    }
}

/// [`XaResource`] decorator that adds padding, same-RM override and
/// branch consistency checks to a native resource.
pub struct XaResourceWrapper {
    inner: Arc<dyn XaResource>,
    config: WrapperConfig,
    current: Mutex<Option<Xid>>,
    failure_listener: OnceCell<Box<dyn FailureListener>>,
}

impl XaResourceWrapper {
    /// Wrap `inner`.
    pub fn new(inner: Arc<dyn XaResource>, config: WrapperConfig) -> Result<Self, XaError> {
        config.validate()?;
        Ok(Self {
            inner,
            config,
            current: Mutex::new(None),
            failure_listener: OnceCell::new(),
        })
    }

    /// Install the listener told about branch mismatches.
    ///
    /// Only the first listener is kept; returns `false` if one was
    /// already installed.
    pub fn set_failure_listener(&self, listener: Box<dyn FailureListener>) -> bool {
        self.failure_listener.set(listener).is_ok()
    }

    /// The wrapped native resource.
    #[must_use]
    pub fn inner(&self) -> &Arc<dyn XaResource> {
        &self.inner
    }

    /// The wrapper configuration.
    #[must_use]
    pub fn config(&self) -> &WrapperConfig {
        &self.config
    }

    /// Product name of the resource manager, if known.
    #[must_use]
    pub fn product_name(&self) -> Option<&str> {
        self.config.product_name.as_deref()
    }

    /// Product version of the resource manager, if known.
    #[must_use]
    pub fn product_version(&self) -> Option<&str> {
        self.config.product_version.as_deref()
    }

    /// The branch started through this wrapper and not yet completed.
    #[must_use]
    pub fn current_branch(&self) -> Option<Xid> {
        self.current.lock().clone()
    }

    fn convert(&self, xid: &Xid) -> Xid {
        if self.config.pad_xid {
            xid.padded()
        } else {
            xid.clone()
        }
    }

    /// Reject calls that name a branch other than the active one.
    ///
    /// With no active branch the call passes through; recovery completes
    /// branches this wrapper never started. A mismatch is reported to the
    /// failure listener before it is returned.
    fn check_branch(&self, xid: &Xid, operation: &str) -> Result<(), XaError> {
        let active = match self.current.lock().as_ref() {
            Some(active) if active != xid => active.clone(),
            _ => return Ok(()),
        };
        tracing::error!(
            resource = %self.config.resource_name,
            expected = %active,
            got = %xid,
            operation,
            "branch mismatch"
        );
        let error = XaError::protocol(format!("{operation} of {xid} while {active} is active"));
        if let Some(listener) = self.failure_listener.get() {
            listener.resource_failed(&error);
        }
        Err(error)
    }

    fn clear_branch(&self, xid: &Xid) {
        let mut current = self.current.lock();
        if current.as_ref() == Some(xid) {
            *current = None;
        }
    }
}

impl XaResource for XaResourceWrapper {
    fn start(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        let xid = self.convert(xid);
        self.inner.start(&xid, flags)?;
        *self.current.lock() = Some(xid);
        Ok(())
    }

    fn end(&self, xid: &Xid, flags: XaFlags) -> Result<(), XaError> {
        let xid = self.convert(xid);
        self.check_branch(&xid, "end")?;
        self.inner.end(&xid, flags)
    }

    fn prepare(&self, xid: &Xid) -> Result<Vote, XaError> {
        let xid = self.convert(xid);
        let vote = self.inner.prepare(&xid)?;
        if vote == Vote::ReadOnly {
            self.clear_branch(&xid);
        }
        Ok(vote)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> Result<(), XaError> {
        let xid = self.convert(xid);
        self.check_branch(&xid, "commit")?;
        let result = self.inner.commit(&xid, one_phase);
        self.clear_branch(&xid);
        result
    }

    fn rollback(&self, xid: &Xid) -> Result<(), XaError> {
        let xid = self.convert(xid);
        self.check_branch(&xid, "rollback")?;
        let result = self.inner.rollback(&xid);
        self.clear_branch(&xid);
        result
    }

    fn forget(&self, xid: &Xid) -> Result<(), XaError> {
        let xid = self.convert(xid);
        self.inner.forget(&xid)
    }

    fn recover(&self, flags: XaFlags) -> Result<Vec<Xid>, XaError> {
        self.inner.recover(flags)
    }

    fn is_same_rm(&self, other: &dyn XaResource) -> Result<bool, XaError> {
        if let Some(value) = self.config.same_rm_override {
            return Ok(value);
        }
        self.inner.is_same_rm(unwrap_resource(other))
    }

    fn transaction_timeout(&self) -> Result<Duration, XaError> {
        self.inner.transaction_timeout()
    }

    fn set_transaction_timeout(&self, timeout: Duration) -> Result<bool, XaError> {
        self.inner.set_transaction_timeout(timeout)
    }

    fn wrapped(&self) -> Option<&dyn XaResource> {
        Some(self.inner.as_ref())
    }
}

impl std::fmt::Debug for XaResourceWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XaResourceWrapper")
            .field("config", &self.config)
            .field("current", &*self.current.lock())
            .finish_non_exhaustive()
    }
}
