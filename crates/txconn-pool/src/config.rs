//! Pool configuration.

use std::time::Duration;

use crate::error::PoolError;

/// Configuration for a connection pool.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct PoolConfig {
    /// Pool name, used in logs.
    pub name: String,

    /// Minimum number of connections kept open.
    pub min_connections: u32,

    /// Maximum number of connections (idle, checked out and being created).
    pub max_connections: u32,

    /// How long `acquire` blocks waiting for a free connection.
    pub connection_timeout: Duration,

    /// Idle time after which the reaper closes a connection.
    pub idle_timeout: Duration,

    /// Validate freshly created connections.
    pub validate_on_create: bool,

    /// Validate idle connections before handing them out.
    pub validate_on_match: bool,

    /// Interval of background validation of idle connections.
    pub background_validation: Option<Duration>,

    /// Open `min_connections` connections when the pool is created.
    pub prefill: bool,

    /// Extra creation attempts after a failed create.
    pub creation_retries: u32,

    /// Stop checking idle connections after the first failed validation.
    pub use_fast_fail: bool,

    /// Interval of the background reaper. `None` disables it.
    pub reaper_interval: Option<Duration>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_connections: 0,
            max_connections: 10,
            connection_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(300),
            validate_on_create: false,
            validate_on_match: false,
            background_validation: None,
            prefill: false,
            creation_retries: 1,
            use_fast_fail: false,
            reaper_interval: None,
        }
    }
}

impl PoolConfig {
    /// Create a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the pool name.
    #[must_use]
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Set the minimum number of connections.
    #[must_use]
    pub fn min_connections(mut self, count: u32) -> Self {
        self.min_connections = count;
        self
    }

    /// Set the maximum number of connections.
    #[must_use]
    pub fn max_connections(mut self, count: u32) -> Self {
        self.max_connections = count;
        self
    }

    /// Set the blocking timeout of `acquire`.
    #[must_use]
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    /// Set the idle connection timeout.
    #[must_use]
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = timeout;
        self
    }

    /// Enable or disable validation of new connections.
    #[must_use]
    pub fn validate_on_create(mut self, enabled: bool) -> Self {
        self.validate_on_create = enabled;
        self
    }

    /// Enable or disable validation before checkout.
    #[must_use]
    pub fn validate_on_match(mut self, enabled: bool) -> Self {
        self.validate_on_match = enabled;
        self
    }

    /// Set the background validation interval.
    #[must_use]
    pub fn background_validation(mut self, interval: Option<Duration>) -> Self {
        self.background_validation = interval;
        self
    }

    /// Enable or disable prefill.
    #[must_use]
    pub fn prefill(mut self, enabled: bool) -> Self {
        self.prefill = enabled;
        self
    }

    /// Set the number of extra creation attempts.
    #[must_use]
    pub fn creation_retries(mut self, retries: u32) -> Self {
        self.creation_retries = retries;
        self
    }

    /// Enable or disable fast fail on validation errors.
    #[must_use]
    pub fn use_fast_fail(mut self, enabled: bool) -> Self {
        self.use_fast_fail = enabled;
        self
    }

    /// Set the reaper interval.
    #[must_use]
    pub fn reaper_interval(mut self, interval: Option<Duration>) -> Self {
        self.reaper_interval = interval;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_connections == 0 {
            return Err(PoolError::Config(
                "max_connections must be greater than 0".into(),
            ));
        }

        if self.min_connections > self.max_connections {
            return Err(PoolError::Config(format!(
                "min_connections ({}) cannot exceed max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }

        if self.reaper_interval.is_some_and(|d| d.is_zero()) {
            return Err(PoolError::Config("reaper_interval must not be zero".into()));
        }

        if self.background_validation.is_some_and(|d| d.is_zero()) {
            return Err(PoolError::Config(
                "background_validation must not be zero".into(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = PoolConfig::default();
        assert_eq!(config.min_connections, 0);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.creation_retries, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_min_above_max_rejected() {
        let config = PoolConfig::new().min_connections(5).max_connections(2);
        assert!(matches!(config.validate(), Err(PoolError::Config(_))));
    }

    #[test]
    fn test_zero_max_rejected() {
        assert!(PoolConfig::new().max_connections(0).validate().is_err());
    }

    #[test]
    fn test_zero_intervals_rejected() {
        assert!(
            PoolConfig::new()
                .reaper_interval(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
        assert!(
            PoolConfig::new()
                .background_validation(Some(Duration::ZERO))
                .validate()
                .is_err()
        );
    }
}
