//! Session configuration.

use entisync_protocol::PROTOCOL_VERSION;
use std::time::Duration;

/// Configuration for a [`Session`](crate::Session).
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Human-readable session name, attached to log records.
    pub name: String,
    /// Protocol version the store must announce in its greeting.
    pub protocol_version: u32,
    /// Coalescing interval for partial fetch results.
    pub partial_result_interval: Duration,
}

impl SessionConfig {
    /// Creates a configuration with the given session name.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    /// Sets the expected protocol version.
    #[must_use]
    pub fn with_protocol_version(mut self, version: u32) -> Self {
        self.protocol_version = version;
        self
    }

    /// Sets the partial result coalescing interval.
    #[must_use]
    pub fn with_partial_result_interval(mut self, interval: Duration) -> Self {
        self.partial_result_interval = interval;
        self
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            name: "session".to_string(),
            protocol_version: PROTOCOL_VERSION,
            partial_result_interval: Duration::from_millis(100),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = SessionConfig::default();
        assert_eq!(config.protocol_version, PROTOCOL_VERSION);
        assert_eq!(config.partial_result_interval, Duration::from_millis(100));
    }

    #[test]
    fn test_config_builder() {
        let config = SessionConfig::new("resource-sync")
            .with_protocol_version(7)
            .with_partial_result_interval(Duration::from_millis(5));

        assert_eq!(config.name, "resource-sync");
        assert_eq!(config.protocol_version, 7);
        assert_eq!(config.partial_result_interval, Duration::from_millis(5));
    }
}
