//! Configuration for the flow decorator.

use serde::Deserialize;
use std::time::Duration;

/// Port the metrics server listens on unless configured with
/// [`FlowConfig::with_listen_address`].
pub const DEFAULT_LISTEN_PORT: u16 = 41820;

/// Listen address of the metrics server unless configured with
/// [`FlowConfig::with_listen_address`].
pub const DEFAULT_LISTEN_ADDRESS: &str = "0.0.0.0:41820";

/// Deadline the SDK's blocking shutdown gives the decorator.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`FlowProcessor`](crate::FlowProcessor).
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FlowConfig {
    /// Listen address of the metrics server.
    ///
    /// A bare `":<port>"` listens on all interfaces.
    ///
    /// Default: `0.0.0.0:41820`
    pub listen_address: String,

    /// Deadline used when the SDK shuts the processor down through the
    /// blocking `SpanProcessor::shutdown`.
    ///
    /// Default: 5 seconds
    pub shutdown_timeout: Duration,
}

impl Default for FlowConfig {
    fn default() -> Self {
        Self {
            listen_address: DEFAULT_LISTEN_ADDRESS.to_string(),
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }
}

impl FlowConfig {
    /// Sets the listen address of the metrics server.
    pub fn with_listen_address(mut self, addr: impl Into<String>) -> Self {
        self.listen_address = addr.into();
        self
    }

    /// Sets the deadline for the SDK's blocking shutdown.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// The address to bind, with the `":<port>"` shorthand expanded.
    pub(crate) fn bind_address(&self) -> String {
        if self.listen_address.starts_with(':') {
            format!("0.0.0.0{}", self.listen_address)
        } else {
            self.listen_address.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_address() {
        let config = FlowConfig::default();
        assert_eq!(config.listen_address, DEFAULT_LISTEN_ADDRESS);
        assert!(config.bind_address().ends_with(&format!(":{DEFAULT_LISTEN_PORT}")));
    }

    #[test]
    fn test_with_listen_address() {
        let config = FlowConfig::default().with_listen_address("127.0.0.1:9464");
        assert_eq!(config.bind_address(), "127.0.0.1:9464");
    }

    #[test]
    fn test_port_only_shorthand() {
        let config = FlowConfig::default().with_listen_address(":9464");
        assert_eq!(config.bind_address(), "0.0.0.0:9464");
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: FlowConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config, FlowConfig::default());

        let config: FlowConfig =
            serde_json::from_str(r#"{"listen_address": "localhost:0"}"#).unwrap();
        assert_eq!(config.listen_address, "localhost:0");
        assert_eq!(config.shutdown_timeout, DEFAULT_SHUTDOWN_TIMEOUT);

        let config: FlowConfig =
            serde_json::from_str(r#"{"shutdown_timeout": {"secs": 1, "nanos": 0}}"#).unwrap();
        assert_eq!(config.shutdown_timeout, Duration::from_secs(1));
    }
}
