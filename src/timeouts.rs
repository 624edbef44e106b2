//! Timeout configuration for coin-link client operations.

use std::time::Duration;

/// Timeout configuration for all client operations.
///
/// # Examples
///
/// ```rust
/// use coin_link::CoinLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended)
/// let timeouts = CoinLinkTimeouts::default();
///
/// // Custom deadlines for a slow link
/// let timeouts = CoinLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(30))
///     .command_timeout(Duration::from_secs(20))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct CoinLinkTimeouts {
    /// Timeout for establishing the WebSocket connection (TCP + TLS +
    /// handshake). Default: 10 seconds.
    pub connection_timeout: Duration,

    /// Deadline for a correlated command answer. A command with no matching
    /// answer within this window fails with a protocol timeout.
    /// Default: 10 seconds.
    pub command_timeout: Duration,

    /// Timeout for HTTP requests on the merchant/identity transport.
    /// Default: 30 seconds.
    pub http_timeout: Duration,

    /// Keepalive ping interval on the channel. Zero disables keepalive.
    /// Default: 15 seconds.
    pub keepalive_interval: Duration,
}

impl Default for CoinLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            command_timeout: Duration::from_secs(10),
            http_timeout: Duration::from_secs(30),
            keepalive_interval: Duration::from_secs(15),
        }
    }
}

impl CoinLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> CoinLinkTimeoutsBuilder {
        CoinLinkTimeoutsBuilder::new()
    }

    /// Timeouts suitable for tests against a local server.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            command_timeout: Duration::from_millis(500),
            http_timeout: Duration::from_secs(5),
            keepalive_interval: Duration::from_secs(5),
        }
    }
}

/// Builder for [`CoinLinkTimeouts`].
#[derive(Debug, Clone)]
pub struct CoinLinkTimeoutsBuilder {
    timeouts: CoinLinkTimeouts,
}

impl CoinLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: CoinLinkTimeouts::default(),
        }
    }

    /// Set the WebSocket connection timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the correlated-command deadline.
    pub fn command_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.command_timeout = timeout;
        self
    }

    /// Set the HTTP request timeout.
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.http_timeout = timeout;
        self
    }

    /// Set the keepalive ping interval. Zero disables keepalive.
    pub fn keepalive_interval(mut self, interval: Duration) -> Self {
        self.timeouts.keepalive_interval = interval;
        self
    }

    /// Build the timeout configuration.
    pub fn build(self) -> CoinLinkTimeouts {
        self.timeouts
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = CoinLinkTimeouts::default();
        assert_eq!(timeouts.command_timeout, Duration::from_secs(10));
        assert_eq!(timeouts.keepalive_interval, Duration::from_secs(15));
    }

    #[test]
    fn test_builder() {
        let timeouts = CoinLinkTimeouts::builder()
            .command_timeout(Duration::from_secs(3))
            .keepalive_interval(Duration::ZERO)
            .build();
        assert_eq!(timeouts.command_timeout, Duration::from_secs(3));
        assert!(timeouts.keepalive_interval.is_zero());
    }
}
