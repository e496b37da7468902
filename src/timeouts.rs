//! Timeout configuration for lane-link client operations.
//!
//! Centralizes timeout management for HTTP credential requests, WebSocket
//! connection establishment, and the application-level heartbeat.

use std::time::Duration;

/// Timeout configuration for lane-link client operations.
///
/// All values have sensible defaults; use the builder for customization.
///
/// # Examples
///
/// ```rust
/// use lane_link::LaneLinkTimeouts;
/// use std::time::Duration;
///
/// // Defaults (recommended for most cases)
/// let timeouts = LaneLinkTimeouts::default();
///
/// // Custom timeouts for high-latency environments
/// let timeouts = LaneLinkTimeouts::builder()
///     .connection_timeout(Duration::from_secs(60))
///     .request_timeout(Duration::from_secs(120))
///     .build();
///
/// // Aggressive timeouts for local development
/// let timeouts = LaneLinkTimeouts::fast();
/// ```
#[derive(Debug, Clone)]
pub struct LaneLinkTimeouts {
    /// Timeout for establishing the WebSocket connection (TCP + TLS +
    /// upgrade handshake). Default: 10 seconds.
    pub connection_timeout: Duration,

    /// Timeout for HTTP requests to the credential endpoints (login,
    /// refresh). Default: 30 seconds.
    pub request_timeout: Duration,

    /// Timeout for writing a single frame to the transport.
    /// Default: 10 seconds.
    pub send_timeout: Duration,

    /// Interval between outbound heartbeat envelopes while connected.
    /// Set to 0 to disable heartbeats. Default: 10 seconds.
    ///
    /// A missed heartbeat acknowledgment does not by itself tear down the
    /// connection; only a failed heartbeat *send* follows the normal
    /// transport-error path.
    pub heartbeat_interval: Duration,
}

impl Default for LaneLinkTimeouts {
    fn default() -> Self {
        Self {
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(30),
            send_timeout: Duration::from_secs(10),
            heartbeat_interval: Duration::from_secs(10),
        }
    }
}

impl LaneLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> LaneLinkTimeoutsBuilder {
        LaneLinkTimeoutsBuilder::new()
    }

    /// Timeouts optimized for fast local development.
    pub fn fast() -> Self {
        Self {
            connection_timeout: Duration::from_secs(2),
            request_timeout: Duration::from_secs(5),
            send_timeout: Duration::from_secs(2),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    /// Timeouts optimized for high-latency or unreliable networks.
    pub fn relaxed() -> Self {
        Self {
            connection_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(120),
            send_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(30),
        }
    }

    /// Check if a duration represents "no timeout" (zero or absurdly large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for [`LaneLinkTimeouts`].
#[derive(Debug, Clone)]
pub struct LaneLinkTimeoutsBuilder {
    timeouts: LaneLinkTimeouts,
}

impl LaneLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: LaneLinkTimeouts::default(),
        }
    }

    /// Set the WebSocket connection establishment timeout.
    pub fn connection_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connection_timeout = timeout;
        self
    }

    /// Set the connection timeout in seconds.
    pub fn connection_timeout_secs(self, secs: u64) -> Self {
        self.connection_timeout(Duration::from_secs(secs))
    }

    /// Set the HTTP request timeout (credential endpoints).
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.request_timeout = timeout;
        self
    }

    /// Set the HTTP request timeout in seconds.
    pub fn request_timeout_secs(self, secs: u64) -> Self {
        self.request_timeout(Duration::from_secs(secs))
    }

    /// Set the per-frame send timeout.
    pub fn send_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.send_timeout = timeout;
        self
    }

    /// Set the per-frame send timeout in seconds.
    pub fn send_timeout_secs(self, secs: u64) -> Self {
        self.send_timeout(Duration::from_secs(secs))
    }

    /// Set the heartbeat interval. Set to 0 to disable heartbeats.
    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.timeouts.heartbeat_interval = interval;
        self
    }

    /// Set the heartbeat interval in seconds. Set to 0 to disable.
    pub fn heartbeat_interval_secs(self, secs: u64) -> Self {
        self.heartbeat_interval(Duration::from_secs(secs))
    }

    /// Build the timeout configuration.
    pub fn build(self) -> LaneLinkTimeouts {
        self.timeouts
    }
}
