use serde::{Deserialize, Serialize};

/// Connection-level options for the WebSocket client.
///
/// These options control reconnection behavior and the outbound message
/// queue. Separate from [`LaneLinkTimeouts`](crate::LaneLinkTimeouts) which
/// controls per-operation deadlines and the heartbeat interval.
///
/// # Example
///
/// ```rust
/// use lane_link::ConnectionOptions;
///
/// let options = ConnectionOptions::default()
///     .with_auto_reconnect(true)
///     .with_reconnect_delay_ms(2000)
///     .with_max_reconnect_attempts(10)
///     .with_queue_capacity(128);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionOptions {
    /// Enable automatic reconnection on connection loss.
    /// Default: true.
    #[serde(default = "default_auto_reconnect")]
    pub auto_reconnect: bool,

    /// Initial delay in milliseconds between reconnection attempts.
    /// Default: 1000ms. Doubles per attempt up to `max_reconnect_delay_ms`.
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,

    /// Maximum delay between reconnection attempts.
    /// Default: 30000ms (30 seconds).
    #[serde(default = "default_max_reconnect_delay_ms")]
    pub max_reconnect_delay_ms: u64,

    /// Maximum number of reconnection attempts before the connection
    /// parks in the `Error` state. After that the caller must invoke
    /// `connect()` again explicitly. Default: 10.
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,

    /// Capacity of the outbound pending-message queue used while
    /// disconnected. Insertion beyond capacity silently evicts the oldest
    /// entry (explicit lossy policy for low-priority channels).
    /// Default: 256.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

fn default_auto_reconnect() -> bool {
    true
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_delay_ms() -> u64 {
    30000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_queue_capacity() -> usize {
    256
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            reconnect_delay_ms: 1000,
            max_reconnect_delay_ms: 30000,
            max_reconnect_attempts: 10,
            queue_capacity: 256,
        }
    }
}

impl ConnectionOptions {
    /// Create new connection options with defaults.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set whether to automatically reconnect on connection loss.
    pub fn with_auto_reconnect(mut self, enabled: bool) -> Self {
        self.auto_reconnect = enabled;
        self
    }

    /// Set the initial delay between reconnection attempts (milliseconds).
    pub fn with_reconnect_delay_ms(mut self, delay_ms: u64) -> Self {
        self.reconnect_delay_ms = delay_ms;
        self
    }

    /// Set the maximum delay between reconnection attempts (milliseconds).
    pub fn with_max_reconnect_delay_ms(mut self, max_delay_ms: u64) -> Self {
        self.max_reconnect_delay_ms = max_delay_ms;
        self
    }

    /// Set the maximum number of reconnection attempts before giving up.
    pub fn with_max_reconnect_attempts(mut self, max_attempts: u32) -> Self {
        self.max_reconnect_attempts = max_attempts;
        self
    }

    /// Set the outbound pending-message queue capacity.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    /// Build the reconnection [`BackoffPolicy`](crate::BackoffPolicy) from
    /// these options.
    pub fn reconnect_backoff(&self) -> crate::backoff::BackoffPolicy {
        crate::backoff::BackoffPolicy::new(
            std::time::Duration::from_millis(self.reconnect_delay_ms),
            std::time::Duration::from_millis(self.max_reconnect_delay_ms),
            self.max_reconnect_attempts,
        )
    }
}
