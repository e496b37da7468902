//! Connection lifecycle event handlers for the lane-link client.
//!
//! Provides callback-based hooks for monitoring the sync connection:
//!
//! - [`on_connect`](EventHandlers::on_connect): connection established
//! - [`on_disconnect`](EventHandlers::on_disconnect): connection closed
//! - [`on_error`](EventHandlers::on_error): connection or protocol error
//! - [`on_forced_logout`](EventHandlers::on_forced_logout): credential
//!   renewal exhausted; the session is over
//! - [`on_receive`](EventHandlers::on_receive) /
//!   [`on_send`](EventHandlers::on_send): debug hooks for raw frames
//!
//! # Example
//!
//! ```rust
//! use lane_link::EventHandlers;
//!
//! let handlers = EventHandlers::new()
//!     .on_connect(|| println!("Connected to Lane"))
//!     .on_disconnect(|reason| println!("Disconnected: {}", reason))
//!     .on_forced_logout(|reason| eprintln!("Session ended: {}", reason));
//! ```

use std::fmt;
use std::sync::Arc;

/// Reason for a disconnect event.
#[derive(Debug, Clone)]
pub struct DisconnectReason {
    /// Human-readable description of why the connection closed.
    pub message: String,
    /// WebSocket close code, if available (e.g. 1000 = normal).
    pub code: Option<u16>,
}

impl DisconnectReason {
    /// Create a new disconnect reason with a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    /// Create a new disconnect reason with a message and close code.
    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Error information passed to the `on_error` handler.
#[derive(Debug, Clone)]
pub struct ConnectionFault {
    /// Human-readable error message.
    pub message: String,
    /// Whether this error is recoverable (auto-reconnect may succeed).
    pub recoverable: bool,
}

impl ConnectionFault {
    /// Create a new connection fault.
    pub fn new(message: impl Into<String>, recoverable: bool) -> Self {
        Self {
            message: message.into(),
            recoverable,
        }
    }
}

impl fmt::Display for ConnectionFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Type alias for the on_connect callback.
pub type OnConnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Type alias for the on_disconnect callback.
pub type OnDisconnectCallback = Arc<dyn Fn(DisconnectReason) + Send + Sync>;

/// Type alias for the on_error callback.
pub type OnErrorCallback = Arc<dyn Fn(ConnectionFault) + Send + Sync>;

/// Type alias for the on_forced_logout callback.
pub type OnForcedLogoutCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Type alias for the on_receive / on_send debug callbacks.
pub type OnFrameCallback = Arc<dyn Fn(&str) + Send + Sync>;

/// Connection lifecycle event handlers.
///
/// All handlers are optional; register only what you need via the builder
/// methods. Handlers are `Send + Sync` so they work with the tokio runtime.
#[derive(Clone, Default)]
pub struct EventHandlers {
    pub(crate) on_connect: Option<OnConnectCallback>,
    pub(crate) on_disconnect: Option<OnDisconnectCallback>,
    pub(crate) on_error: Option<OnErrorCallback>,
    pub(crate) on_forced_logout: Option<OnForcedLogoutCallback>,
    pub(crate) on_receive: Option<OnFrameCallback>,
    pub(crate) on_send: Option<OnFrameCallback>,
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("on_connect", &self.on_connect.is_some())
            .field("on_disconnect", &self.on_disconnect.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("on_forced_logout", &self.on_forced_logout.is_some())
            .field("on_receive", &self.on_receive.is_some())
            .field("on_send", &self.on_send.is_some())
            .finish()
    }
}

impl EventHandlers {
    /// Create a new empty `EventHandlers` (no callbacks registered).
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a callback invoked when the connection is established
    /// (initial connect and every successful reconnect).
    pub fn on_connect(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_connect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when the connection is closed.
    ///
    /// The callback receives a [`DisconnectReason`] describing why.
    pub fn on_disconnect(mut self, f: impl Fn(DisconnectReason) + Send + Sync + 'static) -> Self {
        self.on_disconnect = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when a connection error occurs.
    ///
    /// The callback receives a [`ConnectionFault`] indicating whether the
    /// error is recoverable (auto-reconnect may help) or fatal.
    pub fn on_error(mut self, f: impl Fn(ConnectionFault) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Register a callback invoked when credential renewal is exhausted
    /// and the session is forcibly ended.
    ///
    /// At the point the callback fires the stored credential has already
    /// been cleared and all pending credential waiters rejected.
    pub fn on_forced_logout(mut self, f: impl Fn(String) + Send + Sync + 'static) -> Self {
        self.on_forced_logout = Some(Arc::new(f));
        self
    }

    /// Register a debug hook invoked with the raw JSON of every inbound
    /// frame before parsing. Not needed for normal operation.
    pub fn on_receive(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_receive = Some(Arc::new(f));
        self
    }

    /// Register a debug hook invoked with the raw JSON of every outbound
    /// frame. Not needed for normal operation.
    pub fn on_send(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_send = Some(Arc::new(f));
        self
    }

    /// Returns `true` if any handler is registered.
    pub fn has_any(&self) -> bool {
        self.on_connect.is_some()
            || self.on_disconnect.is_some()
            || self.on_error.is_some()
            || self.on_forced_logout.is_some()
            || self.on_receive.is_some()
            || self.on_send.is_some()
    }

    // ---------------------------------------------------------------
    // Internal dispatch helpers
    // ---------------------------------------------------------------

    pub(crate) fn emit_connect(&self) {
        if let Some(cb) = &self.on_connect {
            cb();
        }
    }

    pub(crate) fn emit_disconnect(&self, reason: DisconnectReason) {
        if let Some(cb) = &self.on_disconnect {
            cb(reason);
        }
    }

    pub(crate) fn emit_error(&self, fault: ConnectionFault) {
        if let Some(cb) = &self.on_error {
            cb(fault);
        }
    }

    pub(crate) fn emit_forced_logout(&self, reason: String) {
        if let Some(cb) = &self.on_forced_logout {
            cb(reason);
        }
    }

    pub(crate) fn emit_receive(&self, raw: &str) {
        if let Some(cb) = &self.on_receive {
            cb(raw);
        }
    }

    pub(crate) fn emit_send(&self, raw: &str) {
        if let Some(cb) = &self.on_send {
            cb(raw);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_handlers_fire_when_registered() {
        let connects = Arc::new(AtomicUsize::new(0));
        let logouts = Arc::new(AtomicUsize::new(0));

        let c = connects.clone();
        let l = logouts.clone();
        let handlers = EventHandlers::new()
            .on_connect(move || {
                c.fetch_add(1, Ordering::SeqCst);
            })
            .on_forced_logout(move |_reason| {
                l.fetch_add(1, Ordering::SeqCst);
            });

        assert!(handlers.has_any());
        handlers.emit_connect();
        handlers.emit_connect();
        handlers.emit_forced_logout("renewal exhausted".to_string());
        handlers.emit_disconnect(DisconnectReason::new("no handler registered"));

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(logouts.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_handlers_are_inert() {
        let handlers = EventHandlers::new();
        assert!(!handlers.has_any());
        // No panic when emitting without callbacks.
        handlers.emit_connect();
        handlers.emit_error(ConnectionFault::new("boom", true));
        handlers.emit_receive("{}");
        handlers.emit_send("{}");
    }

    #[test]
    fn test_disconnect_reason_display() {
        let plain = DisconnectReason::new("server closed");
        assert_eq!(plain.to_string(), "server closed");

        let coded = DisconnectReason::with_code("abnormal", 1006);
        assert_eq!(coded.to_string(), "abnormal (code: 1006)");
    }
}
