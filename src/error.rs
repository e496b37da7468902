//! Error types for lane-link.
//!
//! All fallible operations in this crate return [`Result<T>`], which uses
//! [`LaneLinkError`] as the error type. Variants are grouped by how the
//! client reacts to them:
//!
//! - **Transient** ([`Connection`](LaneLinkError::Connection),
//!   [`Timeout`](LaneLinkError::Timeout)): absorbed and retried with backoff
//!   up to configured limits before being surfaced.
//! - **Terminal** ([`Auth`](LaneLinkError::Auth)): never retried; escalates
//!   to forced logout.
//! - **Recoverable** ([`QuotaExceeded`](LaneLinkError::QuotaExceeded)):
//!   surfaced only after eviction failed to free enough space.
//! - **Local** ([`Validation`](LaneLinkError::Validation)): a mutation failed
//!   precondition checks before any optimistic state was touched.
//! - **Remote rejection** ([`Conflict`](LaneLinkError::Conflict)): the server
//!   declined a mutation; the local entity has already been rolled back.

use thiserror::Error;

/// Errors that can occur in lane-link operations.
#[derive(Error, Debug)]
pub enum LaneLinkError {
    /// Transport-level failure (dial, send, receive). Transient: the
    /// connection manager retries these with exponential backoff.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The server rejected our credential outright. Terminal: bypasses
    /// retry and escalates to forced logout.
    #[error("Authentication error: {0}")]
    Auth(String),

    /// An operation did not complete within its configured timeout.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The persistent store could not free enough space by evicting old
    /// entries.
    #[error("Storage quota exceeded: need {needed} bytes, {available} available")]
    QuotaExceeded {
        /// Bytes the rejected write would have occupied.
        needed: usize,
        /// Bytes still free under the quota after eviction.
        available: usize,
    },

    /// A mutation failed local precondition checks. No optimistic state
    /// was touched.
    #[error("Validation error: {0}")]
    Validation(String),

    /// The server declined a mutation. The corresponding optimistic entry
    /// has been rolled back before this error is surfaced.
    #[error("Conflict ({code}): {message}")]
    Conflict {
        /// Machine-readable rejection code from the server.
        code: String,
        /// Human-readable description.
        message: String,
    },

    /// JSON encoding/decoding failure.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Persistent store backend failure (I/O, verification).
    #[error("Storage error: {0}")]
    Storage(String),

    /// Invalid client configuration detected at build time.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Internal invariant violation (poisoned lock, dead task).
    #[error("Internal error: {0}")]
    Internal(String),
}

impl LaneLinkError {
    /// Whether this error is transient, i.e. a retry with backoff may
    /// succeed. Terminal and local errors return `false`.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Connection(_) | Self::Timeout(_))
    }
}

impl From<serde_json::Error> for LaneLinkError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<reqwest::Error> for LaneLinkError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Timeout(e.to_string())
        } else {
            Self::Connection(e.to_string())
        }
    }
}

/// Result type for lane-link operations.
pub type Result<T> = std::result::Result<T, LaneLinkError>;
