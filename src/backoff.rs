//! Exponential backoff policy shared by all retrying components.
//!
//! The delay computation is a pure function of the attempt count, so retry
//! timing can be unit-tested without any I/O or timers. Both the connection
//! manager (reconnects) and the refresh coordinator (credential renewal)
//! consume the same policy type.

use std::time::Duration;

/// Bounded exponential backoff: `delay(attempt) = min(base * 2^attempt, cap)`.
///
/// # Examples
///
/// ```rust
/// use lane_link::BackoffPolicy;
/// use std::time::Duration;
///
/// let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(30), 10);
/// assert_eq!(policy.delay(0), Duration::from_secs(1));
/// assert_eq!(policy.delay(3), Duration::from_secs(8));
/// assert_eq!(policy.delay(9), Duration::from_secs(30)); // capped
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay before the first retry (attempt 0).
    pub base_delay: Duration,
    /// Upper bound on any single delay.
    pub cap_delay: Duration,
    /// Number of attempts before the caller gives up. `delay` itself does
    /// not enforce this; callers check [`is_exhausted`](Self::is_exhausted).
    pub max_attempts: u32,
}

impl BackoffPolicy {
    /// Create a new backoff policy.
    pub fn new(base_delay: Duration, cap_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            cap_delay,
            max_attempts,
        }
    }

    /// Compute the delay before retry number `attempt` (zero-based).
    ///
    /// Uses saturating arithmetic so large attempt counts cannot overflow;
    /// the result is always clamped to `cap_delay`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as u64;
        let cap_ms = self.cap_delay.as_millis() as u64;
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }

    /// Whether `attempt` (zero-based) is at or beyond the attempt limit.
    pub fn is_exhausted(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            cap_delay: Duration::from_secs(30),
            max_attempts: 10,
        }
    }
}
