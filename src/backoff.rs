//! Back-off configuration for automatic reconnection.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Exponential back-off used when re-establishing a lost connection.
///
/// The first attempt waits `initial_delay`; each failure doubles the delay,
/// capped at `max_delay`. After `max_attempts` failures the session gives up
/// and fails outstanding requests with a retryable error.
///
/// # Default Values
/// - `initial_delay`: 100 milliseconds
/// - `max_delay`: 5 seconds
/// - `max_attempts`: 5
///
/// # Invariants
/// - `initial_delay` must not exceed `max_delay`
/// - `initial_delay` must be at least 1 millisecond
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffConfig {
    /// Delay before the first reconnection attempt.
    pub initial_delay: Duration,
    /// Upper bound once the delay has grown exponentially.
    pub max_delay: Duration,
    /// Attempts before the session stops.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl BackoffConfig {
    /// Clamp delays to sane bounds and ensure `initial_delay <= max_delay`.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use iscsi_initiator::backoff::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(5),
    ///     max_delay: Duration::from_millis(1),
    ///     max_attempts: 3,
    /// };
    ///
    /// let normalized = cfg.normalized();
    /// assert_eq!(normalized.initial_delay, Duration::from_millis(1));
    /// assert_eq!(normalized.max_delay, Duration::from_millis(5));
    /// ```
    #[must_use]
    pub fn normalized(mut self) -> Self {
        self.initial_delay = self.initial_delay.max(Duration::from_millis(1));
        self.max_delay = self.max_delay.max(Duration::from_millis(1));
        if self.initial_delay > self.max_delay {
            std::mem::swap(&mut self.initial_delay, &mut self.max_delay);
        }
        self
    }

    /// Delays to wait before each attempt, `max_attempts` long.
    ///
    /// ```
    /// use std::time::Duration;
    ///
    /// use iscsi_initiator::backoff::BackoffConfig;
    ///
    /// let cfg = BackoffConfig {
    ///     initial_delay: Duration::from_millis(10),
    ///     max_delay: Duration::from_millis(25),
    ///     max_attempts: 4,
    /// };
    /// let delays: Vec<_> = cfg.delays().map(|d| d.as_millis()).collect();
    /// assert_eq!(delays, vec![10, 20, 25, 25]);
    /// ```
    pub fn delays(&self) -> impl Iterator<Item = Duration> + use<> {
        let cfg = self.normalized();
        std::iter::successors(Some(cfg.initial_delay), move |delay| {
            Some(delay.saturating_mul(2).min(cfg.max_delay))
        })
        .take(cfg.max_attempts as usize)
    }
}
