//! Reconnect backoff policy and per-watch retry bookkeeping.
//!
//! A watch that loses its stream reconnects with exponential backoff:
//! [`BackoffPolicy`] is the immutable configuration and [`RetryHandler`] the
//! per-session state advancing through it. The watch engine owns one handler
//! per watch and resets it whenever an update is processed successfully, so
//! a healthy stream always reconnects from the short delays.

use std::time::Duration;

/// Exponential backoff configuration for reconnecting watches.
///
/// The delay sequence starts at `initial_delay` and multiplies by
/// `multiplier` on every failed attempt, clamped to `max_delay`.
/// `max_retries` bounds the number of consecutive failed attempts;
/// `None` retries forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    initial_delay: Duration,
    max_delay: Duration,
    multiplier: u32,
    max_retries: Option<u32>,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl BackoffPolicy {
    /// Creates the default policy: an initial delay of one second, doubling
    /// up to sixty seconds, with an unlimited retry budget.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
            max_retries: None,
        }
    }

    /// Sets the delay before the first retry.
    #[must_use]
    pub const fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Sets the ceiling the delay sequence is clamped to.
    #[must_use]
    pub const fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the factor applied to the delay on every failed attempt.
    #[must_use]
    pub const fn with_multiplier(mut self, multiplier: u32) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Bounds the number of consecutive failed attempts.
    ///
    /// A budget of `0` disables retries entirely; the default (no bound)
    /// retries forever.
    #[must_use]
    pub const fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// The delay before the first retry.
    pub const fn initial_delay(&self) -> Duration {
        self.initial_delay
    }

    /// The ceiling the delay sequence is clamped to.
    pub const fn max_delay(&self) -> Duration {
        self.max_delay
    }

    /// The factor applied to the delay on every failed attempt.
    pub const fn multiplier(&self) -> u32 {
        self.multiplier
    }

    /// The retry budget, or `None` for unlimited retries.
    pub const fn max_retries(&self) -> Option<u32> {
        self.max_retries
    }

    /// Computes the delay following `current`: `min(current × multiplier,
    /// max_delay)`.
    ///
    /// The sequence is non-decreasing for any `multiplier >= 1` and stays at
    /// `max_delay` once it reaches it.
    pub fn next_delay(&self, current: Duration) -> Duration {
        current.saturating_mul(self.multiplier).min(self.max_delay)
    }
}

/// Per-watch-session retry state.
///
/// Owned by a single watch task; no internal locking. The handler tracks the
/// current delay and the number of consecutive failed attempts; processing an
/// update successfully resets both.
#[derive(Debug)]
pub struct RetryHandler {
    policy: BackoffPolicy,
    current_delay: Duration,
    retry_count: u32,
}

impl RetryHandler {
    /// Creates a handler positioned at the policy's initial delay with a
    /// zero retry count.
    #[must_use]
    pub const fn new(policy: BackoffPolicy) -> Self {
        Self {
            current_delay: policy.initial_delay,
            retry_count: 0,
            policy,
        }
    }

    /// Whether the retry budget still allows another attempt.
    pub const fn should_retry(&self) -> bool {
        match self.policy.max_retries {
            None => true,
            Some(max) => self.retry_count < max,
        }
    }

    /// Returns the delay to sleep before the next attempt, then advances:
    /// the retry count goes up by one and the delay moves through the
    /// policy.
    pub fn next_wait(&mut self) -> Duration {
        let wait = self.current_delay;
        self.retry_count = self.retry_count.saturating_add(1);
        self.current_delay = self.policy.next_delay(self.current_delay);
        wait
    }

    /// Restores the initial delay and zeroes the retry count.
    pub fn reset(&mut self) {
        self.current_delay = self.policy.initial_delay;
        self.retry_count = 0;
    }

    /// Number of consecutive failed attempts since the last reset.
    pub const fn retry_count(&self) -> u32 {
        self.retry_count
    }
}
