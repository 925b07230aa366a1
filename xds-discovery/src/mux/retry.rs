//! Reconnect policy for the discovery stream.

use std::time::Duration;

use crate::error::{Error, Result};

/// Retry policy for discovery stream connection attempts.
///
/// Exponential backoff with a cap, applied between attempts to establish
/// (or re-establish) the stream to the management server.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Initial backoff duration for the first retry attempt.
    ///
    /// Default: 1 second.
    pub initial_backoff: Duration,

    /// Maximum backoff duration.
    ///
    /// The backoff will not grow beyond this value, regardless of how many
    /// retry attempts have been made.
    ///
    /// Default: 30 seconds.
    pub max_backoff: Duration,

    /// Multiplier for exponential backoff.
    ///
    /// Default: 2.0.
    pub backoff_multiplier: f64,

    /// Maximum number of retry attempts.
    ///
    /// If `None`, retries indefinitely. If `Some(n)`, stops after `n`
    /// attempts.
    ///
    /// Default: None (infinite retries).
    pub max_attempts: Option<usize>,
}

impl RetryPolicy {
    /// Create a new retry policy with custom parameters.
    ///
    /// # Errors
    ///
    /// Returns an error if:
    /// - `backoff_multiplier` is less than 1.0
    /// - `max_backoff` is less than `initial_backoff`
    /// - `initial_backoff` is zero
    pub fn new(
        initial_backoff: Duration,
        max_backoff: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self> {
        if initial_backoff.is_zero() {
            return Err(Error::Validation(
                "initial_backoff must be greater than zero".into(),
            ));
        }

        if backoff_multiplier < 1.0 {
            return Err(Error::Validation(format!(
                "backoff_multiplier must be >= 1.0, got {backoff_multiplier}"
            )));
        }

        if max_backoff < initial_backoff {
            return Err(Error::Validation(format!(
                "max_backoff ({max_backoff:?}) must be >= initial_backoff ({initial_backoff:?})"
            )));
        }

        Ok(Self {
            initial_backoff,
            max_backoff,
            backoff_multiplier,
            max_attempts: None,
        })
    }

    /// Set the maximum number of retry attempts.
    ///
    /// If set to `None`, retries indefinitely.
    pub fn with_max_attempts(mut self, max_attempts: Option<usize>) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Calculate the backoff duration for a given attempt number.
    ///
    /// Returns `None` if `max_attempts` is set and the attempt exceeds it.
    pub fn backoff_duration(&self, attempt: usize) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if attempt >= max {
                return None;
            }
        }

        let multiplier = self.backoff_multiplier.powi(attempt as i32);
        let backoff = self.initial_backoff.mul_f64(multiplier);

        Some(backoff.min(self.max_backoff))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

/// Stateful backoff calculator based on a [`RetryPolicy`].
///
/// Tracks the current attempt number; reset after a successful connection
/// so the next failure sequence starts from the initial backoff again.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: usize,
}

impl Backoff {
    /// Create a new backoff calculator from a retry policy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Get the next backoff duration and advance the attempt counter.
    ///
    /// Returns `None` if `max_attempts` is set and has been exceeded.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        let duration = self.policy.backoff_duration(self.attempt)?;
        self.attempt += 1;
        Some(duration)
    }

    /// Reset the backoff after a successful operation.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}
