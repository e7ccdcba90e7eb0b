//! Exponential backoff for broker connection attempts.
//!
//! ```text
//! delay[n] = min(initial * multiplier^(n-1), max)
//! ```
//!
//! With a retry limit the sequence ends in [`BackoffError::Exhausted`];
//! without one it settles at `max` forever.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BackoffError {
    #[error("gave up after {0} retries")]
    Exhausted(u32),
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    current: Duration,
    max: Duration,
    multiplier: f64,
    retries: u32,
    max_retries: Option<u32>,
}

impl Backoff {
    /// `multiplier` values below 1.0 are treated as 1.0 (constant delay).
    pub fn new(initial: Duration, max: Duration, multiplier: f64) -> Self {
        let max = max.max(initial);
        Self {
            initial,
            current: initial,
            max,
            multiplier: multiplier.max(1.0),
            retries: 0,
            max_retries: None,
        }
    }

    pub fn with_max_retries(mut self, limit: u32) -> Self {
        self.max_retries = Some(limit);
        self
    }

    /// Delay to wait before the next retry.
    pub fn next_sleep(&mut self) -> Result<Duration, BackoffError> {
        if let Some(limit) = self.max_retries {
            if self.retries >= limit {
                return Err(BackoffError::Exhausted(limit));
            }
        }

        self.retries += 1;
        let delay = self.current;
        self.current = self.current.mul_f64(self.multiplier).min(self.max);

        Ok(delay)
    }

    pub fn reset(&mut self) {
        self.retries = 0;
        self.current = self.initial;
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(8), 2.0)
    }
}
