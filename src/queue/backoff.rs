//! Per-key exponential backoff for failed reconciliations
//!
//! Each failing key backs off independently: a cluster stuck on a broken
//! volume does not slow down retries for healthy clusters.

use std::time::Duration;

use crate::Error;

/// Exponential backoff configuration
///
/// Delay for the n-th consecutive failure (0-based) is
/// `initial_delay * multiplier^n`, capped at `max_delay`.
#[derive(Clone, Debug, PartialEq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive failures
    pub multiplier: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_secs(1000),
            multiplier: 2.0,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after `failures` previous consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(failures).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        // powi overflows to +inf rather than wrapping; min() folds that into max.
        Duration::from_secs_f64(secs.min(max))
    }

    /// Reject policies that would never back off or would overflow
    pub fn validate(&self) -> Result<(), Error> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(Error::config(format!(
                "backoff multiplier must be a finite number >= 1, got {}",
                self.multiplier
            )));
        }
        if self.initial_delay > self.max_delay {
            return Err(Error::config(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_delay, self.max_delay
            )));
        }
        Ok(())
    }
}
