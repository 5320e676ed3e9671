//! Controller runtime configuration

use std::time::Duration;

use crate::queue::BackoffPolicy;
use crate::Error;

/// Default number of reconcile workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default delay before re-examining a cluster whose members are still provisioning
pub const DEFAULT_REQUEUE_DELAY: Duration = Duration::from_secs(10);

/// Default upper bound on a single live API call
pub const DEFAULT_LIVE_CALL_TIMEOUT: Duration = Duration::from_secs(30);

/// Settings for the reconcile loop and its live calls
#[derive(Clone, Debug, PartialEq)]
pub struct ControllerConfig {
    /// Number of concurrent reconcile workers
    pub workers: usize,
    /// Delay used when a member cannot be evaluated yet
    pub requeue_delay: Duration,
    /// Deadline for each live list or patch
    pub live_call_timeout: Duration,
    /// Restrict namespaced watches to one namespace; `None` watches all
    pub watch_namespace: Option<String>,
    /// Per-key retry backoff for failed syncs
    pub backoff: BackoffPolicy,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            requeue_delay: DEFAULT_REQUEUE_DELAY,
            live_call_timeout: DEFAULT_LIVE_CALL_TIMEOUT,
            watch_namespace: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl ControllerConfig {
    /// Check the configuration before starting any workers
    pub fn validate(&self) -> Result<(), Error> {
        if self.workers == 0 {
            return Err(Error::config("at least one worker is required"));
        }
        if self.requeue_delay.is_zero() {
            return Err(Error::config("requeue delay must be greater than zero"));
        }
        if self.live_call_timeout.is_zero() {
            return Err(Error::config("live call timeout must be greater than zero"));
        }
        if matches!(&self.watch_namespace, Some(ns) if ns.is_empty()) {
            return Err(Error::config("watch namespace must not be empty"));
        }
        self.backoff.validate()
    }
}
