//! Mediator configuration.
//!
//! Plain structs with defaults; the server binary populates them from the
//! environment. Nothing here reads env vars directly so tests and embedders
//! can construct configs without process-global state.

use std::time::Duration;

/// Retry schedule for queued messages: linear backoff with a hard cap on
/// attempts. After `max_retries` failed attempts a message is terminally
/// failed and only administrative requeue can revive it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Base delay between attempts. The wait after attempt `n` is
    /// `base_delay * n`.
    pub base_delay: Duration,
    /// Attempts allowed before a message is marked failed.
    pub max_retries: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_retries: 3,
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay: Duration, max_retries: u32) -> Self {
        Self {
            base_delay,
            max_retries,
        }
    }

    /// Backoff before the next attempt, given the number of attempts
    /// already made.
    pub fn delay_after(&self, attempts: u32) -> Duration {
        self.base_delay * attempts
    }

    /// True once `attempts` has consumed the whole retry budget.
    pub fn is_exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_retries
    }
}

/// Tunables for the mediator core.
#[derive(Debug, Clone)]
pub struct MediatorConfig {
    /// Retry schedule applied by the router and delivery worker.
    pub retry: RetryPolicy,
    /// How often the delivery worker sweeps for due messages.
    pub sweep_interval: Duration,
    /// Maximum messages claimed per sweep cycle.
    pub sweep_batch_limit: usize,
    /// When true, routing for a recipient requires a mediation grant.
    pub require_mediation_grant: bool,
    /// Decision applied to recipients with no recorded grant: grant-all
    /// (true) or deny-all (false).
    pub default_grant_all: bool,
}

impl Default for MediatorConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            sweep_interval: Duration::from_secs(10),
            sweep_batch_limit: 100,
            require_mediation_grant: false,
            default_grant_all: true,
        }
    }
}

impl MediatorConfig {
    /// Set the retry policy.
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Set the sweep interval.
    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval = interval;
        self
    }

    /// Set the per-sweep claim limit.
    pub fn with_sweep_batch_limit(mut self, limit: usize) -> Self {
        self.sweep_batch_limit = limit;
        self
    }

    /// Enable or disable mediation gating.
    pub fn with_mediation_gating(mut self, enabled: bool) -> Self {
        self.require_mediation_grant = enabled;
        self
    }

    /// Set the default grant decision for unknown recipients.
    pub fn with_default_grant_all(mut self, grant_all: bool) -> Self {
        self.default_grant_all = grant_all;
        self
    }
}
