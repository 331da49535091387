//! Retry/Backoff Tracker
//!
//! Counts consecutive failures per resource and derives a capped exponential
//! backoff that gates the next attempt.

use dashmap::DashMap;
use std::time::{Duration, Instant};

// =============================================================================
// Backoff Policy
// =============================================================================

/// Exponential backoff parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    /// Delay after the first failure
    pub base: Duration,
    /// Upper bound for any delay
    pub cap: Duration,
    /// Failures after which the operation is surfaced as failed
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(300),
            max_retries: 5,
        }
    }
}

impl BackoffPolicy {
    /// Delay to wait after `failures` consecutive failures
    pub fn delay_for(&self, failures: u32) -> Duration {
        if failures == 0 {
            return Duration::ZERO;
        }
        let exponent = (failures - 1).min(31);
        self.base
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.cap)
            .min(self.cap)
    }
}

// =============================================================================
// Retry Record
// =============================================================================

/// Failure history of one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryRecord {
    pub failures: u32,
    pub last_attempt: Instant,
    /// The last failure may have been applied remotely (deadline exceeded)
    pub outcome_unknown: bool,
}

/// What to do after a failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    Exhausted { failures: u32 },
}

// =============================================================================
// Retry Tracker
// =============================================================================

#[derive(Debug)]
pub struct RetryTracker {
    records: DashMap<String, RetryRecord>,
    policy: BackoffPolicy,
}

impl RetryTracker {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            records: DashMap::new(),
            policy,
        }
    }

    pub fn policy(&self) -> &BackoffPolicy {
        &self.policy
    }

    /// Count a failure and decide whether another attempt is allowed
    pub fn record_failure(&self, name: &str, outcome_unknown: bool) -> RetryDecision {
        let mut record = self.records.entry(name.to_string()).or_insert(RetryRecord {
            failures: 0,
            last_attempt: Instant::now(),
            outcome_unknown: false,
        });
        record.failures += 1;
        record.last_attempt = Instant::now();
        record.outcome_unknown = outcome_unknown;

        if record.failures >= self.policy.max_retries {
            RetryDecision::Exhausted {
                failures: record.failures,
            }
        } else {
            RetryDecision::RetryAfter(self.policy.delay_for(record.failures))
        }
    }

    /// Forget the failure history after a success
    pub fn reset(&self, name: &str) {
        self.records.remove(name);
    }

    pub fn failures(&self, name: &str) -> u32 {
        self.records.get(name).map(|r| r.failures).unwrap_or(0)
    }

    pub fn outcome_unknown(&self, name: &str) -> bool {
        self.records
            .get(name)
            .map(|r| r.outcome_unknown)
            .unwrap_or(false)
    }

    /// Time left before the next attempt is permitted
    pub fn remaining_backoff(&self, name: &str) -> Option<Duration> {
        let record = self.records.get(name)?;
        let wait = self.policy.delay_for(record.failures);
        let elapsed = record.last_attempt.elapsed();
        if elapsed >= wait {
            None
        } else {
            Some(wait - elapsed)
        }
    }
}

impl Default for RetryTracker {
    fn default() -> Self {
        Self::new(BackoffPolicy::default())
    }
}
