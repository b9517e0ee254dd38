// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry policies and activity options.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Exponential-backoff retry policy.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub max_attempts: u32,
    /// Delay before the second attempt.
    pub initial_interval: Duration,
    /// Upper bound on the delay.
    pub max_interval: Duration,
    /// Multiplier applied per attempt.
    pub backoff_coefficient: f64,
}

impl RetryPolicy {
    /// A policy with the given attempt count and initial interval, doubling
    /// up to `max_interval`.
    pub fn new(max_attempts: u32, initial_interval: Duration, max_interval: Duration) -> Self {
        Self {
            max_attempts,
            initial_interval,
            max_interval,
            backoff_coefficient: 2.0,
        }
    }

    /// A single attempt, no retries.
    pub fn none() -> Self {
        Self::new(1, Duration::ZERO, Duration::ZERO)
    }

    /// Backoff before attempt `next_attempt` (2-based; attempt 1 never
    /// sleeps).
    pub fn backoff(&self, next_attempt: u32) -> Duration {
        if next_attempt <= 1 {
            return Duration::ZERO;
        }
        let exp = (next_attempt - 2) as i32;
        let factor = self.backoff_coefficient.powi(exp);
        let raw = self.initial_interval.as_secs_f64() * factor;
        Duration::from_secs_f64(raw.min(self.max_interval.as_secs_f64()))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(3, Duration::from_secs(1), Duration::from_secs(10))
    }
}

/// Options governing one activity invocation.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct ActivityOptions {
    /// Per-attempt deadline.
    pub start_to_close: Duration,
    /// If set, the attempt is aborted when no heartbeat arrives within this
    /// window; the abort counts as a transient failure.
    pub heartbeat_timeout: Option<Duration>,
    /// Retry policy for transient failures.
    pub retry: RetryPolicy,
}

impl ActivityOptions {
    /// Options with the given deadline and retry policy, no heartbeat.
    pub fn new(start_to_close: Duration, retry: RetryPolicy) -> Self {
        Self {
            start_to_close,
            heartbeat_timeout: None,
            retry,
        }
    }

    /// Add a heartbeat watchdog.
    pub fn with_heartbeat(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = Some(timeout);
        self
    }
}

impl Default for ActivityOptions {
    fn default() -> Self {
        Self::new(Duration::from_secs(30), RetryPolicy::default())
    }
}
