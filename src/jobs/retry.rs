//! Rescheduling policy for failed jobs.

use std::time::Duration;

use jiff::Timestamp;

use crate::clock;
use crate::jobs::handler::HandlerError;
use crate::jobs::types::{FailureTarget, Job, JobState};

/// Computes how long a failed job waits before its next attempt
pub trait RetryPolicy: Send + Sync + std::fmt::Debug {
    /// `attempt` is the number of failures already recorded, starting at 0
    fn delay(&self, attempt: u32) -> Duration;
}

/// Same delay after every failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedDelay {
    delay: Duration,
}

impl FixedDelay {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl RetryPolicy for FixedDelay {
    fn delay(&self, _attempt: u32) -> Duration {
        self.delay
    }
}

/// `base * multiplier^attempt`, capped at `max_delay`
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ExponentialBackoff {
    base: Duration,
    multiplier: f64,
    max_delay: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, multiplier: f64, max_delay: Duration) -> Self {
        Self {
            base,
            multiplier: multiplier.max(1.0),
            max_delay,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn delay(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        let secs = self.base.as_secs_f64() * self.multiplier.powi(exponent);
        if !secs.is_finite() || secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        Duration::from_secs_f64(secs)
    }
}

/// Where a job that failed with `error` goes next.
///
/// A retryable failure with retries left decrements the count and becomes a
/// timer; history jobs stay in place but are not picked up again before the
/// same due date. With no retries left, or for configuration errors, the job
/// is dead-lettered. The delay grows with the failures already recorded on
/// the job.
pub fn failure_target(
    job: &Job,
    error: &HandlerError,
    policy: &dyn RetryPolicy,
    now: Timestamp,
) -> FailureTarget {
    if !error.is_retryable() || job.retries <= 0 {
        return FailureTarget::DeadLetter;
    }

    let remaining = job.retries - 1;
    let attempt = u32::try_from(job.failed_attempts).unwrap_or(0);
    let due_date = clock::plus(now, policy.delay(attempt));

    if job.state == JobState::History {
        FailureTarget::InPlace {
            retries: remaining,
            due_date: Some(due_date),
        }
    } else {
        FailureTarget::Timer {
            retries: remaining,
            due_date,
        }
    }
}
