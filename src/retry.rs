//! Retry policy evaluation for activity, sub-orchestration and entity calls.
//!
//! The evaluator is pure: it only decides whether and when to retry. The
//! orchestration context turns a `RetryAfter` into a durable timer followed
//! by a fresh scheduling call, so retries are ordinary history events.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Default cap on a single retry delay.
pub const DEFAULT_MAX_RETRY_INTERVAL: Duration = Duration::from_secs(6 * 24 * 60 * 60);

/// Smallest first retry interval; timers need a positive delay.
pub const MIN_RETRY_INTERVAL: Duration = Duration::from_millis(1);

type HandlePredicate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Clone)]
pub struct RetryOptions {
    pub first_retry_interval: Duration,
    pub backoff_coefficient: f64,
    pub max_retry_interval: Duration,
    /// Overall deadline measured from the first attempt.
    pub retry_timeout: Option<Duration>,
    pub max_number_of_attempts: u32,
    handle: Option<HandlePredicate>,
}

/// Outcome of evaluating a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    RetryAfter(Duration),
    GiveUp,
}

impl RetryOptions {
    /// A zero `max_number_of_attempts` is raised to 1 and a zero
    /// `first_retry_interval` to [`MIN_RETRY_INTERVAL`].
    pub fn new(first_retry_interval: Duration, max_number_of_attempts: u32) -> Self {
        Self {
            first_retry_interval: first_retry_interval.max(MIN_RETRY_INTERVAL),
            backoff_coefficient: 1.0,
            max_retry_interval: DEFAULT_MAX_RETRY_INTERVAL,
            retry_timeout: None,
            max_number_of_attempts: max_number_of_attempts.max(1),
            handle: None,
        }
    }

    /// Coefficients below 1.0, NaN and infinities fall back to 1.0.
    pub fn with_backoff_coefficient(mut self, coefficient: f64) -> Self {
        self.backoff_coefficient = if coefficient.is_finite() && coefficient >= 1.0 {
            coefficient
        } else {
            1.0
        };
        self
    }

    pub fn with_max_retry_interval(mut self, max: Duration) -> Self {
        self.max_retry_interval = max;
        self
    }

    pub fn with_retry_timeout(mut self, timeout: Duration) -> Self {
        self.retry_timeout = Some(timeout);
        self
    }

    /// Only retry errors for which `predicate` returns true.
    pub fn with_handle<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&str) -> bool + Send + Sync + 'static,
    {
        self.handle = Some(Arc::new(predicate));
        self
    }

    /// Delay after the given 1-based failed attempt.
    pub fn interval_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let first_ms = self.first_retry_interval.as_millis() as f64;
        let max_ms = self.max_retry_interval.as_millis() as f64;
        let raw = first_ms * self.backoff_coefficient.powi(exponent);
        let capped = if raw.is_finite() { raw.min(max_ms) } else { max_ms };
        Duration::from_millis(capped as u64)
    }

    /// Decide what to do after attempt `attempt` failed with `error`.
    pub fn should_retry(&self, attempt: u32, elapsed: Duration, error: &str) -> RetryDecision {
        if attempt.saturating_add(1) > self.max_number_of_attempts {
            return RetryDecision::GiveUp;
        }
        if let Some(timeout) = self.retry_timeout {
            if elapsed > timeout {
                return RetryDecision::GiveUp;
            }
        }
        if let Some(handle) = &self.handle {
            if !handle(error) {
                return RetryDecision::GiveUp;
            }
        }
        RetryDecision::RetryAfter(self.interval_for_attempt(attempt))
    }
}

impl fmt::Debug for RetryOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryOptions")
            .field("first_retry_interval", &self.first_retry_interval)
            .field("backoff_coefficient", &self.backoff_coefficient)
            .field("max_retry_interval", &self.max_retry_interval)
            .field("retry_timeout", &self.retry_timeout)
            .field("max_number_of_attempts", &self.max_number_of_attempts)
            .field("handle", &self.handle.as_ref().map(|_| "<predicate>"))
            .finish()
    }
}
