//! Mutation-aware retry controller.
//!
//! Each invocation runs through [`RetryController::run`]:
//!
//! 1. Run one attempt. Success returns immediately.
//! 2. A non-retryable error returns immediately.
//! 3. A write invocation returns after its first attempt, whatever the
//!    error says. Write invocations are never retried.
//! 4. Otherwise, if attempts remain, sleep for [`jittered_backoff`] and try
//!    again; when none remain, return the last error.
//!
//! Base delays follow an exponential schedule built with
//! [`backon::ExponentialBuilder`]; jitter is applied on top by
//! [`jittered_backoff`] so an upstream-mandated minimum can be honored.

use std::{future::Future, time::Duration};

use backon::{BackoffBuilder, ExponentialBuilder};
use rand::Rng;
use toolgate_core::{RetryConfig, StructuredError};
use tracing::{debug, warn};

/// Timing and attempt limits for retries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub default_attempts: u32,
    pub max_attempts_ceiling: u32,
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
    pub deterministic: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            default_attempts: config.max_attempts.max(1),
            max_attempts_ceiling: config.max_attempts_ceiling.max(1),
            initial_delay: config.initial_delay(),
            max_delay: config.max_delay(),
            max_jitter: config.max_jitter(),
            deterministic: config.deterministic,
        }
    }

    /// Jitter-free policy with fixed millisecond delays, for tests and
    /// reproducible runs.
    pub fn deterministic(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            max_jitter: Duration::ZERO,
            deterministic: true,
            ..Self::default()
        }
    }

    /// Resolves a per-request override into an attempt budget within
    /// `[1, max_attempts_ceiling]`.
    pub fn clamp_attempts(&self, requested: Option<u32>) -> u32 {
        requested
            .unwrap_or(self.default_attempts)
            .clamp(1, self.max_attempts_ceiling.max(1))
    }

    /// Base delays between consecutive attempts, before jitter.
    ///
    /// Delays are rounded to whole milliseconds so the schedule is exact.
    pub fn delays(&self, max_attempts: u32) -> impl Iterator<Item = Duration> + use<> {
        let retries = usize::try_from(max_attempts.saturating_sub(1)).unwrap_or(usize::MAX);
        ExponentialBuilder::default()
            .with_min_delay(self.initial_delay)
            .with_max_delay(self.max_delay)
            .with_factor(2.0)
            .with_max_times(retries)
            .build()
            .map(round_to_millis)
    }
}

fn round_to_millis(delay: Duration) -> Duration {
    let millis = (delay.as_nanos() + 500_000) / 1_000_000;
    Duration::from_millis(u64::try_from(millis).unwrap_or(u64::MAX))
}

/// Applies jitter to a base delay.
///
/// - In deterministic mode the upstream minimum (or else the base delay) is
///   returned unchanged.
/// - With an upstream minimum the result is `minimum + U(0, max_jitter)`,
///   capped at `max(minimum, max_delay)` and never below `minimum`.
/// - Without one the result is drawn from `U(0, delay)` (full jitter).
pub fn jittered_backoff(delay: Duration, minimum: Option<Duration>, policy: &RetryPolicy) -> Duration {
    if policy.deterministic {
        return minimum.unwrap_or(delay);
    }

    let mut rng = rand::rng();
    match minimum {
        Some(minimum) => {
            let jitter = if policy.max_jitter.is_zero() {
                Duration::ZERO
            } else {
                rng.random_range(Duration::ZERO..=policy.max_jitter)
            };
            let cap = minimum.max(policy.max_delay);
            (minimum + jitter).min(cap).max(minimum)
        }
        None if delay.is_zero() => Duration::ZERO,
        None => rng.random_range(Duration::ZERO..=delay),
    }
}

/// Result of a retried operation together with the attempts it took.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryOutcome<T> {
    pub result: Result<T, StructuredError>,
    pub attempts: u32,
}

/// Runs attempts under a [`RetryPolicy`].
#[derive(Debug, Clone, Default)]
pub struct RetryController {
    policy: RetryPolicy,
}

impl RetryController {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Runs `attempt` until it succeeds, fails terminally, or the budget is
    /// spent.
    ///
    /// `attempt` receives the one-based attempt number. Attempts run strictly
    /// one after another.
    pub async fn run<T, F, Fut>(&self, max_attempts: u32, write_action: bool, mut attempt: F) -> RetryOutcome<T>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, StructuredError>>,
    {
        let max_attempts = max_attempts.max(1);
        let mut delays = self.policy.delays(max_attempts);
        let mut made = 0;

        loop {
            made += 1;
            let error = match attempt(made).await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: made,
                    };
                }
                Err(error) => error,
            };

            if !error.retryable || write_action || made >= max_attempts {
                if error.retryable && write_action {
                    debug!(code = %error.code, "Not retrying write invocation");
                }
                return RetryOutcome {
                    result: Err(error),
                    attempts: made,
                };
            }

            let base = delays.next().unwrap_or(self.policy.max_delay);
            let wait = jittered_backoff(base, error.retry_after(), &self.policy);
            warn!(
                attempt = made,
                max_attempts,
                delay_ms = u64::try_from(wait.as_millis()).unwrap_or(u64::MAX),
                category = %error.category,
                code = %error.code,
                "Retrying after transient failure"
            );
            tokio::time::sleep(wait).await;
        }
    }
}
