//! Retry policies and backoff delays.
//!
//! Attempt 0 runs immediately. After a failure the [`RetryPolicy`] decides
//! whether to go again and the [`RetryDelay`] how long to wait. Failure
//! counters update between attempts, but a query's status only flips once
//! the policy gives up.

use std::rc::Rc;
use std::time::Duration;

use crate::QueryError;

/// Decides whether a failed attempt is retried.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Fail on the first error.
    Never,
    /// Retry up to `n` times (so at most `n + 1` attempts).
    Count(u32),
    /// Resolver called with the failure count so far and the error.
    Fn(Rc<dyn Fn(u32, &QueryError) -> bool>),
}

impl RetryPolicy {
    /// Builds a resolver-backed policy.
    pub fn resolver(f: impl Fn(u32, &QueryError) -> bool + 'static) -> Self {
        RetryPolicy::Fn(Rc::new(f))
    }

    /// `failure_count` is the number of attempts that have already failed.
    pub(crate) fn should_retry(&self, failure_count: u32, error: &QueryError) -> bool {
        match self {
            RetryPolicy::Never => false,
            RetryPolicy::Count(max) => failure_count <= *max,
            RetryPolicy::Fn(resolver) => resolver(failure_count, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy::Count(3)
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            RetryPolicy::default()
        } else {
            RetryPolicy::Never
        }
    }
}

impl From<u32> for RetryPolicy {
    fn from(count: u32) -> Self {
        RetryPolicy::Count(count)
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryPolicy::Never => write!(f, "Never"),
            RetryPolicy::Count(n) => f.debug_tuple("Count").field(n).finish(),
            RetryPolicy::Fn(_) => write!(f, "Fn(..)"),
        }
    }
}

/// Computes the pause before retry attempt `n`.
#[derive(Clone)]
pub enum RetryDelay {
    /// `min(max, base * 2^attempt)`, scaled by `1 ± jitter * rand`.
    Backoff {
        /// Delay before the first retry.
        base: Duration,
        /// Upper bound on any single delay.
        max: Duration,
        /// Relative jitter in `[0, 1]`; `0.1` spreads delays by ±10%.
        jitter: f64,
    },
    /// Resolver called with the zero-based attempt index.
    Fn(Rc<dyn Fn(u32) -> Duration>),
}

impl RetryDelay {
    /// Builds a resolver-backed delay.
    pub fn resolver(f: impl Fn(u32) -> Duration + 'static) -> Self {
        RetryDelay::Fn(Rc::new(f))
    }

    pub(crate) fn delay_for(&self, attempt: u32) -> Duration {
        match self {
            RetryDelay::Backoff { base, max, jitter } => {
                let exp = 2u32.saturating_pow(attempt.min(16));
                let delay = base.saturating_mul(exp).min(*max);
                if *jitter > 0.0 {
                    // 1 - jitter ..= 1 + jitter
                    let spread = 1.0 + jitter * (fastrand::f64() * 2.0 - 1.0);
                    delay.mul_f64(spread.max(0.0)).min(*max)
                } else {
                    delay
                }
            }
            RetryDelay::Fn(resolver) => resolver(attempt),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        RetryDelay::Backoff {
            base: Duration::from_secs(1),
            max: Duration::from_secs(30),
            jitter: 0.1,
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(fixed: Duration) -> Self {
        RetryDelay::resolver(move |_| fixed)
    }
}

impl std::fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryDelay::Backoff { base, max, jitter } => f
                .debug_struct("Backoff")
                .field("base", base)
                .field("max", max)
                .field("jitter", jitter)
                .finish(),
            RetryDelay::Fn(_) => write!(f, "Fn(..)"),
        }
    }
}
