//! Retry decisions and backoff delays.

use std::sync::Arc;
use std::time::Duration;

use rand::Rng;

use crate::error::ErrorKind;

/// Upper bound applied to exponential delays when none is configured.
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(60);

const DEFAULT_MAX_RETRIES: u32 = 3;

/// How long to wait before a retry attempt.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DelayStrategy {
    /// Retry immediately.
    Immediate,
    /// Wait a fixed interval between attempts.
    Fixed(Duration),
    /// Exponential backoff: attempt `n` (zero-based) waits
    /// `min(base * multiplier^n, max_delay)`, with optional uniform jitter.
    Exponential {
        /// The delay before the first retry.
        base: Duration,
        /// The per-attempt growth factor.
        multiplier: f64,
        /// Jitter fraction in `[0, 1]`; the computed delay is perturbed by
        /// `uniform(-delay * jitter, +delay * jitter)`.
        jitter: f64,
        /// Hard cap on the produced delay.
        max_delay: Duration,
    },
}

impl DelayStrategy {
    /// The conventional exponential strategy: the given base, doubling per
    /// attempt, full jitter disabled, capped at [`DEFAULT_MAX_DELAY`].
    #[must_use]
    pub fn exponential(base: Duration) -> Self {
        Self::Exponential {
            base,
            multiplier: 2.0,
            jitter: 0.0,
            max_delay: DEFAULT_MAX_DELAY,
        }
    }

    /// Computes the delay before retrying after `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        match *self {
            Self::Immediate => Duration::ZERO,
            Self::Fixed(delay) => delay,
            Self::Exponential { base, multiplier, jitter, max_delay } => {
                // The power is computed in floating point and saturated
                // before clamping so large attempt counts cannot overflow.
                let factor = multiplier.powi(attempt.min(i32::MAX as u32) as i32);
                let mut delay = base.as_secs_f64() * factor;
                if !delay.is_finite() {
                    delay = max_delay.as_secs_f64();
                }
                delay = delay.min(max_delay.as_secs_f64());
                if jitter > 0.0 {
                    let magnitude = delay * jitter.clamp(0.0, 1.0);
                    let offset = rand::thread_rng()
                        .gen_range(-magnitude..=magnitude);
                    delay += offset;
                }
                delay = delay.clamp(0.0, max_delay.as_secs_f64());
                Duration::from_secs_f64(delay)
            }
        }
    }
}

/// Decides whether a failed attempt is retried and how long to wait.
#[derive(Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    strategy: DelayStrategy,
    predicate: Option<Arc<dyn Fn(&ErrorKind, u32) -> bool + Send + Sync>>,
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_retries", &self.max_retries)
            .field("strategy", &self.strategy)
            .field("custom_predicate", &self.predicate.is_some())
            .finish()
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            strategy: DelayStrategy::exponential(Duration::from_millis(500)),
            predicate: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with the given attempt budget and delay strategy.
    #[must_use]
    pub fn new(max_retries: u32, strategy: DelayStrategy) -> Self {
        Self { max_retries, strategy, predicate: None }
    }

    /// A policy that never retries.
    #[must_use]
    pub fn none() -> Self {
        Self::new(0, DelayStrategy::Immediate)
    }

    /// Replaces the default retryable-kind check with a caller-supplied
    /// predicate over `(kind, attempt)`.
    #[must_use]
    pub fn with_predicate(
        mut self,
        predicate: impl Fn(&ErrorKind, u32) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.predicate = Some(Arc::new(predicate));
        self
    }

    /// The maximum number of retries after the initial attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether the error produced on `attempt` (zero-based) should be
    /// retried.
    ///
    /// The default decision retries timeouts, connection failures and
    /// 5xx-class kinds while the attempt budget lasts.
    #[must_use]
    pub fn should_retry(&self, kind: &ErrorKind, attempt: u32) -> bool {
        if attempt >= self.max_retries {
            return false;
        }
        match &self.predicate {
            Some(predicate) => predicate(kind, attempt),
            None => matches!(
                kind,
                ErrorKind::Timeout
                    | ErrorKind::NoConnection
                    | ErrorKind::ServerError(_)
                    | ErrorKind::BadGateway
                    | ErrorKind::ServiceUnavailable
                    | ErrorKind::GatewayTimeout
            ),
        }
    }

    /// The delay to sleep before retrying after `attempt` (zero-based).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.strategy.delay_for(attempt)
    }
}
