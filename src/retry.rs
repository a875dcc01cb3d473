//! Reconnect backoff and timeout utilities.
//!
//! The helpers in this module are transport-agnostic. The stream client uses
//! them to space out reconnect attempts and to bound handshake duration.

use std::future::Future;
use std::time::Duration;

use rand::Rng;

/// Policy controlling the delay between reconnect attempts.
///
/// There is deliberately no attempt limit: a stream client keeps retrying until
/// it is closed.
#[derive(Clone, Debug, PartialEq)]
pub struct ReconnectPolicy {
    /// Delay used before the first reconnect attempt.
    pub initial_backoff: Duration,
    /// Upper bound for exponential backoff delay growth.
    pub max_backoff: Duration,
    /// Fraction (0.0 to 1.0) of the backoff added as random jitter.
    pub jitter_ratio: f64,
}

impl ReconnectPolicy {
    /// Default delay before the first reconnect attempt.
    pub const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
    /// Default ceiling for reconnect delays.
    pub const MAX_BACKOFF: Duration = Duration::from_secs(30);
    /// Default jitter fraction.
    pub const JITTER_RATIO: f64 = 0.25;

    /// Returns a policy without jitter, mostly useful for tests and demos.
    pub fn fixed_steps(initial_backoff: Duration, max_backoff: Duration) -> Self {
        Self {
            initial_backoff,
            max_backoff,
            jitter_ratio: 0.0,
        }
    }

    /// Checks that the policy describes a usable backoff curve.
    pub fn validate(&self) -> Result<(), String> {
        if self.initial_backoff.is_zero() {
            return Err("reconnect initial_backoff must be > 0".to_string());
        }
        if self.max_backoff < self.initial_backoff {
            return Err("reconnect max_backoff must be >= initial_backoff".to_string());
        }
        if !self.jitter_ratio.is_finite() || !(0.0..=1.0).contains(&self.jitter_ratio) {
            return Err("reconnect jitter_ratio must be between 0.0 and 1.0".to_string());
        }
        Ok(())
    }

    /// Computes the backoff for the given attempt, without jitter.
    ///
    /// `attempt` is 1-based: attempt 1 waits `initial_backoff`, every later
    /// attempt doubles the previous value until `max_backoff` is reached.
    pub fn backoff_for_attempt(&self, attempt: u32) -> Duration {
        let mut delay = self.initial_backoff;
        for _ in 1..attempt {
            if delay >= self.max_backoff {
                break;
            }
            delay = std::cmp::min(delay.saturating_mul(2), self.max_backoff);
        }
        std::cmp::min(delay, self.max_backoff)
    }

    /// Computes the delay to apply before the given reconnect attempt.
    ///
    /// This is [`backoff_for_attempt`](Self::backoff_for_attempt) plus a random
    /// jitter of up to `jitter_ratio` times that backoff.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let backoff = self.backoff_for_attempt(attempt);
        backoff.saturating_add(jitter_duration(backoff, self.jitter_ratio))
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_backoff: Self::INITIAL_BACKOFF,
            max_backoff: Self::MAX_BACKOFF,
            jitter_ratio: Self::JITTER_RATIO,
        }
    }
}

/// Applies a timeout to an async computation.
pub async fn with_timeout<T, Fut>(
    timeout: Duration,
    future: Fut,
) -> Result<T, tokio::time::error::Elapsed>
where
    Fut: Future<Output = T>,
{
    tokio::time::timeout(timeout, future).await
}

fn jitter_duration(backoff: Duration, ratio: f64) -> Duration {
    if backoff.is_zero() || ratio <= 0.0 || !ratio.is_finite() {
        return Duration::ZERO;
    }

    let limit = backoff.as_secs_f64() * ratio.min(1.0);
    let jitter = rand::rng().random_range(0.0..=limit);
    Duration::try_from_secs_f64(jitter).unwrap_or(Duration::MAX)
}
