//! Retry policy for optimistic consumer registration.
//!
//! A stale snapshot sends the registration loop back around with a fresh read.
//! Between attempts the loop sleeps a jittered delay whose ceiling grows
//! exponentially from `backoff_base` up to `backoff_cap`. After `max_attempts`
//! the registration is abandoned.

use std::time::Duration;

use rand::Rng;

use crate::ids::ConsumerId;

/// Verdict of a registry's retry hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    Continue,
    Exhausted,
}

/// State of an in-flight registration, handed to the registry's retry hook.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationAttempt {
    pub consumer_id: ConsumerId,
    pub permits: u32,
    /// Attempts made so far (1 after the first stale write).
    pub attempt: u32,
    /// Active permits observed by the stale attempt.
    pub observed_used_permits: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: env_u64("PERMITGATE_REGISTER_MAX_ATTEMPTS")
                .and_then(|n| u32::try_from(n).ok())
                .unwrap_or(100),
            backoff_base: Duration::from_millis(
                env_u64("PERMITGATE_REGISTER_BACKOFF_MS").unwrap_or(10),
            ),
            backoff_cap: Duration::from_millis(
                env_u64("PERMITGATE_REGISTER_BACKOFF_CAP_MS").unwrap_or(250),
            ),
        }
    }
}

fn env_u64(key: &str) -> Option<u64> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

impl RetryPolicy {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_backoff(mut self, base: Duration, cap: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_cap = cap;
        self
    }

    /// Jitter ceiling before the next attempt, or `None` once `attempts`
    /// stale writes have used up the budget.
    pub fn next_delay(&self, attempts: u32) -> Option<Duration> {
        if attempts >= self.max_attempts {
            return None;
        }
        let exponent = attempts.saturating_sub(1).min(10);
        Some(
            self.backoff_base
                .saturating_mul(1u32 << exponent)
                .min(self.backoff_cap),
        )
    }
}

/// Source of the randomized delay between registration attempts.
pub trait Jitter: Send + Sync {
    /// A delay in `[0, ceiling]`.
    fn jitter(&self, ceiling: Duration) -> Duration;
}

/// Uniformly random jitter from the thread-local RNG.
#[derive(Debug, Clone, Copy, Default)]
pub struct RandomJitter;

impl Jitter for RandomJitter {
    fn jitter(&self, ceiling: Duration) -> Duration {
        let max = u64::try_from(ceiling.as_micros()).unwrap_or(u64::MAX);
        if max == 0 {
            return Duration::ZERO;
        }
        Duration::from_micros(rand::rng().random_range(0..=max))
    }
}

/// Retry immediately.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJitter;

impl Jitter for NoJitter {
    fn jitter(&self, _ceiling: Duration) -> Duration {
        Duration::ZERO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RetryPolicy {
        RetryPolicy {
            max_attempts,
            backoff_base: Duration::from_millis(10),
            backoff_cap: Duration::from_millis(50),
        }
    }

    #[test]
    fn ceiling_doubles_until_cap() {
        let p = policy(10);
        assert_eq!(p.next_delay(1), Some(Duration::from_millis(10)));
        assert_eq!(p.next_delay(2), Some(Duration::from_millis(20)));
        assert_eq!(p.next_delay(3), Some(Duration::from_millis(40)));
        assert_eq!(p.next_delay(4), Some(Duration::from_millis(50)));
        assert_eq!(p.next_delay(9), Some(Duration::from_millis(50)));
    }

    #[test]
    fn exhausted_after_max_attempts() {
        let p = policy(3);
        assert!(p.next_delay(2).is_some());
        assert_eq!(p.next_delay(3), None);
        assert_eq!(p.next_delay(4), None);
    }

    #[test]
    fn single_attempt_policy_never_retries() {
        assert_eq!(policy(1).next_delay(1), None);
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let p = policy(u32::MAX);
        assert_eq!(p.next_delay(u32::MAX - 1), Some(Duration::from_millis(50)));
    }

    #[test]
    fn huge_backoff_base_saturates_at_cap() {
        let policy = RetryPolicy::new(100).with_backoff(Duration::MAX / 2, Duration::MAX);
        assert_eq!(policy.next_delay(3), Some(Duration::MAX));

        let capped = RetryPolicy::new(100).with_backoff(Duration::MAX, Duration::from_secs(1));
        assert_eq!(capped.next_delay(11), Some(Duration::from_secs(1)));
    }

    #[test]
    fn random_jitter_stays_within_ceiling() {
        let ceiling = Duration::from_millis(10);
        for _ in 0..1000 {
            assert!(RandomJitter.jitter(ceiling) <= ceiling);
        }
        assert_eq!(RandomJitter.jitter(Duration::ZERO), Duration::ZERO);
    }

    #[test]
    fn builders_override_defaults() {
        let p = RetryPolicy::new(7)
            .with_backoff(Duration::from_millis(1), Duration::from_millis(4));
        assert_eq!(p.max_attempts, 7);
        assert_eq!(p.next_delay(5), Some(Duration::from_millis(4)));
        assert_eq!(p.with_max_attempts(2).next_delay(2), None);
    }
}
