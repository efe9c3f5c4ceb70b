//! Adaptive request pacing.
//!
//! The limiter is plain data plus pure transitions: callers pass in the
//! current `Instant`, so backoff behavior is fully testable without real
//! delay. One limiter instance is shared by every transport in the process
//! (behind a mutex), but nothing here is ambient global state.

use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    /// First delay after a failure; doubles per consecutive failure.
    pub base_delay: Duration,
    /// Hard cap on the computed delay.
    pub max_delay: Duration,
    /// Spacing enforced between calls even on sustained success.
    pub min_spacing: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            min_spacing: Duration::from_millis(300),
        }
    }
}

#[derive(Debug)]
pub struct RateLimiter {
    policy: BackoffPolicy,
    consecutive_failures: u32,
    current_delay: Duration,
    /// Server-provided wait hint; takes precedence over the computed delay.
    retry_hint: Option<Duration>,
    last_request_at: Option<Instant>,
}

impl RateLimiter {
    pub fn new(policy: BackoffPolicy) -> Self {
        Self {
            policy,
            consecutive_failures: 0,
            current_delay: Duration::ZERO,
            retry_hint: None,
            last_request_at: None,
        }
    }

    /// How long the caller must block before issuing the next call.
    ///
    /// The failure delay (hint or exponential) and the minimum spacing are
    /// independent constraints; the longer one wins.
    pub fn required_wait(&self, now: Instant) -> Duration {
        let failure_delay = if self.consecutive_failures == 0 {
            Duration::ZERO
        } else {
            self.retry_hint.unwrap_or(self.current_delay)
        };

        let spacing = match self.last_request_at {
            Some(last) => self
                .policy
                .min_spacing
                .saturating_sub(now.saturating_duration_since(last)),
            None => Duration::ZERO,
        };

        failure_delay.max(spacing)
    }

    /// Records a completed, accepted call and resets failure state.
    pub fn record_success(&mut self, now: Instant) {
        self.consecutive_failures = 0;
        self.current_delay = Duration::ZERO;
        self.retry_hint = None;
        self.last_request_at = Some(now);
    }

    /// Records a rate-limit or server failure, growing the computed delay.
    /// A `retry_after` hint from the server overrides the exponential value
    /// for the next wait.
    pub fn record_failure(&mut self, now: Instant, retry_after: Option<Duration>) {
        self.consecutive_failures += 1;
        let exponent = self.consecutive_failures.saturating_sub(1).min(16);
        let computed = self
            .policy
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.policy.max_delay);
        self.current_delay = computed;
        self.retry_hint = retry_after.map(|hint| hint.min(self.policy.max_delay));
        self.last_request_at = Some(now);
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// The wait currently in force, for diagnostics and progress display.
    pub fn current_delay(&self) -> Duration {
        self.retry_hint.unwrap_or(self.current_delay)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(BackoffPolicy {
            base_delay: Duration::from_secs(5),
            max_delay: Duration::from_secs(60),
            min_spacing: Duration::from_millis(300),
        })
    }

    #[test]
    fn waits_double_per_consecutive_failure() {
        let mut limiter = limiter();
        let now = Instant::now();

        limiter.record_failure(now, None);
        assert_eq!(limiter.required_wait(now), Duration::from_secs(5));

        limiter.record_failure(now, None);
        assert_eq!(limiter.required_wait(now), Duration::from_secs(10));

        limiter.record_failure(now, None);
        assert_eq!(limiter.required_wait(now), Duration::from_secs(20));
    }

    #[test]
    fn computed_delay_is_capped_at_max() {
        let mut limiter = limiter();
        let now = Instant::now();
        for _ in 0..10 {
            limiter.record_failure(now, None);
        }
        assert_eq!(limiter.required_wait(now), Duration::from_secs(60));
    }

    #[test]
    fn server_hint_overrides_exponential_schedule() {
        let mut limiter = limiter();
        let now = Instant::now();

        limiter.record_failure(now, None);
        limiter.record_failure(now, None);
        limiter.record_failure(now, Some(Duration::from_secs(5)));

        // Exponential schedule would say 20s; the hint wins.
        assert_eq!(limiter.required_wait(now), Duration::from_secs(5));
    }

    #[test]
    fn success_resets_failure_state_but_keeps_spacing() {
        let mut limiter = limiter();
        let now = Instant::now();

        limiter.record_failure(now, None);
        limiter.record_success(now);
        assert_eq!(limiter.consecutive_failures(), 0);

        // Immediately after a success only the minimum spacing applies.
        assert_eq!(limiter.required_wait(now), Duration::from_millis(300));
        assert_eq!(
            limiter.required_wait(now + Duration::from_millis(200)),
            Duration::from_millis(100)
        );
        assert_eq!(
            limiter.required_wait(now + Duration::from_millis(400)),
            Duration::ZERO
        );
    }

    #[test]
    fn first_call_needs_no_wait() {
        let limiter = limiter();
        assert_eq!(limiter.required_wait(Instant::now()), Duration::ZERO);
    }

    #[test]
    fn hint_is_clamped_to_max_delay() {
        let mut limiter = limiter();
        let now = Instant::now();
        limiter.record_failure(now, Some(Duration::from_secs(600)));
        assert_eq!(limiter.required_wait(now), Duration::from_secs(60));
    }
}
