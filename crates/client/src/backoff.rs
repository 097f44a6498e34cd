//! Restart delays with jittered exponential back-off.

use std::time::Duration;

use tw_domain::config::RestartPolicy;

/// Delay schedule derived from a server's [`RestartPolicy`].
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    initial_delay: Duration,
    max_delay: Duration,
    backoff_factor: f64,
    max_attempts: u32,
}

impl From<&RestartPolicy> for RestartBackoff {
    fn from(policy: &RestartPolicy) -> Self {
        Self {
            initial_delay: policy.initial_delay(),
            max_delay: policy.max_delay(),
            backoff_factor: policy.backoff_factor.max(1.0),
            max_attempts: policy.max_attempts,
        }
    }
}

impl RestartBackoff {
    /// Compute the delay for the given attempt number (0-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.backoff_factor.powi(attempt.min(63) as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);

        // Up to 25% jitter so servers that crashed together restart apart.
        let jitter = capped_ms * 0.25 * pseudo_random_fraction(attempt);
        Duration::from_millis((capped_ms + jitter) as u64)
    }

    /// Whether attempt number `attempt` (0-indexed) is over budget.
    ///
    /// Unlike a reconnect loop, a restart budget is always finite: a policy
    /// with `max_attempts = 0` never restarts.
    pub fn should_give_up(&self, attempt: u32) -> bool {
        attempt >= self.max_attempts
    }
}

/// Cheap deterministic "random" fraction [0, 1) based on attempt number.
fn pseudo_random_fraction(attempt: u32) -> f64 {
    let hash = attempt.wrapping_mul(2654435761); // Knuth multiplicative hash
    (hash as f64) / (u32::MAX as f64)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(max_attempts: u32) -> RestartPolicy {
        RestartPolicy {
            max_attempts,
            ..Default::default()
        }
    }

    #[test]
    fn first_delay_is_initial() {
        let b = RestartBackoff::from(&policy(3));
        // attempt 0 hashes to 0, so no jitter
        assert_eq!(b.delay_for_attempt(0), Duration::from_millis(500));
    }

    #[test]
    fn delay_grows_with_backoff() {
        let b = RestartBackoff::from(&policy(5));
        let d0 = b.delay_for_attempt(0);
        let d1 = b.delay_for_attempt(1);
        let d2 = b.delay_for_attempt(2);
        assert!(d1 > d0);
        assert!(d2 > d1);
    }

    #[test]
    fn delay_capped_at_max() {
        let b = RestartBackoff::from(&RestartPolicy {
            max_attempts: 100,
            initial_delay_ms: 10_000,
            max_delay_ms: 30_000,
            backoff_factor: 10.0,
        });
        // max_delay + 25% jitter
        assert!(b.delay_for_attempt(90) <= Duration::from_millis(37_500));
    }

    #[test]
    fn budget_is_bounded() {
        let b = RestartBackoff::from(&policy(2));
        assert!(!b.should_give_up(0));
        assert!(!b.should_give_up(1));
        assert!(b.should_give_up(2));
    }

    #[test]
    fn disabled_policy_gives_up_immediately() {
        let b = RestartBackoff::from(&policy(0));
        assert!(b.should_give_up(0));
    }
}
