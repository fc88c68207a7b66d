//! Backoff for transient failures and jitter for rate-limit waits.

use std::time::Duration;

use rand::Rng;

use chatsync_core::SchedulerConfig;

/// Exponential backoff, `base * 2^attempt` capped at `max`, with up to 50%
/// jitter subtracted so concurrent sources do not retry in lockstep.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
    pub jitter: bool,
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        let scale = 2f64.powi(attempt.min(31) as i32);
        let capped = (self.base.as_secs_f64() * scale).min(self.max.as_secs_f64());
        let delay = Duration::from_secs_f64(capped);

        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let half_ms = (delay.as_millis() / 2) as u64;
        let offset = rand::thread_rng().gen_range(0..=half_ms);
        delay.saturating_sub(Duration::from_millis(offset))
    }
}

/// How a single upstream call is retried.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts for transient failures, including the first.
    pub max_attempts: u32,
    pub backoff: Backoff,
    /// Rate-limit signals honoured per call before giving up.
    pub max_rate_limit_waits: u32,
    /// Upper bound of the random extra added to a rate-limit wait.
    pub rate_limit_jitter: Duration,
    /// Timeout applied to each individual upstream call.
    pub call_timeout: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            max_attempts: config.retry_max_attempts.max(1),
            backoff: Backoff {
                base: config.backoff_base,
                max: config.backoff_max,
                jitter: true,
            },
            max_rate_limit_waits: config.max_rate_limit_waits,
            rate_limit_jitter: config.rate_limit_jitter,
            call_timeout: config.fetch_timeout,
        }
    }

    /// The requested wait plus a small random extra. Never shorter than `wait`.
    pub fn rate_limit_delay(&self, wait: Duration) -> Duration {
        let jitter_ms = self.rate_limit_jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return wait;
        }
        wait + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&SchedulerConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backoff(jitter: bool) -> Backoff {
        Backoff {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            jitter,
        }
    }

    #[test]
    fn exponential_growth_is_capped() {
        let b = backoff(false);
        assert_eq!(b.delay(0), Duration::from_millis(100));
        assert_eq!(b.delay(1), Duration::from_millis(200));
        assert_eq!(b.delay(3), Duration::from_millis(800));
        assert_eq!(b.delay(4), Duration::from_millis(1_000));
        assert_eq!(b.delay(60), Duration::from_millis(1_000));
    }

    #[test]
    fn jitter_stays_within_half_the_delay() {
        let b = backoff(true);
        for _ in 0..50 {
            let d = b.delay(2);
            assert!(d >= Duration::from_millis(200), "{d:?}");
            assert!(d <= Duration::from_millis(400), "{d:?}");
        }
    }

    #[test]
    fn rate_limit_delay_never_undercuts_the_request() {
        let policy = RetryPolicy {
            rate_limit_jitter: Duration::from_millis(250),
            ..RetryPolicy::default()
        };
        for _ in 0..50 {
            let d = policy.rate_limit_delay(Duration::from_secs(5));
            assert!(d >= Duration::from_secs(5));
            assert!(d <= Duration::from_millis(5_250));
        }

        let exact = RetryPolicy {
            rate_limit_jitter: Duration::ZERO,
            ..RetryPolicy::default()
        };
        assert_eq!(exact.rate_limit_delay(Duration::from_secs(5)), Duration::from_secs(5));
    }

    #[test]
    fn policy_follows_scheduler_config() {
        let config = SchedulerConfig {
            retry_max_attempts: 7,
            ..SchedulerConfig::default()
        };
        let policy = RetryPolicy::from_config(&config);
        assert_eq!(policy.max_attempts, 7);
        assert_eq!(policy.call_timeout, config.fetch_timeout);
        assert_eq!(policy.backoff.base, config.backoff_base);
    }
}
