use std::time::Duration;
use tokio::time::Instant;

use crate::config::ReconnectConfig;

/// Exponential backoff with an attempt ceiling.
///
/// Delay for attempt `n` is `base * 2^n`, capped at `max`. The attempt counter
/// resets after `reset_after` without a failure, so a connection that stays
/// healthy for a while starts over from `base`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
    reset_after: Duration,
    /// 0 = unlimited
    max_attempts: u32,
    attempt: u32,
    last_failure: Option<Instant>,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max,
            reset_after: Duration::from_secs(300),
            max_attempts: 0,
            attempt: 0,
            last_failure: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_reset_after(mut self, reset_after: Duration) -> Self {
        self.reset_after = reset_after;
        self
    }

    pub fn from_config(config: &ReconnectConfig) -> Self {
        Self::new(
            Duration::from_millis(config.initial_backoff_ms),
            Duration::from_millis(config.max_backoff_ms),
        )
        .with_max_attempts(config.max_attempts)
        .with_reset_after(Duration::from_secs(config.reset_after_secs))
    }

    /// Delay before the next attempt, or `None` once the ceiling is reached.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let now = Instant::now();
        if let Some(last) = self.last_failure {
            if now.duration_since(last) >= self.reset_after {
                self.attempt = 0;
            }
        }
        if self.max_attempts > 0 && self.attempt >= self.max_attempts {
            return None;
        }

        let factor = 1u32.checked_shl(self.attempt).unwrap_or(u32::MAX);
        let delay = self.base.saturating_mul(factor).min(self.max);
        self.attempt += 1;
        self.last_failure = Some(now);
        Some(delay)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
        self.last_failure = None;
    }

    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn delays_double_until_capped() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(5));

        let delays: Vec<_> = (0..5).filter_map(|_| backoff.next_delay()).collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_secs(1),
                Duration::from_secs(2),
                Duration::from_secs(4),
                Duration::from_secs(5),
                Duration::from_secs(5),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ceiling_stops_attempts() {
        let mut backoff = ExponentialBackoff::new(Duration::from_millis(10), Duration::from_secs(1))
            .with_max_attempts(2);

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert_eq!(backoff.next_delay(), None);

        backoff.reset();
        assert_eq!(backoff.next_delay(), Some(Duration::from_millis(10)));
    }

    #[tokio::test(start_paused = true)]
    async fn quiet_period_resets_counter() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(60))
            .with_reset_after(Duration::from_secs(30));

        backoff.next_delay();
        backoff.next_delay();
        assert_eq!(backoff.attempts(), 2);

        tokio::time::advance(Duration::from_secs(31)).await;
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(1)));
    }

    #[test]
    fn large_attempt_counts_do_not_overflow() {
        let mut backoff = ExponentialBackoff::new(Duration::from_secs(1), Duration::from_secs(180));
        backoff.attempt = 40;
        assert_eq!(backoff.next_delay(), Some(Duration::from_secs(180)));
    }
}
