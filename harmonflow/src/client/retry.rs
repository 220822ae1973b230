//! Retry backoff with configurable strategies and jitter.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Backoff strategy for retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffStrategy {
    /// delay = base * 2^retry
    #[default]
    Exponential,
    /// delay = base * (retry + 1)
    Linear,
    /// delay = base
    Constant,
}

/// Jitter strategy to spread out simultaneous retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JitterStrategy {
    /// No jitter
    None,
    /// Random from 0 to delay
    #[default]
    Full,
    /// Half fixed, half random
    Equal,
    /// min(max, random(base, prev * 3))
    Decorrelated,
}

/// Configuration for retry behavior.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum attempts, including the first.
    pub max_attempts: usize,
    /// Base delay between attempts in milliseconds.
    pub base_delay_ms: u64,
    /// Maximum delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Backoff strategy.
    pub backoff_strategy: BackoffStrategy,
    /// Jitter strategy.
    pub jitter_strategy: JitterStrategy,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 30_000,
            backoff_strategy: BackoffStrategy::Exponential,
            jitter_strategy: JitterStrategy::Full,
        }
    }
}

impl RetryConfig {
    /// Creates a new retry config.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A config that makes exactly one attempt.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default().with_max_attempts(1)
    }

    /// Sets the maximum attempts.
    #[must_use]
    pub fn with_max_attempts(mut self, attempts: usize) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the base delay.
    #[must_use]
    pub fn with_base_delay_ms(mut self, delay: u64) -> Self {
        self.base_delay_ms = delay;
        self
    }

    /// Sets the maximum delay.
    #[must_use]
    pub fn with_max_delay_ms(mut self, delay: u64) -> Self {
        self.max_delay_ms = delay;
        self
    }

    /// Sets the backoff strategy.
    #[must_use]
    pub fn with_backoff(mut self, strategy: BackoffStrategy) -> Self {
        self.backoff_strategy = strategy;
        self
    }

    /// Sets the jitter strategy.
    #[must_use]
    pub fn with_jitter(mut self, strategy: JitterStrategy) -> Self {
        self.jitter_strategy = strategy;
        self
    }
}

/// Retry bookkeeping for one logical call.
#[derive(Debug, Default)]
pub struct RetryState {
    /// Failed attempts so far.
    pub failures: usize,
    previous_delay_ms: Option<u64>,
}

impl RetryState {
    /// Creates a new retry state.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a failed attempt and returns the delay before the next one,
    /// or `None` when attempts are exhausted.
    pub fn next_delay(&mut self, config: &RetryConfig) -> Option<Duration> {
        if self.failures + 1 >= config.max_attempts {
            self.failures += 1;
            return None;
        }
        let delay = self.calculate_delay(config);
        self.failures += 1;
        Some(delay)
    }

    /// Returns true if no further attempt is allowed.
    #[must_use]
    pub fn is_exhausted(&self, config: &RetryConfig) -> bool {
        self.failures >= config.max_attempts
    }

    /// Delay before retry number `failures` (0-based).
    #[must_use]
    pub fn calculate_delay(&mut self, config: &RetryConfig) -> Duration {
        let base = config.base_delay_ms;
        let max = config.max_delay_ms;
        let retry = u32::try_from(self.failures).unwrap_or(u32::MAX);

        let delay = match config.backoff_strategy {
            BackoffStrategy::Exponential => base.saturating_mul(2u64.saturating_pow(retry)),
            BackoffStrategy::Linear => base.saturating_mul(u64::from(retry) + 1),
            BackoffStrategy::Constant => base,
        }
        .min(max);

        let jittered = match config.jitter_strategy {
            JitterStrategy::None => delay,
            JitterStrategy::Full => {
                if delay == 0 {
                    0
                } else {
                    rand::thread_rng().gen_range(0..=delay)
                }
            }
            JitterStrategy::Equal => {
                let half = delay / 2;
                if half == 0 {
                    delay
                } else {
                    half + rand::thread_rng().gen_range(0..=half)
                }
            }
            JitterStrategy::Decorrelated => {
                let prev = self.previous_delay_ms.unwrap_or(base);
                let upper = prev.saturating_mul(3).min(max);
                let next = if upper <= base {
                    base.min(max)
                } else {
                    rand::thread_rng().gen_range(base..=upper)
                };
                self.previous_delay_ms = Some(next);
                next
            }
        };

        Duration::from_millis(jittered)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryConfig {
        RetryConfig::new()
            .with_base_delay_ms(100)
            .with_backoff(strategy)
            .with_jitter(JitterStrategy::None)
    }

    fn delays(config: &RetryConfig, n: usize) -> Vec<u128> {
        let mut state = RetryState::new();
        (0..n)
            .map(|i| {
                state.failures = i;
                state.calculate_delay(config).as_millis()
            })
            .collect()
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_attempts, 3);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Exponential);
        assert_eq!(config.jitter_strategy, JitterStrategy::Full);
        assert_eq!(RetryConfig::disabled().max_attempts, 1);
        assert_eq!(RetryConfig::new().with_max_attempts(0).max_attempts, 1);
    }

    #[test]
    fn test_backoff_curves() {
        assert_eq!(delays(&no_jitter(BackoffStrategy::Exponential), 3), vec![100, 200, 400]);
        assert_eq!(delays(&no_jitter(BackoffStrategy::Linear), 3), vec![100, 200, 300]);
        assert_eq!(delays(&no_jitter(BackoffStrategy::Constant), 3), vec![100, 100, 100]);
    }

    #[test]
    fn test_delay_capped_at_max() {
        let config = no_jitter(BackoffStrategy::Exponential).with_max_delay_ms(250);
        assert_eq!(delays(&config, 4), vec![100, 200, 250, 250]);
    }

    #[test]
    fn test_jitter_bounds() {
        let full = no_jitter(BackoffStrategy::Constant).with_jitter(JitterStrategy::Full);
        assert!(delays(&full, 20).iter().all(|&d| d <= 100));

        let equal = no_jitter(BackoffStrategy::Constant).with_jitter(JitterStrategy::Equal);
        assert!(delays(&equal, 20).iter().all(|&d| (50..=100).contains(&d)));

        let decorrelated = no_jitter(BackoffStrategy::Constant)
            .with_jitter(JitterStrategy::Decorrelated)
            .with_max_delay_ms(1_000);
        assert!(delays(&decorrelated, 20).iter().all(|&d| (100..=1_000).contains(&d)));
    }

    #[test]
    fn test_next_delay_exhausts() {
        let config = no_jitter(BackoffStrategy::Exponential).with_max_attempts(3);
        let mut state = RetryState::new();

        assert_eq!(state.next_delay(&config), Some(Duration::from_millis(100)));
        assert_eq!(state.next_delay(&config), Some(Duration::from_millis(200)));
        assert_eq!(state.next_delay(&config), None);
        assert!(state.is_exhausted(&config));
    }

    #[test]
    fn test_config_from_yaml() {
        let config: RetryConfig =
            serde_yaml::from_str("max_attempts: 5\nbackoff_strategy: linear\njitter_strategy: none")
                .unwrap();
        assert_eq!(config.max_attempts, 5);
        assert_eq!(config.backoff_strategy, BackoffStrategy::Linear);
        assert_eq!(config.base_delay_ms, 500);
    }
}
