//! Exponential backoff for hub reconnection

use std::time::Duration;

use rand::Rng;

/// Exponential backoff configuration
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Delay before the first reconnect attempt, in milliseconds
    pub initial_delay_ms: u64,
    /// Maximum delay in milliseconds
    pub max_delay_ms: u64,
    /// Multiplier for exponential growth
    pub multiplier: f64,
    /// Jitter factor (0.0 to 1.0)
    pub jitter_factor: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000, // 30 seconds
            multiplier: 2.0,
            jitter_factor: 0.1, // 10% jitter
        }
    }
}

/// Exponential backoff calculator with jitter and an optional attempt cap
pub struct ExponentialBackoff {
    config: BackoffConfig,
    next_base_ms: f64,
    attempt: u32,
    max_attempts: Option<u32>,
}

impl ExponentialBackoff {
    pub fn new() -> Self {
        Self::with_config(BackoffConfig::default())
    }

    pub fn with_config(config: BackoffConfig) -> Self {
        let initial = config.initial_delay_ms as f64;
        Self {
            config,
            next_base_ms: initial,
            attempt: 0,
            max_attempts: None,
        }
    }

    /// Stop handing out delays after `max_attempts` attempts
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    /// Delay before the next attempt, or `None` once the attempt cap is reached.
    ///
    /// The first delay is `initial_delay_ms`, each following one grows by
    /// `multiplier` up to `max_delay_ms`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max) = self.max_attempts {
            if self.attempt >= max {
                return None;
            }
        }
        self.attempt += 1;

        let capped_delay = self.next_base_ms.min(self.config.max_delay_ms as f64);
        self.next_base_ms = capped_delay * self.config.multiplier;

        // Apply jitter only if jitter_factor > 0
        let final_delay = if self.config.jitter_factor > 0.0 && capped_delay > 0.0 {
            let jitter_range = capped_delay * self.config.jitter_factor;
            let jitter = rand::rng().random_range(-jitter_range..jitter_range);
            (capped_delay + jitter).max(0.0) as u64
        } else {
            capped_delay.max(0.0) as u64
        };

        Some(Duration::from_millis(final_delay))
    }

    /// Reset the backoff to initial state
    pub fn reset(&mut self) {
        self.next_base_ms = self.config.initial_delay_ms as f64;
        self.attempt = 0;
    }

    /// Number of attempts handed out since the last reset
    pub fn attempt(&self) -> u32 {
        self.attempt
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new()
    }
}
