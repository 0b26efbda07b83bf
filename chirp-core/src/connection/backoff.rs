// ABOUTME: Exponential backoff for chat session reconnection.
// ABOUTME: Retries with 2s, 4s, 8s... up to 60s; past the attempt cap, waits out a long cool-down and starts over.

use std::time::Duration;

/// Backoff configuration for reconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackoffConfig {
    /// Starting delay between retries
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier applied to delay after each failure
    pub multiplier: u32,
    /// Consecutive failures allowed before the cool-down kicks in (0 = never)
    pub max_attempts: u32,
    /// Wait used once `max_attempts` is exceeded
    pub cooldown: Duration,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            multiplier: 2,
            max_attempts: 10,
            cooldown: Duration::from_secs(300),
        }
    }
}

/// How long to wait before the next attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDelay {
    Backoff(Duration),
    /// Attempt cap exceeded; the failure counter has been reset
    Cooldown(Duration),
}

impl RetryDelay {
    pub fn duration(&self) -> Duration {
        match self {
            Self::Backoff(d) | Self::Cooldown(d) => *d,
        }
    }

    pub fn is_cooldown(&self) -> bool {
        matches!(self, Self::Cooldown(_))
    }
}

/// Tracks reconnection state with exponential backoff
#[derive(Debug)]
pub struct BackoffState {
    config: BackoffConfig,
    consecutive_failures: u32,
    current_delay: Duration,
}

impl BackoffState {
    /// Create a new backoff state with the given config
    pub fn new(config: BackoffConfig) -> Self {
        let current_delay = config.initial_delay;
        Self {
            config,
            consecutive_failures: 0,
            current_delay,
        }
    }

    /// Record a successful connection (resets backoff)
    pub fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.current_delay = self.config.initial_delay;
    }

    /// Record a failure and return the wait before the next retry
    pub fn record_failure(&mut self) -> RetryDelay {
        self.consecutive_failures += 1;

        if self.config.max_attempts > 0 && self.consecutive_failures > self.config.max_attempts {
            // Cool-down consumes the streak; the next failure starts from the base delay
            self.record_success();
            return RetryDelay::Cooldown(self.config.cooldown);
        }

        let delay = self.current_delay;

        // Calculate next delay with exponential backoff, capped at max_delay
        self.current_delay = std::cmp::min(
            self.current_delay.saturating_mul(self.config.multiplier),
            self.config.max_delay,
        );

        RetryDelay::Backoff(delay)
    }

    /// Get the number of consecutive failures
    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Get the current delay that would be used on next failure
    pub fn current_delay(&self) -> Duration {
        self.current_delay
    }

    pub fn config(&self) -> &BackoffConfig {
        &self.config
    }
}

// =============================================================================
// Tests
// =============================================================================
