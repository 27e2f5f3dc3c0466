//! Retry policy and dead-letter types shared by the transports.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use taskhub_core::JobMessage;

/// How the redelivery delay grows with the attempt number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// `base` every time.
    Fixed,
    /// `base * attempt`.
    Linear,
    /// `base * 2^(attempt - 1)`.
    #[default]
    Exponential,
}

/// Redelivery policy applied by a transport after a failed delivery.
///
/// `max_attempts` counts deliveries, the first one included, so a value of
/// 1 dead-letters on the first failure. Linear and exponential delays are
/// capped at `max_delay` before jitter is applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub strategy: BackoffStrategy,
    /// Fraction of the delay used as a +/- spread, in `0.0..=1.0`.
    pub jitter: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            strategy: BackoffStrategy::Exponential,
            jitter: 0.1,
        }
    }
}

impl RetryPolicy {
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Constant `delay` between deliveries, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            max_delay: delay,
            strategy: BackoffStrategy::Fixed,
            jitter: 0.0,
        }
    }

    pub fn with_strategy(mut self, strategy: BackoffStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Delay before redelivering a message whose delivery number `attempt`
    /// (1-based) just failed.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let Some(step) = attempt.checked_sub(1) else {
            return Duration::ZERO;
        };

        let raw = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay.saturating_mul(attempt),
            BackoffStrategy::Exponential => self
                .base_delay
                .saturating_mul(2_u32.saturating_pow(step.min(31))),
        };
        let capped = match self.strategy {
            BackoffStrategy::Fixed => raw,
            _ => raw.min(self.max_delay),
        };

        if self.jitter <= 0.0 {
            return capped;
        }
        // Spread attempts deterministically over [-jitter, +jitter].
        let position = f64::from(attempt.wrapping_mul(37) % 101) / 50.0 - 1.0;
        capped.mul_f64((1.0 + self.jitter.min(1.0) * position).max(0.0))
    }

    /// Whether a message already delivered `attempt` times may be delivered again.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// A message the transport gave up on after exhausting its retry policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    pub message: JobMessage,
    pub attempts: u32,
    pub reason: String,
    pub dead_lettered_at: DateTime<Utc>,
}

impl DeadLetterEntry {
    pub fn new(message: JobMessage, attempts: u32, reason: impl Into<String>) -> Self {
        Self {
            message,
            attempts,
            reason: reason.into(),
            dead_lettered_at: Utc::now(),
        }
    }
}
