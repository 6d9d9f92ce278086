// Restart backoff and flapping detection

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::time::Duration;
use tokio::time::Instant;

/// Randomization applied on top of a backoff delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JitterMode {
    /// Exact delays
    #[default]
    None,
    /// Uniform in [0, delay]
    Full,
    /// delay/2 + uniform in [0, delay/2]
    Equal,
}

impl JitterMode {
    pub fn apply(&self, delay: Duration) -> Duration {
        let ms = delay.as_millis() as u64;
        if ms == 0 {
            return Duration::ZERO;
        }
        let mut rng = rand::rng();
        match self {
            JitterMode::None => delay,
            JitterMode::Full => Duration::from_millis(rng.random_range(0..=ms)),
            JitterMode::Equal => {
                let half = ms / 2;
                Duration::from_millis(half + rng.random_range(0..=half))
            }
        }
    }
}

/// Delay strategy between restart attempts
#[derive(Debug, Clone, PartialEq)]
pub enum BackoffStrategy {
    /// Retry immediately
    Immediate,
    /// Exponential backoff
    ExponentialBackoff {
        base_delay: Duration,
        max_delay: Duration,
        multiplier: f64,
        jitter: JitterMode,
    },
    /// Fixed delay
    FixedDelay(Duration),
}

/// Default strategy: 1s doubling up to 30s, no jitter
impl Default for BackoffStrategy {
    fn default() -> Self {
        Self::ExponentialBackoff {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: JitterMode::None,
        }
    }
}

impl BackoffStrategy {
    /// Get delay for a specific attempt (1-indexed)
    pub fn delay(&self, attempt: u32) -> Duration {
        match self {
            BackoffStrategy::Immediate => Duration::ZERO,
            BackoffStrategy::FixedDelay(duration) => *duration,
            BackoffStrategy::ExponentialBackoff {
                base_delay,
                max_delay,
                multiplier,
                jitter,
            } => {
                let exp = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
                let secs = base_delay.as_secs_f64() * multiplier.powi(exp);
                let capped = if !secs.is_finite() || secs > max_delay.as_secs_f64() {
                    *max_delay
                } else {
                    Duration::from_secs_f64(secs.max(0.0))
                };
                jitter.apply(capped)
            }
        }
    }
}

/// Failure count within a sliding window that triggers quarantine
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FlappingPolicy {
    /// Quarantine once failures in the window exceed this number
    pub threshold: usize,
    pub window: Duration,
}

impl Default for FlappingPolicy {
    fn default() -> Self {
        Self {
            threshold: 5,
            window: Duration::from_secs(300),
        }
    }
}

/// Sliding window of recent failure instants for one unit
#[derive(Debug, Clone, Default)]
pub struct FailureWindow {
    failures: VecDeque<Instant>,
}

impl FailureWindow {
    /// Record a failure and return how many fall inside the window
    pub fn record(&mut self, now: Instant, window: Duration) -> usize {
        self.failures.push_back(now);
        while let Some(oldest) = self.failures.front() {
            if now.duration_since(*oldest) > window {
                self.failures.pop_front();
            } else {
                break;
            }
        }
        self.failures.len()
    }

    pub fn len(&self) -> usize {
        self.failures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.failures.is_empty()
    }

    pub fn clear(&mut self) {
        self.failures.clear();
    }
}

impl FlappingPolicy {
    pub fn is_flapping(&self, failures_in_window: usize) -> bool {
        failures_in_window > self.threshold
    }
}
