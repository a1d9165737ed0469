//! Configuration value types for FerroLift
//!
//! Validated value objects shared by the configuration crate and the pipelines.

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Copy chunk size with validation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct BufferSize(usize);

impl BufferSize {
    /// Minimum buffer size (1KB)
    pub const MIN: usize = 1024;
    /// Maximum buffer size (64MB)
    pub const MAX: usize = 64 * 1024 * 1024;
    /// Default buffer size (64KB)
    pub const DEFAULT: usize = 64 * 1024;

    /// Create a new buffer size with validation
    pub fn new(size: usize) -> Result<Self, String> {
        if size < Self::MIN {
            Err(format!("Buffer size {} is below minimum {}", size, Self::MIN))
        } else if size > Self::MAX {
            Err(format!("Buffer size {} exceeds maximum {}", size, Self::MAX))
        } else if !size.is_power_of_two() {
            Err(format!("Buffer size {} must be a power of two", size))
        } else {
            Ok(Self(size))
        }
    }

    /// Get the buffer size value
    pub fn get(self) -> usize {
        self.0
    }
}

impl Default for BufferSize {
    fn default() -> Self {
        Self(Self::DEFAULT)
    }
}

impl TryFrom<usize> for BufferSize {
    type Error = String;

    fn try_from(size: usize) -> Result<Self, Self::Error> {
        Self::new(size)
    }
}

impl From<BufferSize> for usize {
    fn from(size: BufferSize) -> Self {
        size.0
    }
}

/// Retry policy: capped exponential backoff with a bounded attempt count
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts before a task fails
    pub max_retries: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound on any single delay
    pub max_delay: Duration,
    /// Backoff multiplier
    pub backoff_multiplier: f64,
}

impl RetryConfig {
    /// Default attempt budget
    pub const MAX_RETRIES: u32 = 5;

    /// Create a new retry configuration
    pub fn new(
        max_retries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Result<Self, String> {
        if backoff_multiplier <= 1.0 {
            return Err("Backoff multiplier must be greater than 1.0".to_string());
        }
        if initial_delay > max_delay {
            return Err("Initial delay cannot be greater than max delay".to_string());
        }
        Ok(Self {
            max_retries,
            initial_delay,
            max_delay,
            backoff_multiplier,
        })
    }

    /// Calculate the delay after the given failed attempt (0-based)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return self.initial_delay.min(self.max_delay);
        }

        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt.min(64) as i32);
        let delay_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }

    /// Check whether another attempt is allowed after `attempts_made`
    pub fn can_retry(&self, attempts_made: u32) -> bool {
        attempts_made < self.max_retries
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: Self::MAX_RETRIES,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
        }
    }
}
