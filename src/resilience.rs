// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Resilience utilities: backoff and dispatch rate limiting.
//!
//! - [`RetryConfig`]: exponential backoff schedule
//! - [`Backoff`]: per-loop attempt counter over a [`RetryConfig`]
//! - [`RateLimiter`]: token bucket throttling business-event dispatch
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() {
//! use cascade_consumer::resilience::{Backoff, RateLimiter, RateLimitConfig, RetryConfig};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! let mut backoff = Backoff::new(RetryConfig::daemon());
//! let first = backoff.next_delay();   // 1s
//! let second = backoff.next_delay();  // 2s
//! backoff.reset();
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use std::num::NonZeroU32;
use std::time::Duration;

/// Exponential backoff schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential growth.
    pub max_delay: Duration,

    /// Multiplier per attempt (2.0 = double each time).
    pub backoff_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_factor: 2.0,
        }
    }
}

impl RetryConfig {
    /// Long-running worker schedule: never gives up, capped at 5 minutes.
    ///
    /// ```text
    /// Attempt  Delay
    /// -------  -----
    /// 1        1s
    /// 2        2s
    /// 3        4s
    /// ...
    /// 9+       300s
    /// ```
    pub fn daemon() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
        }
    }

    /// Fast schedule for tests.
    pub fn testing() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            backoff_factor: 2.0,
        }
    }

    /// Delay for a given attempt number (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        let exponent = i32::try_from(attempt - 1).unwrap_or(i32::MAX);
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs = self.initial_delay.as_secs_f64() * multiplier;
        if !delay_secs.is_finite() || delay_secs >= self.max_delay.as_secs_f64() {
            return self.max_delay;
        }
        std::cmp::min(Duration::from_secs_f64(delay_secs), self.max_delay)
    }
}

/// Attempt counter for one retry site.
///
/// Each failure moves one step along the schedule; a success resets it.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    attempt: usize,
}

impl Backoff {
    pub fn new(config: RetryConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Advance and return the delay for this attempt.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt = self.attempt.saturating_add(1);
        self.config.delay_for_attempt(self.attempt)
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Failures since the last reset.
    pub fn attempts(&self) -> usize {
        self.attempt
    }
}

// =============================================================================
// Rate Limiting
// =============================================================================

/// Token bucket parameters.
///
/// Tokens refill at `refill_rate` per second up to `burst_size`; each
/// dispatched event consumes one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitConfig {
    pub burst_size: u32,
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 10k events/sec with bursts of 1000.
    fn default() -> Self {
        Self {
            burst_size: 1000,
            refill_rate: 10_000,
        }
    }
}

/// Token bucket rate limiter for business-event dispatch.
pub struct RateLimiter {
    limiter: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota = Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
            .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            limiter: GovLimiter::direct(quota),
            config,
        }
    }

    /// Wait for one permit. Cancel-safe.
    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    /// Take a permit if one is available right now.
    pub fn try_acquire(&self) -> bool {
        self.limiter.check().is_ok()
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delay_schedule() {
        let config = RetryConfig::daemon();
        assert_eq!(config.delay_for_attempt(0), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(1));
        assert_eq!(config.delay_for_attempt(2), Duration::from_secs(2));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(4));
        assert_eq!(config.delay_for_attempt(20), Duration::from_secs(300));
    }

    #[test]
    fn test_delay_huge_attempt_is_capped() {
        let config = RetryConfig::testing();
        assert_eq!(config.delay_for_attempt(usize::MAX), Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_advances_and_resets() {
        let mut backoff = Backoff::new(RetryConfig::testing());
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert_eq!(backoff.next_delay(), Duration::from_millis(40));
        assert_eq!(backoff.attempts(), 3);
        backoff.reset();
        assert_eq!(backoff.attempts(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
    }

    #[test]
    fn test_rate_limiter_burst() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 3,
            refill_rate: 1,
        });
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn test_rate_limiter_zero_config_does_not_panic() {
        let limiter = RateLimiter::new(RateLimitConfig {
            burst_size: 0,
            refill_rate: 0,
        });
        assert!(limiter.try_acquire());
        assert_eq!(limiter.config().burst_size, 0);
    }

    #[tokio::test]
    async fn test_acquire_within_burst_does_not_wait() {
        let limiter = RateLimiter::new(RateLimitConfig::default());
        let started = std::time::Instant::now();
        for _ in 0..5 {
            limiter.acquire().await;
        }
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
