//! Retry decisions for transient failures.
//!
//! # Design
//! A policy is a pure function of (error kind, attempt). The gateway owns the
//! loop and the sleep; the policy only answers "again, and after how long?".
//! Jitter is an injectable function so tests can pin it, and `NoDelay` lets
//! tests assert attempt counts without any time passing.

use std::time::Duration;

use rand::Rng;

use crate::config::RetrySettings;
use crate::error::ErrorKind;

/// Outcome of a retry decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryDecision {
    pub retry: bool,
    pub delay: Duration,
}

impl RetryDecision {
    pub const STOP: RetryDecision = RetryDecision {
        retry: false,
        delay: Duration::ZERO,
    };

    pub fn after(delay: Duration) -> Self {
        Self { retry: true, delay }
    }
}

/// Strategy deciding whether a failed attempt is tried again.
pub trait RetryPolicy: Send + Sync {
    /// Upper bound on dispatch attempts per call, including the first.
    fn max_attempts(&self) -> u32;

    /// `attempt` is the 1-indexed number of the attempt that just failed.
    fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision;
}

/// Whether another attempt is allowed, ignoring delay.
pub fn should_retry(kind: ErrorKind, attempt: u32, max_attempts: u32) -> bool {
    kind.is_retryable() && attempt < max_attempts
}

/// `base * 2^(attempt-1)`, capped at `ceiling`.
pub fn backoff_delay(base: Duration, ceiling: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt.saturating_sub(1)).unwrap_or(u32::MAX);
    base.saturating_mul(factor).min(ceiling)
}

/// Picks extra milliseconds in `[0, max]`.
pub type JitterFn = fn(max: u64) -> u64;

pub fn random_jitter(max: u64) -> u64 {
    rand::rng().random_range(0..=max)
}

pub fn no_jitter(_max: u64) -> u64 {
    0
}

/// Capped exponential backoff with up-to-25% jitter.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    ceiling: Duration,
    max_attempts: u32,
    jitter: JitterFn,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, ceiling: Duration, max_attempts: u32) -> Self {
        Self {
            base,
            ceiling,
            max_attempts: max_attempts.max(1),
            jitter: random_jitter,
        }
    }

    pub fn from_settings(settings: &RetrySettings) -> Self {
        Self::new(
            Duration::from_millis(settings.base_delay_ms),
            Duration::from_millis(settings.max_delay_ms),
            settings.max_attempts,
        )
    }

    #[must_use]
    pub fn with_jitter(mut self, jitter: JitterFn) -> Self {
        self.jitter = jitter;
        self
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if !should_retry(kind, attempt, self.max_attempts) {
            return RetryDecision::STOP;
        }
        let delay = backoff_delay(self.base, self.ceiling, attempt);
        let delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        let extra = (self.jitter)(delay_ms / 4).min(delay_ms / 4);
        RetryDecision::after(delay + Duration::from_millis(extra))
    }
}

/// Retries immediately; same kind rules and bound as `ExponentialBackoff`.
#[derive(Debug, Clone, Copy)]
pub struct NoDelay {
    max_attempts: u32,
}

impl NoDelay {
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
        }
    }
}

impl RetryPolicy for NoDelay {
    fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    fn decide(&self, kind: ErrorKind, attempt: u32) -> RetryDecision {
        if should_retry(kind, attempt, self.max_attempts) {
            RetryDecision::after(Duration::ZERO)
        } else {
            RetryDecision::STOP
        }
    }
}
