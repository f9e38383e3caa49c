// SPDX-License-Identifier: PolyForm-Noncommercial-1.0.0
// Copyright (c) 2025 Sylvex. All rights reserved.

//! Retry policy shared by session reconnection and historian flushes.
//!
//! [`RetryPolicy`] is a pure calculator: exponential growth from a base delay,
//! capped at `max_delay`, plus a random jitter drawn uniformly from
//! `[0, jitter_cap]`. [`Backoff`] walks a policy attempt by attempt and owns
//! the random source, so tests can seed it and get the same delays on every
//! run.
//!
//! # Example
//!
//! ```
//! use vigil_core::retry::{Backoff, RetryPolicy};
//! use std::time::Duration;
//!
//! let policy = RetryPolicy::new()
//!     .with_base_delay(Duration::from_millis(100))
//!     .with_multiplier(2.0)
//!     .with_max_delay(Duration::from_secs(1))
//!     .with_jitter_cap(Duration::ZERO)
//!     .with_max_attempts(3);
//!
//! let mut backoff = Backoff::with_seed(policy, 7);
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(100)));
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(200)));
//! assert_eq!(backoff.next_delay(), Some(Duration::from_millis(400)));
//! assert_eq!(backoff.next_delay(), None);
//! ```

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::error::{HistorianError, SessionError};

// =============================================================================
// RetryPolicy
// =============================================================================

/// Exponential backoff with cap and additive jitter.
///
/// Delay for attempt `n` (1-based):
/// `min(base_delay * multiplier^(n-1), max_delay) + uniform(0, jitter_cap)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetryPolicy {
    /// Delay before the first retry.
    #[serde(default = "default_base_delay", with = "crate::serde_helpers::duration_millis")]
    pub base_delay: Duration,

    /// Growth factor between consecutive attempts.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Upper bound of the exponential part.
    #[serde(default = "default_max_delay", with = "crate::serde_helpers::duration_millis")]
    pub max_delay: Duration,

    /// Upper bound of the random jitter added to every delay.
    #[serde(default = "default_jitter_cap", with = "crate::serde_helpers::duration_millis")]
    pub jitter_cap: Duration,

    /// Maximum number of retries. `None` retries forever.
    #[serde(default)]
    pub max_attempts: Option<u32>,
}

fn default_base_delay() -> Duration {
    Duration::from_millis(500)
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_delay() -> Duration {
    Duration::from_secs(30)
}

fn default_jitter_cap() -> Duration {
    Duration::from_millis(250)
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay: default_base_delay(),
            multiplier: default_multiplier(),
            max_delay: default_max_delay(),
            jitter_cap: default_jitter_cap(),
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy with default values (unbounded attempts).
    pub fn new() -> Self {
        Self::default()
    }

    /// Fast, jitter-free policy for tests.
    pub fn for_testing() -> Self {
        Self {
            base_delay: Duration::from_millis(5),
            multiplier: 2.0,
            max_delay: Duration::from_millis(50),
            jitter_cap: Duration::ZERO,
            max_attempts: None,
        }
    }

    /// Sets the base delay.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Sets the delay cap.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the jitter cap.
    pub fn with_jitter_cap(mut self, cap: Duration) -> Self {
        self.jitter_cap = cap;
        self
    }

    /// Bounds the number of retries.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    /// Removes the retry bound.
    pub fn unbounded(mut self) -> Self {
        self.max_attempts = None;
        self
    }

    /// Returns `true` if retry number `attempt` (1-based) is allowed.
    #[inline]
    pub fn allows_attempt(&self, attempt: u32) -> bool {
        match self.max_attempts {
            Some(max) => attempt <= max,
            None => true,
        }
    }

    /// Returns the deterministic part of the delay for `attempt` (1-based).
    pub fn capped_delay(&self, attempt: u32) -> Duration {
        let base = self.base_delay.as_millis() as f64;
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let grown = base * self.multiplier.powi(exponent);
        let cap = self.max_delay.as_millis() as f64;
        let capped = if grown.is_finite() { grown.min(cap) } else { cap };

        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Returns the full delay for `attempt`, drawing jitter from `rng`.
    pub fn delay_for_attempt<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        self.capped_delay(attempt) + self.jitter(rng)
    }

    fn jitter<R: Rng + ?Sized>(&self, rng: &mut R) -> Duration {
        let cap_ms = self.jitter_cap.as_millis() as u64;
        if cap_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rng.gen_range(0..=cap_ms))
    }

    /// Validates the policy.
    pub fn validate(&self) -> Result<(), String> {
        if self.base_delay.is_zero() {
            return Err("base_delay must be greater than zero".to_string());
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err("multiplier must be a finite value >= 1.0".to_string());
        }
        if self.max_delay < self.base_delay {
            return Err("max_delay must not be smaller than base_delay".to_string());
        }
        Ok(())
    }

    /// Runs `operation` until it succeeds, fails permanently, or the policy
    /// gives up.
    ///
    /// Non-retryable errors are returned after the first attempt.
    pub async fn execute<F, Fut, T, E>(&self, mut operation: F) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Retryable + fmt::Display,
    {
        let mut backoff = Backoff::new(self.clone());
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            match operation().await {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts,
                    }
                }
                Err(error) if error.is_retryable() => match backoff.next_delay() {
                    Some(delay) => {
                        tracing::debug!(
                            attempt = attempts,
                            delay_ms = delay.as_millis() as u64,
                            error = %error,
                            "Retrying operation"
                        );
                        tokio::time::sleep(delay).await;
                    }
                    None => {
                        return RetryOutcome {
                            result: Err(error),
                            attempts,
                        }
                    }
                },
                Err(error) => {
                    return RetryOutcome {
                        result: Err(error),
                        attempts,
                    }
                }
            }
        }
    }
}

// =============================================================================
// Retryable
// =============================================================================

/// Errors that know whether another attempt may succeed.
pub trait Retryable {
    /// Returns `true` if the operation may be retried.
    fn is_retryable(&self) -> bool;
}

impl Retryable for SessionError {
    fn is_retryable(&self) -> bool {
        SessionError::is_retryable(self)
    }
}

impl Retryable for HistorianError {
    fn is_retryable(&self) -> bool {
        HistorianError::is_retryable(self)
    }
}

/// Result of [`RetryPolicy::execute`].
#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    /// Final result.
    pub result: Result<T, E>,
    /// Number of attempts made, including the first.
    pub attempts: u32,
}

// =============================================================================
// Backoff
// =============================================================================

/// Stateful walk over a [`RetryPolicy`].
///
/// Each call to [`Backoff::next_delay`] consumes one retry; `None` means the
/// policy is exhausted.
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
    rng: StdRng,
}

impl Backoff {
    /// Creates a backoff seeded from OS entropy.
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: StdRng::from_entropy(),
        }
    }

    /// Creates a backoff with a fixed seed.
    pub fn with_seed(policy: RetryPolicy, seed: u64) -> Self {
        Self {
            policy,
            attempt: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Returns the delay before the next retry, or `None` when exhausted.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let next = self.attempt.saturating_add(1);
        if !self.policy.allows_attempt(next) {
            return None;
        }
        self.attempt = next;
        Some(self.policy.delay_for_attempt(next, &mut self.rng))
    }

    /// Number of retries handed out so far.
    #[inline]
    pub fn attempts(&self) -> u32 {
        self.attempt
    }

    /// Returns `true` if no further retry is allowed.
    pub fn is_exhausted(&self) -> bool {
        !self.policy.allows_attempt(self.attempt.saturating_add(1))
    }

    /// Restarts from the first attempt.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Returns the underlying policy.
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_delay()
    }
}

impl fmt::Debug for Backoff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Backoff")
            .field("policy", &self.policy)
            .field("attempt", &self.attempt)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
