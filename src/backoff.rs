//! Exponential reconnect backoff with jitter.
//!
//! Shared by the broker client and the HTTP object store. The delay doubles
//! per consecutive failure up to a cap; a random jitter of up to 10% is added
//! so a fleet of workers does not reconnect in lockstep.

use rand::Rng;
use std::time::Duration;

use crate::config::defaults::{RECONNECT_INITIAL_DELAY_MS, RECONNECT_MAX_DELAY_MS};

/// Maximum doubling exponent; keeps the shift from overflowing.
const MAX_BACKOFF_EXPONENT: u32 = 16;

/// Link state of a long-lived client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConnectionState {
    #[default]
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Backoff {
    initial: Duration,
    max: Duration,
    failures: u32,
}

impl Default for Backoff {
    fn default() -> Self {
        Self::new(
            Duration::from_millis(RECONNECT_INITIAL_DELAY_MS),
            Duration::from_millis(RECONNECT_MAX_DELAY_MS),
        )
    }
}

impl Backoff {
    pub fn new(initial: Duration, max: Duration) -> Self {
        Self {
            initial,
            max: max.max(initial),
            failures: 0,
        }
    }

    /// Consecutive failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Delay before the next attempt, without jitter.
    pub fn base_delay(&self) -> Duration {
        let factor = 1u32 << self.failures.min(MAX_BACKOFF_EXPONENT);
        self.initial.saturating_mul(factor).min(self.max)
    }

    /// Record a failure and return how long to wait before retrying.
    pub fn next_delay(&mut self) -> Duration {
        let base = self.base_delay();
        self.failures = self.failures.saturating_add(1);
        let jitter_ms = (base.as_millis() / 10) as u64;
        let jitter = if jitter_ms > 0 {
            Duration::from_millis(rand::thread_rng().gen_range(0..jitter_ms))
        } else {
            Duration::ZERO
        };
        base + jitter
    }

    pub fn reset(&mut self) {
        self.failures = 0;
    }
}
