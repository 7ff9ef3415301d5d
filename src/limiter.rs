//! Fixed-frequency pacing for tight collection loops.

use std::time::{Duration, Instant};

use crate::cancel::CancellationToken;
use crate::error::{ConfigError, ensure_positive};

/// Paces a loop to at most `rate_limit_per_second` iterations per second.
///
/// Each sleep covers the remainder of one period measured from the end of
/// the previous sleep. No drift correction: a slow iteration simply sleeps
/// less (or not at all) on its next call.
#[derive(Debug, Clone)]
pub struct ConstantRateLimiter {
    period: Duration,
    last_event: Option<Instant>,
}

impl ConstantRateLimiter {
    /// Creates a limiter. Fails on a non-positive or non-finite rate.
    pub fn new(rate_limit_per_second: f64) -> Result<Self, ConfigError> {
        let rate = ensure_positive("rate_limit_per_second", rate_limit_per_second)?;
        Ok(Self {
            period: Duration::from_secs_f64(1.0 / rate),
            last_event: None,
        })
    }

    /// Length of one period.
    pub fn period(&self) -> Duration {
        self.period
    }

    /// Blocks for the rest of the current period, then starts a new one.
    pub fn sleep(&mut self) {
        if let Some(remaining) = self.remaining(Instant::now()) {
            std::thread::sleep(remaining);
        }
        self.last_event = Some(Instant::now());
    }

    /// Like [`sleep`](Self::sleep) but wakes as soon as `token` is cancelled.
    ///
    /// Returns `true` if the wait ended because of cancellation.
    pub fn sleep_or_cancel(&mut self, token: &CancellationToken) -> bool {
        let cancelled = match self.remaining(Instant::now()) {
            Some(remaining) => token.wait_timeout(remaining),
            None => token.is_cancelled(),
        };
        self.last_event = Some(Instant::now());
        cancelled
    }

    /// Non-blocking gate: true if a full period has passed since the last
    /// recorded event (or none was recorded yet).
    pub fn shall_execute(&self) -> bool {
        self.remaining(Instant::now()).is_none()
    }

    /// Records "now" as the start of the current period.
    pub fn update_last_time(&mut self) {
        self.last_event = Some(Instant::now());
    }

    fn remaining(&self, now: Instant) -> Option<Duration> {
        let last = self.last_event?;
        let elapsed = now.saturating_duration_since(last);
        (elapsed < self.period).then(|| self.period - elapsed)
    }
}
