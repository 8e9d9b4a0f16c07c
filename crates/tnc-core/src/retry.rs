//! Bounded retry with a fixed inter-attempt delay.
//!
//! The link is short and low-jitter, so there is no backoff: every retry in
//! the crate (block writes, bootloader identification, confirmed settings)
//! goes through [`RetryPolicy::run`].

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Attempts, per-attempt timeout and fixed delay for one retried operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Zero behaves as one.
    pub max_attempts: u32,
    /// How long a single attempt may wait for its reply.
    pub timeout_ms: u64,
    /// Pause between a failed attempt and the next.
    pub delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(5, 500, 0)
    }
}

impl RetryPolicy {
    pub const fn new(max_attempts: u32, timeout_ms: u64, delay_ms: u64) -> Self {
        Self {
            max_attempts,
            timeout_ms,
            delay_ms,
        }
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn delay(&self) -> Duration {
        Duration::from_millis(self.delay_ms)
    }

    /// Run `attempt` until it succeeds or the budget is spent.
    ///
    /// The closure receives the zero-based attempt number. The error from
    /// the final attempt is returned.
    pub fn run<T, E, F>(&self, operation: &str, mut attempt: F) -> Result<T, E>
    where
        E: std::fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.max_attempts.max(1);
        let mut n = 0;
        loop {
            match attempt(n) {
                Ok(value) => return Ok(value),
                Err(e) if n + 1 < attempts => {
                    debug!(
                        operation,
                        attempt = n + 1,
                        of = attempts,
                        error = %e,
                        "Retrying"
                    );
                    if self.delay_ms > 0 {
                        thread::sleep(self.delay());
                    }
                    n += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_succeeds_after_failures() {
        let policy = RetryPolicy::new(5, 10, 0);
        let mut calls = 0;
        let result: Result<u32, String> = policy.run("op", |n| {
            calls += 1;
            if n < 2 { Err(format!("fail {n}")) } else { Ok(n) }
        });
        assert_eq!(result, Ok(2));
        assert_eq!(calls, 3);
    }

    #[test]
    fn test_surfaces_last_error() {
        let policy = RetryPolicy::new(3, 10, 0);
        let result: Result<(), String> = policy.run("op", |n| Err(format!("fail {n}")));
        assert_eq!(result, Err("fail 2".to_string()));
    }

    #[test]
    fn test_zero_attempts_runs_once() {
        let policy = RetryPolicy::new(0, 10, 0);
        let mut calls = 0;
        let _: Result<(), &str> = policy.run("op", |_| {
            calls += 1;
            Err("no")
        });
        assert_eq!(calls, 1);
    }
}
