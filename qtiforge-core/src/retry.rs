//! Exponential backoff for the shared collaborators (storage, model).

use crate::config::RetryConfig;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub multiplier: f64,
    pub max_backoff: Duration,
}

/// Why a retried operation gave up.
#[derive(Debug)]
pub enum RetryFailure<E> {
    /// The error was not transient; no further attempts were made.
    Permanent(E),
    Exhausted { attempts: u32, last: E },
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            multiplier: config.multiplier.max(1.0),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// No waiting between attempts.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            initial_backoff: Duration::ZERO,
            multiplier: 1.0,
            max_backoff: Duration::ZERO,
        }
    }

    /// Delay after the `attempt`-th failure (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1) as i32);
        let millis = self.initial_backoff.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_backoff.as_millis() as f64) as u64)
    }

    pub fn run<T, E, F, P>(&self, what: &str, mut operation: F, is_transient: P) -> Result<T, RetryFailure<E>>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: std::fmt::Display,
    {
        let mut attempt = 1;
        loop {
            match operation() {
                Ok(value) => return Ok(value),
                Err(e) if !is_transient(&e) => return Err(RetryFailure::Permanent(e)),
                Err(e) if attempt >= self.max_attempts => {
                    log::error!("❌ {} failed after {} attempts: {}", what, attempt, e);
                    return Err(RetryFailure::Exhausted { attempts: attempt, last: e });
                }
                Err(e) => {
                    let delay = self.backoff_for(attempt);
                    log::warn!("🔁 {} attempt {} failed ({}), retrying in {:?}", what, attempt, e, delay);
                    if !delay.is_zero() {
                        std::thread::sleep(delay);
                    }
                    attempt += 1;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = RetryPolicy::from_config(&RetryConfig::default());
        assert_eq!(policy.backoff_for(1), Duration::from_millis(500));
        assert_eq!(policy.backoff_for(2), Duration::from_millis(1000));
        assert_eq!(policy.backoff_for(10), Duration::from_millis(8000));
    }

    #[test]
    fn transient_errors_are_retried_until_success() {
        let calls = Cell::new(0);
        let result: Result<u32, RetryFailure<String>> = RetryPolicy::immediate(3).run(
            "upload",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 {
                    Err("timeout".to_string())
                } else {
                    Ok(7)
                }
            },
            |_| true,
        );
        assert_eq!(result.ok(), Some(7));
        assert_eq!(calls.get(), 3);
    }

    #[test]
    fn permanent_errors_stop_immediately() {
        let calls = Cell::new(0);
        let result: Result<(), RetryFailure<String>> = RetryPolicy::immediate(5).run(
            "upload",
            || {
                calls.set(calls.get() + 1);
                Err("rejected".to_string())
            },
            |_| false,
        );
        assert!(matches!(result, Err(RetryFailure::Permanent(_))));
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn exhaustion_reports_attempts() {
        let result: Result<(), RetryFailure<String>> =
            RetryPolicy::immediate(3).run("upload", || Err("down".to_string()), |_| true);
        match result {
            Err(RetryFailure::Exhausted { attempts, last }) => {
                assert_eq!(attempts, 3);
                assert_eq!(last, "down");
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
