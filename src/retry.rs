use crate::config::RetryConfig;
use std::fmt::Display;
use std::time::Duration;
use tracing::warn;

/// Fixed-backoff retry for idempotent-enough operations such as single row
/// writes.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            backoff: Duration::from_millis(config.backoff_ms),
        }
    }
}

#[derive(Debug)]
pub struct RetryOutcome<T, E> {
    pub result: Result<T, E>,
    pub attempts: u32,
}

impl RetryPolicy {
    /// Runs `op` until it succeeds, returns a non-retryable error, or the
    /// attempt budget is spent.
    pub fn run<T, E, F, P>(&self, label: &str, mut op: F, is_retryable: P) -> RetryOutcome<T, E>
    where
        F: FnMut() -> Result<T, E>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op() {
                Ok(value) => {
                    return RetryOutcome {
                        result: Ok(value),
                        attempts: attempt,
                    };
                }
                Err(err) if attempt < max_attempts && is_retryable(&err) => {
                    warn!(
                        op = %label,
                        attempt,
                        max_attempts,
                        backoff_ms = self.backoff.as_millis() as u64,
                        error = %err,
                        "transient failure, retrying"
                    );
                    if !self.backoff.is_zero() {
                        std::thread::sleep(self.backoff);
                    }
                }
                Err(err) => {
                    return RetryOutcome {
                        result: Err(err),
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    fn instant() -> RetryPolicy {
        RetryPolicy {
            max_attempts: 3,
            backoff: Duration::ZERO,
        }
    }

    #[test]
    fn retries_transient_until_success() {
        let calls = Cell::new(0);
        let outcome = instant().run(
            "write",
            || {
                calls.set(calls.get() + 1);
                if calls.get() < 3 { Err(503) } else { Ok("ok") }
            },
            |status: &u16| *status >= 500,
        );
        assert_eq!(outcome.result, Ok("ok"));
        assert_eq!(outcome.attempts, 3);
    }

    #[test]
    fn permanent_error_is_not_retried() {
        let outcome: RetryOutcome<(), u16> =
            instant().run("write", || Err(400), |status: &u16| *status >= 500);
        assert_eq!(outcome.result, Err(400));
        assert_eq!(outcome.attempts, 1);
    }

    #[test]
    fn gives_up_after_budget() {
        let outcome: RetryOutcome<(), u16> =
            instant().run("write", || Err(503), |status: &u16| *status >= 500);
        assert_eq!(outcome.attempts, 3);
        assert!(outcome.result.is_err());
    }
}
