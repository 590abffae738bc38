//! Error policy: what to do when a step fails.
//!
//! Errors are sorted into four kinds. Transient errors are retried with
//! capped exponential backoff; permanent and anomalous errors quarantine the
//! unit; metadata-only errors (audit log, bookkeeping) are logged and
//! skipped. A transient error that survives every retry fails the repair for
//! the current cycle.

use crate::circuit_breaker::{CircuitBreaker, CircuitOpen};
use docflow_protocol::{ExceptionCategory, OperationKind, RetryConfig};
use docflow_worker::{CancellationToken, RepairError};
use std::time::Duration;
use tracing::{info, warn};

/// Blocking delay, injectable for tests.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Anomaly,
    /// Failure of bookkeeping that does not affect the unit's content.
    Metadata,
}

impl ErrorKind {
    pub fn of(error: &RepairError) -> Self {
        if error.is_anomaly() {
            ErrorKind::Anomaly
        } else if error.is_transient() {
            ErrorKind::Transient
        } else {
            ErrorKind::Permanent
        }
    }
}

/// Decision for one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    Retry { delay: Duration },
    Skip,
    Quarantine(ExceptionCategory),
    /// Retry budget spent; the repair failed for this cycle.
    Exhausted,
}

#[derive(Debug, Clone, Default)]
pub struct ErrorPolicy {
    retry: RetryConfig,
}

impl ErrorPolicy {
    pub fn new(retry: RetryConfig) -> Self {
        Self { retry }
    }

    pub fn max_attempts(&self) -> u32 {
        self.retry.max_attempts.max(1)
    }

    /// Delay before retry number `attempt` (1-based count of failures so far).
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(30) as i32;
        let millis = self.retry.initial_delay_ms as f64 * self.retry.multiplier.powi(exp);
        let capped = millis.min(self.retry.max_delay_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }

    /// Decide what happens after the `attempt`-th failure of `operation`.
    pub fn decide(&self, kind: ErrorKind, operation: Option<OperationKind>, attempt: u32) -> ErrorAction {
        match kind {
            ErrorKind::Metadata => ErrorAction::Skip,
            ErrorKind::Anomaly => ErrorAction::Quarantine(ExceptionCategory::Anomaly),
            ErrorKind::Permanent => ErrorAction::Quarantine(
                operation
                    .map(|op| op.failure_category())
                    .unwrap_or(ExceptionCategory::Anomaly),
            ),
            ErrorKind::Transient if attempt < self.max_attempts() => ErrorAction::Retry {
                delay: self.backoff(attempt),
            },
            ErrorKind::Transient => ErrorAction::Exhausted,
        }
    }

    /// Run `f` under the retry policy and the operation's breaker.
    ///
    /// `f` receives the 1-based attempt number. Only transient failures count
    /// against the breaker; a permanent error means the tool worked and the
    /// input is bad.
    pub fn execute<T>(
        &self,
        operation: OperationKind,
        breaker: &CircuitBreaker,
        sleeper: &dyn Sleeper,
        cancel: &CancellationToken,
        mut f: impl FnMut(u32) -> Result<T, RepairError>,
    ) -> Execution<T> {
        let mut attempt = 0;
        loop {
            if let Err(open) = breaker.check() {
                return Execution::CircuitOpen(open);
            }
            attempt += 1;
            let error = match f(attempt) {
                Ok(value) => {
                    breaker.record_success();
                    return Execution::Done { value, attempts: attempt };
                }
                Err(e) if e.is_cancelled() => return Execution::Cancelled,
                Err(e) => e,
            };

            let kind = ErrorKind::of(&error);
            if kind == ErrorKind::Transient {
                breaker.record_failure();
            } else {
                breaker.record_success();
            }

            match self.decide(kind, Some(operation), attempt) {
                ErrorAction::Retry { delay } => {
                    info!(
                        operation = %operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "Retrying with exponential backoff"
                    );
                    sleeper.sleep(delay);
                    if cancel.is_cancelled() {
                        return Execution::Cancelled;
                    }
                }
                action => {
                    warn!(operation = %operation, attempt, error = %error, ?action, "Repair failed");
                    return Execution::Failed {
                        error,
                        action,
                        attempts: attempt,
                    };
                }
            }
        }
    }
}

/// Result of [`ErrorPolicy::execute`].
#[derive(Debug)]
pub enum Execution<T> {
    Done { value: T, attempts: u32 },
    Failed {
        error: RepairError,
        action: ErrorAction,
        attempts: u32,
    },
    CircuitOpen(CircuitOpen),
    Cancelled,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{Clock, ManualClock};
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct RecordingSleeper {
        slept: Mutex<Vec<Duration>>,
    }

    impl Sleeper for RecordingSleeper {
        fn sleep(&self, duration: Duration) {
            self.slept.lock().unwrap().push(duration);
        }
    }

    fn policy() -> ErrorPolicy {
        ErrorPolicy::new(RetryConfig {
            max_attempts: 3,
            initial_delay_ms: 100,
            max_delay_ms: 300,
            multiplier: 2.0,
        })
    }

    fn breaker(threshold: u32) -> CircuitBreaker {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        CircuitBreaker::new(
            OperationKind::Convert,
            threshold,
            Duration::from_secs(60),
            clock,
        )
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy();
        assert_eq!(p.backoff(1), Duration::from_millis(100));
        assert_eq!(p.backoff(2), Duration::from_millis(200));
        assert_eq!(p.backoff(3), Duration::from_millis(300));
        assert_eq!(p.backoff(10), Duration::from_millis(300));
    }

    #[test]
    fn test_decide() {
        let p = policy();
        let op = Some(OperationKind::Extract);
        assert_eq!(p.decide(ErrorKind::Metadata, op, 1), ErrorAction::Skip);
        assert_eq!(
            p.decide(ErrorKind::Anomaly, op, 1),
            ErrorAction::Quarantine(ExceptionCategory::Anomaly)
        );
        assert_eq!(
            p.decide(ErrorKind::Permanent, op, 1),
            ErrorAction::Quarantine(ExceptionCategory::ExtractionFailed)
        );
        assert!(matches!(
            p.decide(ErrorKind::Transient, op, 2),
            ErrorAction::Retry { .. }
        ));
        assert_eq!(p.decide(ErrorKind::Transient, op, 3), ErrorAction::Exhausted);
    }

    #[test]
    fn test_execute_retries_then_succeeds() {
        let sleeper = RecordingSleeper::default();
        let b = breaker(10);
        let outcome = policy().execute(
            OperationKind::Convert,
            &b,
            &sleeper,
            &CancellationToken::new(),
            |attempt| {
                if attempt < 3 {
                    Err(RepairError::transient("busy"))
                } else {
                    Ok(attempt)
                }
            },
        );
        assert!(matches!(outcome, Execution::Done { value: 3, attempts: 3 }));
        assert_eq!(
            *sleeper.slept.lock().unwrap(),
            vec![Duration::from_millis(100), Duration::from_millis(200)]
        );
        assert_eq!(b.consecutive_failures(), 0);
    }

    #[test]
    fn test_execute_exhausts_budget() {
        let sleeper = RecordingSleeper::default();
        let b = breaker(10);
        let mut calls = 0;
        let outcome: Execution<()> = policy().execute(
            OperationKind::Convert,
            &b,
            &sleeper,
            &CancellationToken::new(),
            |_| {
                calls += 1;
                Err(RepairError::transient("crash"))
            },
        );
        assert_eq!(calls, 3);
        assert!(matches!(
            outcome,
            Execution::Failed {
                action: ErrorAction::Exhausted,
                attempts: 3,
                ..
            }
        ));
        assert_eq!(b.consecutive_failures(), 3);
    }

    #[test]
    fn test_execute_permanent_is_not_retried() {
        let b = breaker(1);
        let mut calls = 0;
        let outcome: Execution<()> = policy().execute(
            OperationKind::Convert,
            &b,
            &ThreadSleeper,
            &CancellationToken::new(),
            |_| {
                calls += 1;
                Err(RepairError::permanent("password protected"))
            },
        );
        assert_eq!(calls, 1);
        assert!(matches!(
            outcome,
            Execution::Failed {
                action: ErrorAction::Quarantine(ExceptionCategory::ConversionFailed),
                ..
            }
        ));
        // bad input is not a sick tool
        assert!(b.check().is_ok());
    }

    #[test]
    fn test_execute_stops_when_circuit_opens() {
        let sleeper = RecordingSleeper::default();
        let b = breaker(2);
        let mut calls = 0;
        let outcome: Execution<()> = policy().execute(
            OperationKind::Convert,
            &b,
            &sleeper,
            &CancellationToken::new(),
            |_| {
                calls += 1;
                Err(RepairError::transient("down"))
            },
        );
        assert_eq!(calls, 2);
        assert!(matches!(outcome, Execution::CircuitOpen(_)));
    }
}
