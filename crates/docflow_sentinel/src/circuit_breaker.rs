//! Per-operation circuit breakers.
//!
//! A breaker counts consecutive transient failures of one repair operation
//! across all units. At the threshold it opens and every call fails fast
//! until the cool-down has elapsed; then a single trial is let through.
//! A successful trial closes the breaker, a failed one re-opens it.

use docflow_protocol::{BreakerConfig, OperationKind};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{info, warn};

/// Monotonic time source, injectable for tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Clock that only moves when told to.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    offset: Mutex<Duration>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self {
            base: Instant::now(),
            offset: Mutex::new(Duration::ZERO),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(PoisonError::into_inner);
        *offset += by;
    }
}

impl Default for ManualClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Instant {
        self.base + *self.offset.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Calls refused because the operation's circuit is open.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("Service unavailable: {operation} circuit open, retry in {retry_in:?}")]
pub struct CircuitOpen {
    pub operation: OperationKind,
    pub retry_in: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

const CLOSED: u8 = 0;
const OPEN: u8 = 1;
const HALF_OPEN: u8 = 2;

/// Whether an admitted call is an ordinary one or the half-open trial.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Normal,
    Trial,
}

pub struct CircuitBreaker {
    operation: OperationKind,
    threshold: u32,
    cooldown: Duration,
    clock: Arc<dyn Clock>,
    origin: Instant,
    state: AtomicU8,
    consecutive_failures: AtomicU32,
    // milliseconds since `origin`
    opened_at_ms: AtomicU64,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("operation", &self.operation)
            .field("state", &self.state())
            .field("consecutive_failures", &self.consecutive_failures())
            .finish()
    }
}

impl CircuitBreaker {
    pub fn new(
        operation: OperationKind,
        threshold: u32,
        cooldown: Duration,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let origin = clock.now();
        Self {
            operation,
            threshold: threshold.max(1),
            cooldown,
            clock,
            origin,
            state: AtomicU8::new(CLOSED),
            consecutive_failures: AtomicU32::new(0),
            opened_at_ms: AtomicU64::new(0),
        }
    }

    fn now_ms(&self) -> u64 {
        self.clock
            .now()
            .saturating_duration_since(self.origin)
            .as_millis() as u64
    }

    pub fn operation(&self) -> OperationKind {
        self.operation
    }

    pub fn state(&self) -> BreakerState {
        match self.state.load(Ordering::SeqCst) {
            OPEN => BreakerState::Open,
            HALF_OPEN => BreakerState::HalfOpen,
            _ => BreakerState::Closed,
        }
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::SeqCst)
    }

    /// Ask to run the operation. Fails fast while open.
    pub fn check(&self) -> Result<Admission, CircuitOpen> {
        match self.state.load(Ordering::SeqCst) {
            CLOSED => Ok(Admission::Normal),
            OPEN => {
                let elapsed = Duration::from_millis(
                    self.now_ms()
                        .saturating_sub(self.opened_at_ms.load(Ordering::SeqCst)),
                );
                if elapsed < self.cooldown {
                    return Err(self.open_error(self.cooldown - elapsed));
                }
                // only one caller wins the trial
                match self
                    .state
                    .compare_exchange(OPEN, HALF_OPEN, Ordering::SeqCst, Ordering::SeqCst)
                {
                    Ok(_) => {
                        info!(operation = %self.operation, "Circuit half-open, letting one trial through");
                        Ok(Admission::Trial)
                    }
                    Err(_) => Err(self.open_error(Duration::ZERO)),
                }
            }
            _ => Err(self.open_error(Duration::ZERO)),
        }
    }

    fn open_error(&self, retry_in: Duration) -> CircuitOpen {
        CircuitOpen {
            operation: self.operation,
            retry_in,
        }
    }

    /// The operation worked (or failed for reasons unrelated to its health).
    pub fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::SeqCst);
        if self.state.swap(CLOSED, Ordering::SeqCst) != CLOSED {
            info!(operation = %self.operation, "Circuit closed");
        }
    }

    /// The operation failed in a way that may indicate it is unhealthy.
    pub fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::SeqCst) + 1;
        let from = match self.state.load(Ordering::SeqCst) {
            HALF_OPEN => HALF_OPEN,
            CLOSED if failures >= self.threshold => CLOSED,
            _ => return,
        };
        // the open timestamp must be visible before the state flips
        self.opened_at_ms.store(self.now_ms(), Ordering::SeqCst);
        let tripped = self
            .state
            .compare_exchange(from, OPEN, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if tripped {
            warn!(
                operation = %self.operation,
                consecutive_failures = failures,
                cooldown_secs = self.cooldown.as_secs(),
                "Circuit breaker tripped - operation paused"
            );
        }
    }
}

/// One breaker per repair operation.
#[derive(Debug)]
pub struct CircuitBreakers {
    breakers: [CircuitBreaker; 3],
}

impl CircuitBreakers {
    pub fn new(config: &BreakerConfig, clock: Arc<dyn Clock>) -> Self {
        let make = |op| {
            CircuitBreaker::new(
                op,
                config.failure_threshold,
                config.cooldown(),
                Arc::clone(&clock),
            )
        };
        Self {
            breakers: [
                make(OperationKind::Convert),
                make(OperationKind::Extract),
                make(OperationKind::Normalize),
            ],
        }
    }

    pub fn get(&self, op: OperationKind) -> &CircuitBreaker {
        match op {
            OperationKind::Convert => &self.breakers[0],
            OperationKind::Extract => &self.breakers[1],
            OperationKind::Normalize => &self.breakers[2],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker(clock: &Arc<ManualClock>) -> CircuitBreaker {
        let clock: Arc<dyn Clock> = Arc::clone(clock) as Arc<dyn Clock>;
        CircuitBreaker::new(OperationKind::Convert, 3, Duration::from_secs(60), clock)
    }

    #[test]
    fn test_opens_after_threshold() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        for _ in 0..3 {
            assert_eq!(b.check(), Ok(Admission::Normal));
            b.record_failure();
        }
        assert_eq!(b.state(), BreakerState::Open);
        let err = b.check().unwrap_err();
        assert_eq!(err.operation, OperationKind::Convert);
        assert!(err.to_string().contains("Service unavailable"));
    }

    #[test]
    fn test_success_resets_count() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        b.record_failure();
        b.record_failure();
        b.record_success();
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.consecutive_failures(), 1);
    }

    #[test]
    fn test_single_trial_after_cooldown() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(Duration::from_secs(30));
        assert!(b.check().is_err());

        clock.advance(Duration::from_secs(30));
        assert_eq!(b.check(), Ok(Admission::Trial));
        // trial still in flight: everyone else is refused
        assert!(b.check().is_err());

        b.record_success();
        assert_eq!(b.state(), BreakerState::Closed);
        assert_eq!(b.check(), Ok(Admission::Normal));
    }

    #[test]
    fn test_failed_trial_reopens() {
        let clock = Arc::new(ManualClock::new());
        let b = breaker(&clock);
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(Duration::from_secs(61));
        assert_eq!(b.check(), Ok(Admission::Trial));
        b.record_failure();
        assert_eq!(b.state(), BreakerState::Open);

        // cool-down restarts from the failed trial
        clock.advance(Duration::from_secs(10));
        assert!(b.check().is_err());
        clock.advance(Duration::from_secs(60));
        assert_eq!(b.check(), Ok(Admission::Trial));
    }

    #[test]
    fn test_concurrent_trial_is_exclusive() {
        let clock = Arc::new(ManualClock::new());
        let b = Arc::new(breaker(&clock));
        for _ in 0..3 {
            b.record_failure();
        }
        clock.advance(Duration::from_secs(61));

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let b = Arc::clone(&b);
                std::thread::spawn(move || b.check().is_ok())
            })
            .collect();
        let admitted = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(admitted, 1);
    }

    #[test]
    fn test_breakers_are_independent() {
        let clock: Arc<dyn Clock> = Arc::new(ManualClock::new());
        let breakers = CircuitBreakers::new(
            &BreakerConfig {
                failure_threshold: 1,
                cooldown_secs: 60,
            },
            clock,
        );
        breakers.get(OperationKind::Convert).record_failure();
        assert!(breakers.get(OperationKind::Convert).check().is_err());
        assert!(breakers.get(OperationKind::Extract).check().is_ok());
    }
}
