use std::sync::Mutex;
use std::time::{Duration, Instant};

use crate::error::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct Inner {
    state: State,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
}

/// Failure-counting circuit breaker guarding a remote capability.
///
/// Closed until `failure_threshold` consecutive failures, then open for
/// `cooldown`; the first call after the cooldown probes half-open and either
/// closes the circuit or re-opens it.
#[derive(Debug)]
pub struct CircuitBreaker {
    name: &'static str,
    failure_threshold: u32,
    cooldown: Duration,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, failure_threshold: u32, cooldown: Duration) -> Self {
        Self {
            name,
            failure_threshold,
            cooldown,
            inner: Mutex::new(Inner {
                state: State::Closed,
                consecutive_failures: 0,
                opened_at: None,
            }),
        }
    }

    /// Gate a call. Errors with `Unavailable` while the circuit is open.
    pub fn check(&self) -> Result<(), AppError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        match inner.state {
            State::Closed | State::HalfOpen => Ok(()),
            State::Open => {
                let elapsed = inner.opened_at.map(|at| at.elapsed()).unwrap_or_default();
                if elapsed >= self.cooldown {
                    inner.state = State::HalfOpen;
                    tracing::debug!(circuit = self.name, "circuit half-open; allowing probe");
                    Ok(())
                } else {
                    Err(AppError::Unavailable(format!(
                        "{}_unavailable",
                        self.name
                    )))
                }
            }
        }
    }

    pub fn on_success(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state = State::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
    }

    pub fn on_failure(&self) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        if matches!(inner.state, State::HalfOpen)
            || inner.consecutive_failures >= self.failure_threshold
        {
            if inner.state != State::Open {
                tracing::warn!(
                    circuit = self.name,
                    failures = inner.consecutive_failures,
                    "circuit opened"
                );
            }
            inner.state = State::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    pub fn is_open(&self) -> bool {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.state == State::Open
    }
}
