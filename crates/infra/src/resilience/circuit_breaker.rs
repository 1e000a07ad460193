//! # Circuit Breaker
//!
//! Guards calls to one unreliable remote dependency.
//!
//! ## States
//! - **Closed**: calls pass through; each failure increments the failure count.
//! - **Open**: tripped after `max_failures` consecutive failures; calls are
//!   rejected until `open_timeout` has elapsed.
//! - **HalfOpen**: the first check after the timeout admits exactly one probe.
//!   Every other check is rejected (not queued) until the probe resolves.
//!
//! Every check and every notification holds the internal mutex for the whole
//! read-modify-write. The check and the later notification are two separate
//! critical sections; the remote call itself runs outside the lock.
//!
//! Each state change starts a new generation. A [`Permit`] remembers the
//! generation it was issued in, and its result is dropped if the breaker has
//! moved on since: a slow call admitted while closed cannot decide the fate
//! of a later probe.
//!
//! ```ignore
//! let permit = breaker.check_before_call()?;
//! match call_remote().await {
//!     Ok(v) => { permit.success(); Ok(v) }
//!     Err(e) => { permit.failure(); Err(e) }
//! }
//! ```

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Default consecutive failures before tripping.
pub const DEFAULT_MAX_FAILURES: u32 = 5;

/// Default time spent open before a probe is admitted.
pub const DEFAULT_OPEN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

/// Returned when the breaker refuses a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpenError;

/// Point-in-time view of a breaker, for health checks and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CircuitSnapshot {
    pub state: CircuitState,
    pub failure_count: u32,
}

#[derive(Debug)]
struct Inner {
    state: CircuitState,
    failure_count: u32,
    opened_at: Option<Instant>,
    generation: u64,
}

impl Inner {
    fn transition(&mut self, to: CircuitState) {
        self.state = to;
        self.generation += 1;
    }
}

#[derive(Debug)]
pub struct CircuitBreaker {
    inner: Mutex<Inner>,
    max_failures: u32,
    open_timeout: Duration,
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_FAILURES, DEFAULT_OPEN_TIMEOUT)
    }
}

impl CircuitBreaker {
    /// `max_failures` is clamped to at least one.
    pub fn new(max_failures: u32, open_timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: CircuitState::Closed,
                failure_count: 0,
                opened_at: None,
                generation: 0,
            }),
            max_failures: max_failures.max(1),
            open_timeout,
        }
    }

    // A panic while holding the lock cannot leave `Inner` half-updated (every
    // transition is a handful of plain assignments), so poisoning is ignored.
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Ask for permission to make one call.
    pub fn check_before_call(&self) -> Result<Permit<'_>, CircuitOpenError> {
        let mut inner = self.lock();

        match inner.state {
            CircuitState::Closed => Ok(Permit::new(self, false, inner.generation)),
            CircuitState::Open => {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::MAX);
                if elapsed > self.open_timeout {
                    warn!("circuit breaker: open -> half_open");
                    inner.transition(CircuitState::HalfOpen);
                    Ok(Permit::new(self, true, inner.generation))
                } else {
                    Err(CircuitOpenError)
                }
            }
            // A probe is already in flight.
            CircuitState::HalfOpen => Err(CircuitOpenError),
        }
    }

    /// Record a successful call.
    pub fn on_success(&self) {
        self.record_success(None);
    }

    /// Record a failed call.
    pub fn on_failure(&self) {
        self.record_failure(None);
    }

    fn is_stale(inner: &Inner, issued: Option<u64>) -> bool {
        let stale = issued.is_some_and(|generation| generation != inner.generation);
        if stale {
            debug!(state = ?inner.state, "circuit breaker: ignoring result from an earlier state");
        }
        stale
    }

    fn record_success(&self, issued: Option<u64>) {
        let mut inner = self.lock();
        if Self::is_stale(&inner, issued) {
            return;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                info!("circuit breaker: half_open -> closed");
                inner.transition(CircuitState::Closed);
                inner.failure_count = 0;
                inner.opened_at = None;
            }
            CircuitState::Closed => inner.failure_count = 0,
            // Late result from a call admitted before the breaker tripped.
            CircuitState::Open => {}
        }
    }

    fn record_failure(&self, issued: Option<u64>) {
        let mut inner = self.lock();
        if Self::is_stale(&inner, issued) {
            return;
        }

        match inner.state {
            CircuitState::HalfOpen => {
                warn!("circuit breaker: half_open -> open (probe failed)");
                inner.transition(CircuitState::Open);
                inner.opened_at = Some(Instant::now());
            }
            CircuitState::Closed => {
                inner.failure_count += 1;
                warn!(count = inner.failure_count, "circuit breaker: failure recorded");
                if inner.failure_count >= self.max_failures {
                    warn!(
                        count = inner.failure_count,
                        "circuit breaker: closed -> open (threshold reached)"
                    );
                    inner.transition(CircuitState::Open);
                    inner.opened_at = Some(Instant::now());
                }
            }
            CircuitState::Open => {}
        }
    }

    /// An abandoned probe returns the breaker to `Open` with its original
    /// `opened_at`, so the next check may admit a new probe right away.
    fn release_probe(&self, issued: u64) {
        let mut inner = self.lock();
        if inner.state == CircuitState::HalfOpen && inner.generation == issued {
            info!("circuit breaker: probe abandoned, half_open -> open");
            inner.transition(CircuitState::Open);
        }
    }

    pub fn snapshot(&self) -> CircuitSnapshot {
        let inner = self.lock();
        CircuitSnapshot {
            state: inner.state,
            failure_count: inner.failure_count,
        }
    }

    pub fn state(&self) -> CircuitState {
        self.snapshot().state
    }

    pub fn failure_count(&self) -> u32 {
        self.snapshot().failure_count
    }
}

/// Permission to make one call, granted by [`CircuitBreaker::check_before_call`].
///
/// Resolve it with [`Permit::success`] or [`Permit::failure`]. Dropping an
/// unresolved permit records nothing, except that an unresolved probe
/// re-opens the breaker.
#[must_use = "resolve the permit with success() or failure()"]
#[derive(Debug)]
pub struct Permit<'a> {
    breaker: &'a CircuitBreaker,
    probe: bool,
    generation: u64,
    resolved: bool,
}

impl<'a> Permit<'a> {
    fn new(breaker: &'a CircuitBreaker, probe: bool, generation: u64) -> Self {
        Self {
            breaker,
            probe,
            generation,
            resolved: false,
        }
    }

    /// True if this permit is the single half-open probe.
    pub fn is_probe(&self) -> bool {
        self.probe
    }

    pub fn success(mut self) {
        self.resolved = true;
        self.breaker.record_success(Some(self.generation));
    }

    pub fn failure(mut self) {
        self.resolved = true;
        self.breaker.record_failure(Some(self.generation));
    }
}

impl Drop for Permit<'_> {
    fn drop(&mut self) {
        if self.probe && !self.resolved {
            self.breaker.release_probe(self.generation);
        }
    }
}
