//! Circuit breaker guarding a server pool from cascading failures.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use crate::error::Error;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half-open"),
        }
    }
}

/// Raw counts exposed alongside a breaker's state for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BreakerCounts {
    pub requests: u64,
    pub failures: u64,
    pub consecutive_failures: u64,
}

/// The server pool's only contract with its breaker: wrap a fallible
/// operation so a tripped breaker can short-circuit it before it touches the
/// pool or the network.
pub trait Breaker: Send + Sync {
    fn execute<'a>(
        &'a self,
        op: BoxFuture<'a, Result<crate::codec::Response, Error>>,
    ) -> BoxFuture<'a, Result<crate::codec::Response, Error>>;

    fn state(&self) -> CircuitState;

    fn counts(&self) -> BreakerCounts;
}

/// Parameters for [`CircuitBreaker`].
#[derive(Clone, Copy, Debug)]
pub struct BreakerConfig {
    /// Minimum number of requests in the current window before the failure
    /// rate is even considered — avoids tripping on a handful of unlucky
    /// calls right after the breaker resets.
    pub minimum_requests: u64,
    /// Consecutive failures, independent of the rate, that always trip the
    /// breaker — catches a hard-down server faster than waiting for enough
    /// volume to compute a rate.
    pub failure_threshold: u64,
    /// Fraction of requests in the window that must fail for the breaker to
    /// trip once `minimum_requests` has been met.
    pub failure_rate: f64,
    /// How long the breaker stays open before allowing a half-open probe.
    pub open_duration: Duration,
    /// Concurrent probes allowed through while half-open.
    pub half_open_max_requests: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        BreakerConfig {
            minimum_requests: 3,
            failure_threshold: 3,
            failure_rate: 0.6,
            open_duration: Duration::from_secs(30),
            half_open_max_requests: 1,
        }
    }
}

struct Window {
    requests: u64,
    failures: u64,
    consecutive_failures: u64,
}

/// A closed / half-open / open state machine keyed on a sliding
/// request/failure count within the current window.
pub struct CircuitBreaker {
    config: BreakerConfig,
    state: Mutex<CircuitState>,
    window: Mutex<Window>,
    opened_at: Mutex<Option<Instant>>,
    half_open_inflight: AtomicUsize,
    requests_total: AtomicU64,
    failures_total: AtomicU64,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        CircuitBreaker {
            config,
            state: Mutex::new(CircuitState::Closed),
            window: Mutex::new(Window { requests: 0, failures: 0, consecutive_failures: 0 }),
            opened_at: Mutex::new(None),
            half_open_inflight: AtomicUsize::new(0),
            requests_total: AtomicU64::new(0),
            failures_total: AtomicU64::new(0),
        }
    }

    fn trip(&self) {
        let mut state = self.state.lock().unwrap();
        if *state != CircuitState::Open {
            *state = CircuitState::Open;
            *self.opened_at.lock().unwrap() = Some(Instant::now());
            tracing::warn!("circuit breaker tripped to open");
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap();
        *state = CircuitState::Closed;
        *self.opened_at.lock().unwrap() = None;
        let mut window = self.window.lock().unwrap();
        window.requests = 0;
        window.failures = 0;
        window.consecutive_failures = 0;
        tracing::warn!("circuit breaker reset to closed");
    }

    /// Whether to admit a call right now, transitioning `Open -> HalfOpen`
    /// once `open_duration` has elapsed. Returns whether the admitted call
    /// is a half-open probe, so the caller knows how to interpret its
    /// outcome in `record`.
    fn admit(&self) -> Result<bool, Error> {
        let mut state = self.state.lock().unwrap();
        match *state {
            CircuitState::Closed => Ok(false),
            CircuitState::HalfOpen => {
                let inflight = self.half_open_inflight.fetch_add(1, Ordering::SeqCst);
                if (inflight as u64) < self.config.half_open_max_requests {
                    Ok(true)
                } else {
                    self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
                    Err(Error::CircuitOpen)
                }
            }
            CircuitState::Open => {
                let elapsed = self
                    .opened_at
                    .lock()
                    .unwrap()
                    .map(|t| t.elapsed() >= self.config.open_duration)
                    .unwrap_or(false);
                if elapsed {
                    *state = CircuitState::HalfOpen;
                    drop(state);
                    tracing::warn!("circuit breaker probing half-open");
                    self.half_open_inflight.fetch_add(1, Ordering::SeqCst);
                    Ok(true)
                } else {
                    Err(Error::CircuitOpen)
                }
            }
        }
    }

    fn record(&self, was_half_open: bool, success: bool) {
        self.requests_total.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.failures_total.fetch_add(1, Ordering::Relaxed);
        }

        if was_half_open {
            self.half_open_inflight.fetch_sub(1, Ordering::SeqCst);
            if success {
                self.reset();
            } else {
                self.trip();
            }
            return;
        }

        let mut window = self.window.lock().unwrap();
        window.requests += 1;
        if success {
            window.consecutive_failures = 0;
        } else {
            window.failures += 1;
            window.consecutive_failures += 1;
        }

        let should_trip = window.consecutive_failures >= self.config.failure_threshold
            || (window.requests >= self.config.minimum_requests
                && (window.failures as f64) / (window.requests as f64) >= self.config.failure_rate);
        drop(window);

        if should_trip {
            self.trip();
        }
    }
}

impl Breaker for CircuitBreaker {
    fn execute<'a>(
        &'a self,
        op: BoxFuture<'a, Result<crate::codec::Response, Error>>,
    ) -> BoxFuture<'a, Result<crate::codec::Response, Error>> {
        Box::pin(async move {
            let was_half_open = match self.admit() {
                Ok(was_half_open) => was_half_open,
                Err(e) => return Err(e),
            };
            let result = op.await;
            // Server-status errors (miss, not-stored, ...) are healthy
            // responses from the breaker's point of view; only poisoning
            // errors and circuit/acquire failures count as breaker failures.
            let success = match &result {
                Ok(_) => true,
                Err(e) => !(e.poisons_connection() || matches!(e, Error::Acquire(_))),
            };
            self.record(was_half_open, success);
            result
        })
    }

    fn state(&self) -> CircuitState {
        *self.state.lock().unwrap()
    }

    fn counts(&self) -> BreakerCounts {
        let window = self.window.lock().unwrap();
        BreakerCounts {
            requests: self.requests_total.load(Ordering::Relaxed),
            failures: self.failures_total.load(Ordering::Relaxed),
            consecutive_failures: window.consecutive_failures,
        }
    }
}
