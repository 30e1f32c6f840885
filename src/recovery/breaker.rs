//! Circuit breaker with half-open probing
//!
//! Closed until `failure_threshold` consecutive failures, then open:
//! calls fail fast with `service_unavailable`. After the cooldown the
//! breaker admits probes in half-open state; `success_threshold`
//! consecutive successes close it again, any failure reopens it. An
//! optional health probe can move an open breaker to half-open early.

use std::future::Future;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;
use tracing::{info, warn};

use crate::error::{ConductorError, Result};

/// Breaker states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    half_open_successes: u32,
    opened_at: Option<Instant>,
    last_health_check: Option<Instant>,
}

type HealthProbe = Arc<dyn Fn() -> bool + Send + Sync>;

/// Three-state gate in front of a fallible call
pub struct CircuitBreaker {
    name: String,
    failure_threshold: u32,
    success_threshold: u32,
    cooldown: Duration,
    health_check_interval: Duration,
    health_probe: Option<HealthProbe>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(
        name: impl Into<String>,
        failure_threshold: u32,
        success_threshold: u32,
        cooldown: Duration,
    ) -> Self {
        Self {
            name: name.into(),
            failure_threshold,
            success_threshold,
            cooldown,
            health_check_interval: Duration::from_secs(10),
            health_probe: None,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                half_open_successes: 0,
                opened_at: None,
                last_health_check: None,
            }),
        }
    }

    /// Attach a health probe that may preemptively move an open breaker
    /// to half-open when it reports true.
    pub fn with_health_probe<F>(mut self, probe: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.health_probe = Some(Arc::new(probe));
        self
    }

    pub async fn state(&self) -> BreakerState {
        self.inner.lock().await.state
    }

    /// Guard one call. In the open state no call is made; the returned
    /// error carries the breaker state and the time until the next
    /// probe window.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        {
            let mut inner = self.inner.lock().await;
            self.maybe_run_health_probe(&mut inner);

            if inner.state == BreakerState::Open {
                let elapsed = inner
                    .opened_at
                    .map(|at| at.elapsed())
                    .unwrap_or(Duration::ZERO);
                if elapsed >= self.cooldown {
                    info!(breaker = %self.name, "cooldown elapsed, probing half-open");
                    inner.state = BreakerState::HalfOpen;
                    inner.half_open_successes = 0;
                } else {
                    let retry_after = self.cooldown - elapsed;
                    return Err(ConductorError::service_unavailable(
                        self.name.clone(),
                        inner.state.to_string(),
                        retry_after,
                    ));
                }
            }
        }

        match f().await {
            Ok(value) => {
                self.on_success().await;
                Ok(value)
            }
            Err(error) => {
                self.on_failure().await;
                Err(error)
            }
        }
    }

    fn maybe_run_health_probe(&self, inner: &mut BreakerInner) {
        let Some(probe) = &self.health_probe else {
            return;
        };
        if inner.state != BreakerState::Open {
            return;
        }
        let due = inner
            .last_health_check
            .map(|at| at.elapsed() >= self.health_check_interval)
            .unwrap_or(true);
        if !due {
            return;
        }

        inner.last_health_check = Some(Instant::now());
        if probe() {
            info!(breaker = %self.name, "health probe passed, probing half-open");
            inner.state = BreakerState::HalfOpen;
            inner.half_open_successes = 0;
        }
    }

    async fn on_success(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                inner.half_open_successes += 1;
                if inner.half_open_successes >= self.success_threshold {
                    info!(breaker = %self.name, "closing after successful probes");
                    inner.state = BreakerState::Closed;
                    inner.consecutive_failures = 0;
                    inner.half_open_successes = 0;
                    inner.opened_at = None;
                }
            }
            _ => {
                inner.consecutive_failures = 0;
            }
        }
    }

    async fn on_failure(&self) {
        let mut inner = self.inner.lock().await;
        match inner.state {
            BreakerState::HalfOpen => {
                warn!(breaker = %self.name, "probe failed, reopening");
                inner.state = BreakerState::Open;
                inner.opened_at = Some(Instant::now());
                inner.half_open_successes = 0;
            }
            BreakerState::Closed => {
                inner.consecutive_failures += 1;
                if inner.consecutive_failures >= self.failure_threshold {
                    warn!(
                        breaker = %self.name,
                        failures = inner.consecutive_failures,
                        "failure threshold reached, opening"
                    );
                    inner.state = BreakerState::Open;
                    inner.opened_at = Some(Instant::now());
                }
            }
            BreakerState::Open => {}
        }
    }
}
