//! Adaptive retry policies
//!
//! Per-operation sliding windows of outcomes and latencies feed the
//! retry parameter derivation: operations that mostly succeed get few,
//! quick retries; flaky ones back off harder.

use std::collections::VecDeque;
use std::future::Future;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::error::{ConductorError, ErrorKind, Result};

const OUTCOME_WINDOW: usize = 100;
const LATENCY_WINDOW: usize = 50;
/// Error count in the window beyond which backoff is amplified
const ERROR_FREQUENCY_LIMIT: u32 = 10;

/// Concrete retry parameters for one attempt loop
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff_factor: f64,
    pub initial_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_factor: 2.0,
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(60),
        }
    }
}

#[derive(Default)]
struct OperationWindow {
    outcomes: VecDeque<bool>,
    latencies: VecDeque<f64>,
}

impl OperationWindow {
    fn success_rate(&self) -> f64 {
        if self.outcomes.is_empty() {
            return 0.5;
        }
        let successes = self.outcomes.iter().filter(|&&ok| ok).count();
        successes as f64 / self.outcomes.len() as f64
    }

    fn avg_latency(&self) -> f64 {
        if self.latencies.is_empty() {
            return 1.0;
        }
        self.latencies.iter().sum::<f64>() / self.latencies.len() as f64
    }
}

/// Sliding-window statistics backing retry parameter derivation
#[derive(Default)]
pub struct AdaptiveRetry {
    windows: DashMap<String, OperationWindow>,
    error_counts: DashMap<String, u32>,
}

impl AdaptiveRetry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome and latency of one attempt loop
    pub fn record_outcome(&self, operation: &str, success: bool, latency_secs: f64) {
        let mut window = self.windows.entry(operation.to_string()).or_default();
        if window.outcomes.len() >= OUTCOME_WINDOW {
            window.outcomes.pop_front();
        }
        window.outcomes.push_back(success);
        if window.latencies.len() >= LATENCY_WINDOW {
            window.latencies.pop_front();
        }
        window.latencies.push_back(latency_secs);
    }

    /// Count one error for the (operation, kind) pair
    pub fn record_error(&self, operation: &str, kind: ErrorKind) {
        let key = format!("{}:{}", operation, kind);
        *self.error_counts.entry(key).or_insert(0) += 1;
    }

    /// Derive retry parameters for an (operation, error-kind) pair
    pub fn policy_for(&self, operation: &str, kind: ErrorKind) -> RetryPolicy {
        let (success_rate, avg_latency) = self
            .windows
            .get(operation)
            .map(|w| (w.success_rate(), w.avg_latency()))
            .unwrap_or((0.5, 1.0));

        let (max_attempts, mut backoff_factor) = if success_rate > 0.9 {
            (2, 1.5)
        } else if success_rate > 0.7 {
            (3, 2.0)
        } else if success_rate > 0.5 {
            (5, 2.5)
        } else {
            (3, 3.0)
        };

        let initial_delay = Duration::from_secs_f64((avg_latency * 0.1).clamp(0.1, 5.0));
        let mut max_delay = Duration::from_secs_f64((avg_latency * 10.0).min(300.0));

        let error_count = self
            .error_counts
            .get(&format!("{}:{}", operation, kind))
            .map(|c| *c)
            .unwrap_or(0);
        if error_count > ERROR_FREQUENCY_LIMIT {
            backoff_factor *= 1.5;
            max_delay = Duration::from_secs_f64((max_delay.as_secs_f64() * 2.0).min(600.0));
        }

        RetryPolicy {
            max_attempts,
            backoff_factor,
            initial_delay,
            max_delay,
        }
    }

    /// Operations with recorded statistics
    pub fn tracked_operations(&self) -> usize {
        self.windows.len()
    }

    /// Total recorded outcome data points across all operations
    pub fn data_points(&self) -> usize {
        self.windows.iter().map(|w| w.outcomes.len()).sum()
    }
}

/// Run `f` under an adaptive retry loop.
///
/// Only errors whose kind is retryable are attempted again; validation
/// and configuration failures surface immediately. The final outcome is
/// recorded back into the statistics.
pub async fn retry_with<T, F, Fut>(
    stats: &AdaptiveRetry,
    operation: &str,
    mut f: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let started = Instant::now();
    // First and last attempts are logged under one correlation id so a
    // whole retry sequence can be traced.
    let correlation_id = uuid::Uuid::new_v4().to_string();
    let mut attempt = 0;
    let mut policy: Option<RetryPolicy> = None;
    let mut delay = Duration::ZERO;

    loop {
        attempt += 1;
        match f().await {
            Ok(value) => {
                stats.record_outcome(operation, true, started.elapsed().as_secs_f64());
                return Ok(value);
            }
            Err(error) => {
                stats.record_error(operation, error.kind());

                if attempt == 1 {
                    debug!(operation, correlation = %correlation_id, "first attempt failed: {}", error);
                }

                if !error.should_retry() {
                    stats.record_outcome(operation, false, started.elapsed().as_secs_f64());
                    return Err(error);
                }

                let policy = policy
                    .get_or_insert_with(|| stats.policy_for(operation, error.kind()))
                    .clone();
                if attempt >= policy.max_attempts {
                    stats.record_outcome(operation, false, started.elapsed().as_secs_f64());
                    warn!(operation, attempt, correlation = %correlation_id, "retries exhausted: {}", error);
                    return Err(error);
                }

                delay = if delay.is_zero() {
                    policy.initial_delay
                } else {
                    Duration::from_secs_f64(
                        (delay.as_secs_f64() * policy.backoff_factor)
                            .min(policy.max_delay.as_secs_f64()),
                    )
                };
                debug!(
                    operation,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    "retrying after error: {}",
                    error
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// Convenience for callers that want plain exhaustion semantics without
/// shared statistics.
pub async fn retry_policy<T, F, Fut>(policy: &RetryPolicy, operation: &str, mut f: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut delay = policy.initial_delay;
    let mut last_error: Option<ConductorError> = None;

    for attempt in 1..=policy.max_attempts {
        match f().await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt == policy.max_attempts {
                    return Err(error);
                }
                debug!(operation, attempt, "retrying: {}", error);
                last_error = Some(error);
                tokio::time::sleep(delay).await;
                delay = Duration::from_secs_f64(
                    (delay.as_secs_f64() * policy.backoff_factor)
                        .min(policy.max_delay.as_secs_f64()),
                );
            }
        }
    }

    Err(last_error.unwrap_or_else(|| ConductorError::task("unknown", "retry loop empty")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_policy_table_high_success() {
        let stats = AdaptiveRetry::new();
        for _ in 0..20 {
            stats.record_outcome("op", true, 1.0);
        }
        let policy = stats.policy_for("op", ErrorKind::Communication);
        assert_eq!(policy.max_attempts, 2);
        assert!((policy.backoff_factor - 1.5).abs() < f64::EPSILON);
    }

    #[test]
    fn test_policy_table_mid_success() {
        let stats = AdaptiveRetry::new();
        for i in 0..20 {
            stats.record_outcome("op", i % 5 != 0, 1.0); // 80%
        }
        let policy = stats.policy_for("op", ErrorKind::Communication);
        assert_eq!(policy.max_attempts, 3);
        assert!((policy.backoff_factor - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_policy_table_low_success() {
        let stats = AdaptiveRetry::new();
        for i in 0..20 {
            stats.record_outcome("op", i % 2 == 0, 1.0); // 50%
        }
        let policy = stats.policy_for("op", ErrorKind::Communication);
        assert_eq!(policy.max_attempts, 3);
        assert!((policy.backoff_factor - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_delay_clamps() {
        let stats = AdaptiveRetry::new();
        // Tiny latencies clamp the initial delay up to 100ms
        for _ in 0..10 {
            stats.record_outcome("fast", true, 0.001);
        }
        let policy = stats.policy_for("fast", ErrorKind::Communication);
        assert_eq!(policy.initial_delay, Duration::from_millis(100));

        // Huge latencies clamp the initial delay down to 5s
        for _ in 0..10 {
            stats.record_outcome("slow", true, 120.0);
        }
        let policy = stats.policy_for("slow", ErrorKind::Communication);
        assert_eq!(policy.initial_delay, Duration::from_secs(5));
        assert_eq!(policy.max_delay, Duration::from_secs(300));
    }

    #[test]
    fn test_frequent_errors_amplify_backoff() {
        let stats = AdaptiveRetry::new();
        for _ in 0..15 {
            stats.record_error("op", ErrorKind::Communication);
        }
        for _ in 0..10 {
            stats.record_outcome("op", true, 1.0);
        }
        let policy = stats.policy_for("op", ErrorKind::Communication);
        // 1.5 base for >0.9 success, amplified by 1.5
        assert!((policy.backoff_factor - 2.25).abs() < f64::EPSILON);
    }

    #[tokio::test]
    async fn test_retry_with_succeeds_after_failures() {
        let stats = AdaptiveRetry::new();
        // Seed high success so delays stay small
        for _ in 0..20 {
            stats.record_outcome("flaky", true, 0.001);
        }

        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);
        let result: Result<&str> = retry_with(&stats, "flaky", move || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ConductorError::communication("transient"))
                } else {
                    Ok("ok")
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), "ok");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_retry_with_gives_up_on_validation() {
        let stats = AdaptiveRetry::new();
        let attempts = Arc::new(AtomicU32::new(0));
        let attempts_clone = Arc::clone(&attempts);

        let result: Result<()> = retry_with(&stats, "validate", move || {
            let attempts = Arc::clone(&attempts_clone);
            async move {
                attempts.fetch_add(1, Ordering::SeqCst);
                Err(ConductorError::validation("never retried"))
            }
        })
        .await;

        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 1);
    }
}
