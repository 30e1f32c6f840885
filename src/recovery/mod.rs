//! Adaptive error recovery
//!
//! Every outward call in the orchestrator and coordinator passes through
//! this layer: adaptive retry policies derived from sliding outcome
//! windows, circuit breakers with half-open probing, and an error
//! pattern recognizer that aggregates matching failures into incidents.

pub mod breaker;
pub mod patterns;
pub mod retry;

use std::sync::Arc;

use tracing::{info, warn};

pub use breaker::{BreakerState, CircuitBreaker};
pub use patterns::{
    built_in_patterns, ErrorContext, ErrorIncident, ErrorPattern, IncidentTracker, RecoveryStrategy,
};
pub use retry::{AdaptiveRetry, RetryPolicy};

use crate::error::ConductorError;

/// Central error observer for one component. Records outcomes for the
/// adaptive retry statistics, matches failures against the built-in
/// pattern table, and maintains the live incident set.
pub struct ErrorMonitor {
    component: String,
    retry: Arc<AdaptiveRetry>,
    patterns: Vec<ErrorPattern>,
    incidents: IncidentTracker,
}

impl ErrorMonitor {
    pub fn new(component: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            retry: Arc::new(AdaptiveRetry::new()),
            patterns: built_in_patterns(),
            incidents: IncidentTracker::new(),
        }
    }

    pub fn retry(&self) -> Arc<AdaptiveRetry> {
        Arc::clone(&self.retry)
    }

    pub fn incidents(&self) -> &IncidentTracker {
        &self.incidents
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Record a failed operation: updates retry statistics, matches the
    /// pattern table, and opens or extends an incident on a match.
    /// Returns the matched pattern, if any.
    pub fn observe_error(
        &self,
        operation: &str,
        error: &ConductorError,
        ctx: &ErrorContext,
    ) -> Option<&ErrorPattern> {
        self.retry.record_error(operation, error.kind());
        self.incidents.note_error();

        let matched = self
            .patterns
            .iter()
            .find(|pattern| pattern.matches(error.kind(), ctx));

        if let Some(pattern) = matched {
            warn!(
                component = %self.component,
                operation = %operation,
                pattern = %pattern.id,
                severity = %pattern.severity,
                "error matched pattern"
            );
            let incident_id =
                self.incidents
                    .open_or_extend(pattern, &ctx.component, pattern.recovery_actions());
            info!(incident = %incident_id, "incident active");
        }

        matched
    }

    /// Record a successful operation outcome
    pub fn observe_success(&self, operation: &str, latency_secs: f64) {
        self.retry.record_outcome(operation, true, latency_secs);
    }

    /// True while a resource-exhaustion incident is open; the
    /// orchestrator rejects new admissions in that state.
    pub fn resource_incident_open(&self) -> bool {
        self.incidents
            .active()
            .iter()
            .any(|incident| incident.pattern_id == "resource_exhaustion")
    }

    /// Roll up incident and error-rate state into one health label
    pub fn health_status(&self) -> serde_json::Value {
        self.incidents.health_status(&self.component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ConductorError;

    #[test]
    fn test_resource_error_opens_incident_and_blocks_admissions() {
        let monitor = ErrorMonitor::new("orchestrator");
        let err = ConductorError::resource("out of memory");
        let ctx = ErrorContext::new("orchestrator", "submit").memory_usage(0.95);

        let matched = monitor.observe_error("submit", &err, &ctx);
        assert_eq!(matched.unwrap().id, "resource_exhaustion");
        assert!(monitor.resource_incident_open());
    }

    #[test]
    fn test_unmatched_error_opens_no_incident() {
        let monitor = ErrorMonitor::new("orchestrator");
        let err = ConductorError::validation("bad input");
        let ctx = ErrorContext::new("orchestrator", "submit");

        assert!(monitor.observe_error("submit", &err, &ctx).is_none());
        assert!(monitor.incidents().active().is_empty());
    }

    #[test]
    fn test_health_status_reflects_incidents() {
        let monitor = ErrorMonitor::new("orchestrator");
        let healthy = monitor.health_status();
        assert_eq!(healthy["overall_status"], "healthy");

        let err = ConductorError::resource("swap thrash");
        let ctx = ErrorContext::new("orchestrator", "submit").memory_usage(0.99);
        monitor.observe_error("submit", &err, &ctx);

        let degraded = monitor.health_status();
        assert_eq!(degraded["overall_status"], "critical");
    }
}
