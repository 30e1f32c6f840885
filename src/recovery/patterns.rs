//! Error pattern recognition and incident aggregation
//!
//! A small table of built-in patterns matches failures by error kind
//! plus context thresholds. A match opens (or extends) an incident
//! scoped by (pattern, component); incidents close through explicit
//! resolution.

use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::error::{ErrorKind, ErrorSeverity};

/// How a matched error should be recovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    ImmediateRetry,
    ExponentialBackoff,
    CircuitBreaker,
    Fallback,
    Escalation,
    ManualIntervention,
}

/// Context thresholds a pattern can require
#[derive(Debug, Clone, Default)]
pub struct ErrorContext {
    pub component: String,
    pub operation: String,
    pub consecutive_failures: Option<u32>,
    pub timeout_secs: Option<f64>,
    pub memory_usage: Option<f64>,
    pub startup_phase: bool,
    pub correlation_id: Option<String>,
}

impl ErrorContext {
    pub fn new(component: impl Into<String>, operation: impl Into<String>) -> Self {
        Self {
            component: component.into(),
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn consecutive_failures(mut self, n: u32) -> Self {
        self.consecutive_failures = Some(n);
        self
    }

    pub fn memory_usage(mut self, fraction: f64) -> Self {
        self.memory_usage = Some(fraction);
        self
    }

    pub fn startup_phase(mut self) -> Self {
        self.startup_phase = true;
        self
    }

    pub fn correlation(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }
}

/// A matchable rule for error aggregation
#[derive(Debug, Clone)]
pub struct ErrorPattern {
    pub id: &'static str,
    pub kinds: &'static [ErrorKind],
    pub min_consecutive_failures: Option<u32>,
    pub min_timeout_secs: Option<f64>,
    pub min_memory_usage: Option<f64>,
    pub requires_startup_phase: bool,
    pub severity: ErrorSeverity,
    pub recovery: RecoveryStrategy,
    pub max_retries: u32,
    pub escalation_threshold: u32,
    pub cooldown_secs: f64,
}

impl ErrorPattern {
    /// Does this error, in this context, match the pattern?
    pub fn matches(&self, kind: ErrorKind, ctx: &ErrorContext) -> bool {
        if !self.kinds.contains(&kind) {
            return false;
        }
        if let Some(min) = self.min_consecutive_failures {
            if ctx.consecutive_failures.unwrap_or(0) < min {
                return false;
            }
        }
        if let Some(min) = self.min_timeout_secs {
            if ctx.timeout_secs.unwrap_or(0.0) < min {
                return false;
            }
        }
        if let Some(min) = self.min_memory_usage {
            if ctx.memory_usage.unwrap_or(0.0) < min {
                return false;
            }
        }
        if self.requires_startup_phase && !ctx.startup_phase {
            return false;
        }
        true
    }

    /// Recovery actions suggested for this pattern
    pub fn recovery_actions(&self) -> Vec<String> {
        let actions: &[&str] = match self.recovery {
            RecoveryStrategy::ImmediateRetry => {
                &["Immediate retry with current parameters", "Check for transient network issues"]
            }
            RecoveryStrategy::ExponentialBackoff => &[
                "Retry with exponential backoff",
                "Increase timeout values gradually",
                "Monitor resource availability",
            ],
            RecoveryStrategy::CircuitBreaker => &[
                "Activate circuit breaker",
                "Perform health check before retry",
            ],
            RecoveryStrategy::Fallback => {
                &["Switch to fallback mechanism", "Use cached or default responses"]
            }
            RecoveryStrategy::Escalation => {
                &["Escalate to operations", "Reject new admissions until resolved"]
            }
            RecoveryStrategy::ManualIntervention => {
                &["Manual intervention required", "Check system configuration"]
            }
        };
        actions.iter().map(|s| s.to_string()).collect()
    }
}

/// Built-in pattern table
pub fn built_in_patterns() -> Vec<ErrorPattern> {
    vec![
        ErrorPattern {
            id: "container_failure",
            kinds: &[ErrorKind::ContainerSetup, ErrorKind::ContainerExec],
            min_consecutive_failures: Some(3),
            min_timeout_secs: None,
            min_memory_usage: None,
            requires_startup_phase: false,
            severity: ErrorSeverity::High,
            recovery: RecoveryStrategy::ExponentialBackoff,
            max_retries: 5,
            escalation_threshold: 10,
            cooldown_secs: 300.0,
        },
        ErrorPattern {
            id: "communication_timeout",
            kinds: &[ErrorKind::Communication, ErrorKind::TaskTimeout],
            min_consecutive_failures: None,
            min_timeout_secs: Some(30.0),
            min_memory_usage: None,
            requires_startup_phase: false,
            severity: ErrorSeverity::Medium,
            recovery: RecoveryStrategy::ImmediateRetry,
            max_retries: 3,
            escalation_threshold: 5,
            cooldown_secs: 300.0,
        },
        ErrorPattern {
            id: "resource_exhaustion",
            kinds: &[ErrorKind::Resource],
            min_consecutive_failures: None,
            min_timeout_secs: None,
            min_memory_usage: Some(0.9),
            requires_startup_phase: false,
            severity: ErrorSeverity::Critical,
            recovery: RecoveryStrategy::Escalation,
            max_retries: 1,
            escalation_threshold: 2,
            cooldown_secs: 300.0,
        },
        ErrorPattern {
            id: "agent_startup_failure",
            kinds: &[ErrorKind::AgentStartup],
            min_consecutive_failures: None,
            min_timeout_secs: None,
            min_memory_usage: None,
            requires_startup_phase: true,
            severity: ErrorSeverity::High,
            recovery: RecoveryStrategy::CircuitBreaker,
            max_retries: 3,
            escalation_threshold: 5,
            cooldown_secs: 300.0,
        },
    ]
}

/// Live aggregation record for one (pattern, component)
#[derive(Debug, Clone, Serialize)]
pub struct ErrorIncident {
    pub incident_id: String,
    pub pattern_id: String,
    pub severity_label: String,
    pub components_affected: Vec<String>,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
    pub recovery_actions: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip)]
    severity: ErrorSeverity,
}

impl ErrorIncident {
    pub fn severity(&self) -> ErrorSeverity {
        self.severity
    }

    pub fn is_resolved(&self) -> bool {
        self.ended_at.is_some()
    }
}

/// Tracks active incidents keyed by (pattern, component)
#[derive(Default)]
pub struct IncidentTracker {
    active: DashMap<String, ErrorIncident>,
    recent_errors: AtomicU64,
}

impl IncidentTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn note_error(&self) {
        self.recent_errors.fetch_add(1, Ordering::SeqCst);
    }

    /// Open a new incident or extend an existing one with this
    /// component. Returns the incident id.
    pub fn open_or_extend(
        &self,
        pattern: &ErrorPattern,
        component: &str,
        recovery_actions: Vec<String>,
    ) -> String {
        let key = format!("{}:{}", pattern.id, component);

        let mut entry = self.active.entry(key).or_insert_with(|| {
            let incident = ErrorIncident {
                incident_id: Uuid::new_v4().to_string(),
                pattern_id: pattern.id.to_string(),
                severity_label: pattern.severity.to_string(),
                components_affected: Vec::new(),
                started_at: Utc::now(),
                ended_at: None,
                recovery_actions,
                resolution: None,
                severity: pattern.severity,
            };
            warn!(
                incident = %incident.incident_id,
                pattern = %pattern.id,
                "new incident opened"
            );
            incident
        });

        if !entry.components_affected.iter().any(|c| c == component) {
            entry.components_affected.push(component.to_string());
        }
        entry.incident_id.clone()
    }

    /// Resolve an incident by id, stamping its end time
    pub fn resolve(&self, incident_id: &str, resolution: impl Into<String>) -> bool {
        let key = self
            .active
            .iter()
            .find(|entry| entry.incident_id == incident_id)
            .map(|entry| entry.key().clone());

        match key {
            Some(key) => {
                if let Some((_, mut incident)) = self.active.remove(&key) {
                    incident.ended_at = Some(Utc::now());
                    incident.resolution = Some(resolution.into());
                    info!(incident = %incident_id, "incident resolved");
                }
                true
            }
            None => false,
        }
    }

    pub fn active(&self) -> Vec<ErrorIncident> {
        self.active.iter().map(|entry| entry.clone()).collect()
    }

    /// Aggregate health label: critical incidents dominate, then piles
    /// of high-severity ones, then raw error volume.
    pub fn health_status(&self, component: &str) -> serde_json::Value {
        let active = self.active();
        let critical = active
            .iter()
            .filter(|i| i.severity() == ErrorSeverity::Critical)
            .count();
        let high = active
            .iter()
            .filter(|i| i.severity() == ErrorSeverity::High)
            .count();
        let recent_errors = self.recent_errors.load(Ordering::SeqCst);

        let overall = if critical > 0 {
            "critical"
        } else if high > 2 {
            "degraded"
        } else if recent_errors > 50 {
            "warning"
        } else {
            "healthy"
        };

        serde_json::json!({
            "overall_status": overall,
            "active_incidents": active.len(),
            "critical_incidents": critical,
            "high_severity_incidents": high,
            "recent_errors": recent_errors,
            "component": component,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(id: &'static str) -> ErrorPattern {
        built_in_patterns()
            .into_iter()
            .find(|p| p.id == id)
            .unwrap()
    }

    #[test]
    fn test_container_failure_needs_three_consecutive() {
        let pattern = pattern("container_failure");
        let ctx = ErrorContext::new("agent_000", "setup").consecutive_failures(2);
        assert!(!pattern.matches(ErrorKind::ContainerSetup, &ctx));

        let ctx = ErrorContext::new("agent_000", "setup").consecutive_failures(3);
        assert!(pattern.matches(ErrorKind::ContainerSetup, &ctx));
        assert!(!pattern.matches(ErrorKind::Validation, &ctx));
    }

    #[test]
    fn test_resource_exhaustion_threshold() {
        let pattern = pattern("resource_exhaustion");
        let low = ErrorContext::new("orchestrator", "submit").memory_usage(0.5);
        assert!(!pattern.matches(ErrorKind::Resource, &low));

        let high = ErrorContext::new("orchestrator", "submit").memory_usage(0.92);
        assert!(pattern.matches(ErrorKind::Resource, &high));
        assert_eq!(pattern.recovery, RecoveryStrategy::Escalation);
    }

    #[test]
    fn test_startup_pattern_requires_phase() {
        let pattern = pattern("agent_startup_failure");
        let outside = ErrorContext::new("orchestrator", "restart");
        assert!(!pattern.matches(ErrorKind::AgentStartup, &outside));

        let during = ErrorContext::new("orchestrator", "start").startup_phase();
        assert!(pattern.matches(ErrorKind::AgentStartup, &during));
    }

    #[test]
    fn test_incident_extend_and_resolve() {
        let tracker = IncidentTracker::new();
        let pattern = pattern("container_failure");

        let id1 = tracker.open_or_extend(&pattern, "agent_000", pattern.recovery_actions());
        let id2 = tracker.open_or_extend(&pattern, "agent_000", pattern.recovery_actions());
        assert_eq!(id1, id2, "same scope reuses the incident");

        // A different component under the same pattern is its own scope
        let id3 = tracker.open_or_extend(&pattern, "agent_001", pattern.recovery_actions());
        assert_ne!(id1, id3);
        assert_eq!(tracker.active().len(), 2);

        assert!(tracker.resolve(&id1, "container runtime restarted"));
        assert_eq!(tracker.active().len(), 1);
        assert!(!tracker.resolve(&id1, "already gone"));
    }
}
