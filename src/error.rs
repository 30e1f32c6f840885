use std::time::Duration;

use thiserror::Error;

/// Main error type for conductor with structured error handling
///
/// Every fallible operation in the crate surfaces one of these variants,
/// with context and proper error chaining via `thiserror`. The variant
/// set mirrors the error taxonomy used across the orchestrator, agents,
/// and the recovery layer.
#[derive(Error, Debug)]
pub enum ConductorError {
    /// IO operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    SerdeJson(#[from] serde_json::Error),

    /// Request validation failed; never retried
    #[error("Validation error: {message}")]
    Validation { message: String },

    /// Configuration related error
    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Agent failed to start
    #[error("Agent startup error [{agent_id}]: {message}")]
    AgentStartup {
        agent_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Container creation or provisioning failed
    #[error("Container setup error [{container}]: {message}")]
    ContainerSetup {
        container: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Command execution inside a container failed
    #[error("Container exec error [{container}]: {message}")]
    ContainerExec {
        container: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Channel-level communication error
    #[error("Communication error: {message}")]
    Communication {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Messaging protocol violation
    #[error("Protocol error: {message}")]
    Protocol { message: String },

    /// Task execution error
    #[error("Task error [{task_id}]: {message}")]
    TaskExecution {
        task_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Task exceeded its deadline
    #[error("Task {task_id} timed out after {elapsed:?}")]
    TaskTimeout { task_id: String, elapsed: Duration },

    /// Task failed validation before dispatch
    #[error("Task validation error: {message}")]
    TaskValidation { message: String },

    /// Resource exhaustion (memory, CPU, disk, agents)
    #[error("Resource error: {message}")]
    Resource {
        message: String,
        resource_type: Option<String>,
    },

    /// Call rejected by an open circuit breaker or an active incident
    #[error("Service unavailable [{service}]: state={state}, retry in {retry_after:?}")]
    ServiceUnavailable {
        service: String,
        state: String,
        retry_after: Duration,
    },

    /// Workspace isolation error
    #[error("Workspace error [{agent_id}]: {message}")]
    Workspace {
        agent_id: String,
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },
}

/// Result type alias for conductor operations
pub type Result<T> = std::result::Result<T, ConductorError>;

/// Coarse classification of an error, used as the key for adaptive
/// retry statistics and error-pattern matching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Io,
    Serde,
    Validation,
    Configuration,
    AgentStartup,
    ContainerSetup,
    ContainerExec,
    Communication,
    Protocol,
    TaskExecution,
    TaskTimeout,
    TaskValidation,
    Resource,
    ServiceUnavailable,
    Workspace,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Io => "io",
            Self::Serde => "serde",
            Self::Validation => "validation",
            Self::Configuration => "configuration",
            Self::AgentStartup => "agent_startup",
            Self::ContainerSetup => "container_setup",
            Self::ContainerExec => "container_exec",
            Self::Communication => "communication",
            Self::Protocol => "protocol",
            Self::TaskExecution => "task_execution",
            Self::TaskTimeout => "task_timeout",
            Self::TaskValidation => "task_validation",
            Self::Resource => "resource",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Workspace => "workspace",
        };
        write!(f, "{}", name)
    }
}

/// Error severity levels for monitoring and incident aggregation
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ErrorSeverity {
    /// Informational - no action needed
    Info,
    /// Low severity - monitoring recommended
    Low,
    /// Medium severity - investigation needed
    Medium,
    /// High severity - immediate attention required
    High,
    /// Critical severity - system failure
    Critical,
}

impl std::fmt::Display for ErrorSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Low => write!(f, "LOW"),
            Self::Medium => write!(f, "MEDIUM"),
            Self::High => write!(f, "HIGH"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Convenience constructors for specific error kinds
impl ConductorError {
    pub fn validation<S: Into<String>>(message: S) -> Self {
        Self::Validation {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            source: None,
        }
    }

    pub fn agent_startup<I: Into<String>, S: Into<String>>(agent_id: I, message: S) -> Self {
        Self::AgentStartup {
            agent_id: agent_id.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn container_setup<I: Into<String>, S: Into<String>>(container: I, message: S) -> Self {
        Self::ContainerSetup {
            container: container.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn container_exec<I: Into<String>, S: Into<String>>(container: I, message: S) -> Self {
        Self::ContainerExec {
            container: container.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn communication<S: Into<String>>(message: S) -> Self {
        Self::Communication {
            message: message.into(),
            source: None,
        }
    }

    pub fn protocol<S: Into<String>>(message: S) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }

    pub fn task<I: Into<String>, S: Into<String>>(task_id: I, message: S) -> Self {
        Self::TaskExecution {
            task_id: task_id.into(),
            message: message.into(),
            source: None,
        }
    }

    pub fn task_timeout<I: Into<String>>(task_id: I, elapsed: Duration) -> Self {
        Self::TaskTimeout {
            task_id: task_id.into(),
            elapsed,
        }
    }

    pub fn task_validation<S: Into<String>>(message: S) -> Self {
        Self::TaskValidation {
            message: message.into(),
        }
    }

    pub fn resource<S: Into<String>>(message: S) -> Self {
        Self::Resource {
            message: message.into(),
            resource_type: None,
        }
    }

    pub fn resource_with_type<S: Into<String>, T: Into<String>>(
        message: S,
        resource_type: T,
    ) -> Self {
        Self::Resource {
            message: message.into(),
            resource_type: Some(resource_type.into()),
        }
    }

    pub fn service_unavailable<S: Into<String>, T: Into<String>>(
        service: S,
        state: T,
        retry_after: Duration,
    ) -> Self {
        Self::ServiceUnavailable {
            service: service.into(),
            state: state.into(),
            retry_after,
        }
    }

    pub fn workspace<I: Into<String>, S: Into<String>>(agent_id: I, message: S) -> Self {
        Self::Workspace {
            agent_id: agent_id.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Attach a source error to this error
    pub fn with_source<E>(mut self, source: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        match &mut self {
            Self::Configuration { source: s, .. }
            | Self::AgentStartup { source: s, .. }
            | Self::ContainerSetup { source: s, .. }
            | Self::ContainerExec { source: s, .. }
            | Self::Communication { source: s, .. }
            | Self::TaskExecution { source: s, .. }
            | Self::Workspace { source: s, .. } => {
                *s = Some(Box::new(source));
            }
            _ => {}
        }
        self
    }

    /// Classify this error for retry statistics and pattern matching
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(_) => ErrorKind::Io,
            Self::SerdeJson(_) => ErrorKind::Serde,
            Self::Validation { .. } => ErrorKind::Validation,
            Self::Configuration { .. } => ErrorKind::Configuration,
            Self::AgentStartup { .. } => ErrorKind::AgentStartup,
            Self::ContainerSetup { .. } => ErrorKind::ContainerSetup,
            Self::ContainerExec { .. } => ErrorKind::ContainerExec,
            Self::Communication { .. } => ErrorKind::Communication,
            Self::Protocol { .. } => ErrorKind::Protocol,
            Self::TaskExecution { .. } => ErrorKind::TaskExecution,
            Self::TaskTimeout { .. } => ErrorKind::TaskTimeout,
            Self::TaskValidation { .. } => ErrorKind::TaskValidation,
            Self::Resource { .. } => ErrorKind::Resource,
            Self::ServiceUnavailable { .. } => ErrorKind::ServiceUnavailable,
            Self::Workspace { .. } => ErrorKind::Workspace,
        }
    }

    /// Check if this is a recoverable error
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Communication { .. }
                | Self::ContainerExec { .. }
                | Self::TaskExecution { .. }
                | Self::TaskTimeout { .. }
                | Self::Resource { .. }
        )
    }

    /// Check if this error should be retried by the adaptive layer
    pub fn should_retry(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::Communication { .. }
                | Self::ContainerExec { .. }
                | Self::Resource { .. }
        )
    }

    /// Get error severity level
    pub fn severity(&self) -> ErrorSeverity {
        match self {
            Self::Configuration { .. } | Self::Resource { .. } => ErrorSeverity::Critical,
            Self::AgentStartup { .. }
            | Self::ContainerSetup { .. }
            | Self::Workspace { .. }
            | Self::ServiceUnavailable { .. } => ErrorSeverity::High,
            Self::TaskExecution { .. }
            | Self::TaskTimeout { .. }
            | Self::ContainerExec { .. }
            | Self::Communication { .. }
            | Self::Protocol { .. } => ErrorSeverity::Medium,
            Self::Io(_) | Self::SerdeJson(_) => ErrorSeverity::Medium,
            Self::Validation { .. } | Self::TaskValidation { .. } => ErrorSeverity::Info,
        }
    }
}

impl From<String> for ConductorError {
    fn from(message: String) -> Self {
        Self::TaskExecution {
            task_id: "unknown".to_string(),
            message,
            source: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_names() {
        let err = ConductorError::validation("bad priority");
        assert_eq!(err.kind().to_string(), "validation");

        let err = ConductorError::service_unavailable("agents", "open", Duration::from_secs(30));
        assert_eq!(err.kind().to_string(), "service_unavailable");
    }

    #[test]
    fn test_validation_never_retried() {
        let err = ConductorError::task_validation("priority out of range");
        assert!(!err.should_retry());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_communication_retryable() {
        let err = ConductorError::communication("socket closed");
        assert!(err.should_retry());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_severity_ordering() {
        assert!(ErrorSeverity::Critical > ErrorSeverity::High);
        assert!(ErrorSeverity::High > ErrorSeverity::Info);
        assert_eq!(
            ConductorError::config("missing field").severity(),
            ErrorSeverity::Critical
        );
    }
}
