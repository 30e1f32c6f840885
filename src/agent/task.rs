use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{ConductorError, Result};

/// Kinds of tasks an agent knows how to execute
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Generic,
    CodeReview,
    Refactor,
    TestGeneration,
    Analysis,
    IsolatedExecution,
    Implementation,
    Migration,
    Optimization,
}

impl FromStr for TaskKind {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "generic" => Ok(TaskKind::Generic),
            "code_review" | "review" => Ok(TaskKind::CodeReview),
            "refactor" => Ok(TaskKind::Refactor),
            "test_generation" | "tests" => Ok(TaskKind::TestGeneration),
            "analysis" | "analyze" => Ok(TaskKind::Analysis),
            "isolated_execution" | "isolated" => Ok(TaskKind::IsolatedExecution),
            "implementation" | "implement" => Ok(TaskKind::Implementation),
            "migration" | "migrate" => Ok(TaskKind::Migration),
            "optimization" | "optimize" => Ok(TaskKind::Optimization),
            _ => Err(ConductorError::validation(format!("unknown task kind: {}", s))),
        }
    }
}

impl std::fmt::Display for TaskKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskKind::Generic => "generic",
            TaskKind::CodeReview => "code_review",
            TaskKind::Refactor => "refactor",
            TaskKind::TestGeneration => "test_generation",
            TaskKind::Analysis => "analysis",
            TaskKind::IsolatedExecution => "isolated_execution",
            TaskKind::Implementation => "implementation",
            TaskKind::Migration => "migration",
            TaskKind::Optimization => "optimization",
        };
        write!(f, "{}", name)
    }
}

/// A unit of work consumed exactly once by the orchestrator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique task identifier
    pub id: String,

    /// What to do
    pub kind: TaskKind,

    /// Task description; for generic tasks this is the worker command
    pub description: String,

    /// Input files, staged into the agent workspace before execution
    #[serde(default)]
    pub files: Vec<String>,

    /// Whether subtasks may run concurrently
    #[serde(default)]
    pub parallel: bool,

    /// Pre-split subtasks for parallel execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtasks: Option<Vec<Task>>,

    /// 0..=10, 10 is highest
    #[serde(default = "default_priority")]
    pub priority: u8,

    /// Per-task deadline in seconds
    #[serde(default = "default_timeout")]
    pub timeout_secs: f64,

    /// Named workspace environment for isolated execution
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,

    /// Commands for isolated execution, run in order
    #[serde(default)]
    pub commands: Vec<String>,
}

fn default_priority() -> u8 {
    5
}

fn default_timeout() -> f64 {
    300.0
}

impl Task {
    /// Create a task with generated id and default priority/timeout
    pub fn new(kind: TaskKind, description: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            kind,
            description: description.into(),
            files: Vec::new(),
            parallel: false,
            subtasks: None,
            priority: default_priority(),
            timeout_secs: default_timeout(),
            environment: None,
            commands: Vec::new(),
        }
    }

    pub fn builder(description: impl Into<String>) -> TaskBuilder {
        TaskBuilder {
            task: Task::new(TaskKind::Generic, description),
        }
    }

    /// Convenience constructor for review tasks
    pub fn code_review(id: impl Into<String>, files: Vec<String>) -> Self {
        let mut task = Task::new(TaskKind::CodeReview, "Review code for issues");
        task.id = id.into();
        task.files = files;
        task
    }

    /// Convenience constructor for analysis tasks
    pub fn analysis(id: impl Into<String>, description: impl Into<String>) -> Self {
        let mut task = Task::new(TaskKind::Analysis, description);
        task.id = id.into();
        task
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs_f64(self.timeout_secs.max(0.0))
    }

    /// Check the task invariants; invalid tasks are rejected before
    /// dispatch and never retried.
    pub fn validate(&self) -> Result<()> {
        if self.id.trim().is_empty() {
            return Err(ConductorError::task_validation("task id is required"));
        }
        if self.priority > 10 {
            return Err(ConductorError::task_validation(
                "task priority must be between 0 and 10",
            ));
        }
        if self.timeout_secs <= 0.0 {
            return Err(ConductorError::task_validation(
                "task timeout must be positive",
            ));
        }
        if self.parallel && self.subtasks.as_ref().map_or(true, |s| s.is_empty()) {
            return Err(ConductorError::task_validation(
                "parallel tasks require at least one subtask",
            ));
        }
        Ok(())
    }
}

/// Fluent builder for tasks
pub struct TaskBuilder {
    task: Task,
}

impl TaskBuilder {
    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.task.id = id.into();
        self
    }

    pub fn kind(mut self, kind: TaskKind) -> Self {
        self.task.kind = kind;
        self
    }

    pub fn files(mut self, files: Vec<String>) -> Self {
        self.task.files = files;
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.task.priority = priority;
        self
    }

    pub fn timeout_secs(mut self, secs: f64) -> Self {
        self.task.timeout_secs = secs;
        self
    }

    pub fn parallel(mut self, subtasks: Vec<Task>) -> Self {
        self.task.parallel = true;
        self.task.subtasks = Some(subtasks);
        self
    }

    pub fn environment(mut self, env: impl Into<String>) -> Self {
        self.task.environment = Some(env.into());
        self
    }

    pub fn commands(mut self, commands: Vec<String>) -> Self {
        self.task.commands = commands;
        self
    }

    pub fn build(self) -> Task {
        self.task
    }
}

/// Terminal status of a task
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Success,
    Failed,
    Timeout,
    Partial,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            TaskStatus::Success => "success",
            TaskStatus::Failed => "failed",
            TaskStatus::Timeout => "timeout",
            TaskStatus::Partial => "partial",
        };
        write!(f, "{}", name)
    }
}

/// Result of executing one task on one agent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent_id: String,
    pub status: TaskStatus,
    /// Structured payload produced by the kind handler
    pub result: serde_json::Value,
    /// Set iff status is not success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub execution_time: Duration,
    pub completed_at: DateTime<Utc>,
}

impl TaskResult {
    pub fn success(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        result: serde_json::Value,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Success,
            result,
            error: None,
            execution_time,
            completed_at: Utc::now(),
        }
    }

    pub fn failed(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        error: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Failed,
            result: serde_json::json!({}),
            error: Some(error.into()),
            execution_time,
            completed_at: Utc::now(),
        }
    }

    pub fn timeout(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Timeout,
            result: serde_json::json!({}),
            error: Some(format!("deadline exceeded after {:.1}s", execution_time.as_secs_f64())),
            execution_time,
            completed_at: Utc::now(),
        }
    }

    pub fn partial(
        task_id: impl Into<String>,
        agent_id: impl Into<String>,
        result: serde_json::Value,
        error: impl Into<String>,
        execution_time: Duration,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            agent_id: agent_id.into(),
            status: TaskStatus::Partial,
            result,
            error: Some(error.into()),
            execution_time,
            completed_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == TaskStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder() {
        let task = Task::builder("Refactor the parser")
            .id("t42")
            .kind(TaskKind::Refactor)
            .files(vec!["parser.py".to_string()])
            .priority(8)
            .timeout_secs(120.0)
            .build();

        assert_eq!(task.id, "t42");
        assert_eq!(task.kind, TaskKind::Refactor);
        assert_eq!(task.priority, 8);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_validation_rejects_bad_priority() {
        let mut task = Task::new(TaskKind::Generic, "do things");
        task.priority = 11;
        let err = task.validate().unwrap_err();
        assert!(matches!(err, ConductorError::TaskValidation { .. }));
    }

    #[test]
    fn test_validation_rejects_nonpositive_timeout() {
        let mut task = Task::new(TaskKind::Generic, "do things");
        task.timeout_secs = 0.0;
        assert!(task.validate().is_err());
        task.timeout_secs = -5.0;
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_id() {
        let mut task = Task::new(TaskKind::Generic, "do things");
        task.id = "  ".to_string();
        assert!(task.validate().is_err());
    }

    #[test]
    fn test_parallel_requires_subtasks() {
        let mut task = Task::new(TaskKind::Generic, "fan out");
        task.parallel = true;
        assert!(task.validate().is_err());

        task.subtasks = Some(vec![Task::new(TaskKind::Generic, "part 1")]);
        assert!(task.validate().is_ok());
    }

    #[test]
    fn test_result_error_invariant() {
        let ok = TaskResult::success("t1", "agent_000", serde_json::json!({}), Duration::ZERO);
        assert!(ok.error.is_none());

        let failed = TaskResult::failed("t1", "agent_000", "boom", Duration::ZERO);
        assert!(failed.error.is_some());
        assert!(!failed.is_success());
    }

    #[test]
    fn test_kind_parse() {
        assert_eq!("code_review".parse::<TaskKind>().unwrap(), TaskKind::CodeReview);
        assert_eq!("isolated".parse::<TaskKind>().unwrap(), TaskKind::IsolatedExecution);
        assert!("mystery".parse::<TaskKind>().is_err());
    }

    #[test]
    fn test_task_serde_round_trip() {
        let task = Task::code_review("t1", vec!["a.py".to_string()]);
        let json = serde_json::to_string(&task).unwrap();
        let parsed: Task = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, "t1");
        assert_eq!(parsed.kind, TaskKind::CodeReview);
        assert_eq!(parsed.files, vec!["a.py".to_string()]);
    }
}
