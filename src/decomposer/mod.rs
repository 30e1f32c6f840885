//! Task decomposition
//!
//! Scores a task's complexity from weighted factors, then emits a typed
//! subtask DAG per task kind. Dependencies are indices into the emitted
//! list and always point at earlier entries, so the graph is acyclic by
//! construction.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::debug;

use crate::agent::{Task, TaskKind};

/// Complexity buckets derived from the overall score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskComplexity {
    Simple,
    Moderate,
    Complex,
    VeryComplex,
}

/// Result of scoring one task
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplexityAnalysis {
    pub complexity: TaskComplexity,
    /// Weighted overall score in [0, 1]
    pub score: f64,
    /// Per-factor scores, each normalized to [0, 1]
    pub factors: HashMap<String, f64>,
    pub suggested_agents: usize,
    pub parallel_potential: f64,
}

/// One emitted subtask
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskDefinition {
    pub kind: TaskKind,
    pub description: String,
    /// Indices of subtasks that must complete first
    #[serde(default)]
    pub dependencies: Vec<usize>,
    pub estimated_time: f64,
    pub priority: u8,
    #[serde(default)]
    pub required_skills: Vec<String>,
}

impl SubtaskDefinition {
    fn new(kind: TaskKind, description: &str, estimated_time: f64, priority: u8) -> Self {
        Self {
            kind,
            description: description.to_string(),
            dependencies: Vec::new(),
            estimated_time,
            priority,
            required_skills: Vec::new(),
        }
    }

    fn depends_on(mut self, deps: &[usize]) -> Self {
        self.dependencies = deps.to_vec();
        self
    }

    fn skills(mut self, skills: &[&str]) -> Self {
        self.required_skills = skills.iter().map(|s| s.to_string()).collect();
        self
    }
}

const KEYWORDS_SIMPLE: &[&str] = &["single", "basic", "simple", "check", "get", "list"];
const KEYWORDS_MODERATE: &[&str] = &["analyze", "review", "update", "modify", "integrate"];
const KEYWORDS_COMPLEX: &[&str] = &["refactor", "migrate", "implement", "design", "optimize"];
const KEYWORDS_VERY_COMPLEX: &[&str] = &["rewrite", "architect", "overhaul", "redesign", "scale"];

const PARALLEL_KEYWORDS: &[&str] = &["each", "all", "multiple", "every", "separate"];
const SEQUENTIAL_KEYWORDS: &[&str] = &["then", "after", "before", "step by step", "sequentially"];

/// Scores tasks and splits them into dependent subtasks
#[derive(Debug, Default)]
pub struct TaskDecomposer;

impl TaskDecomposer {
    pub fn new() -> Self {
        Self
    }

    /// Compute the weighted complexity analysis for a task
    pub fn analyze(&self, task: &Task) -> ComplexityAnalysis {
        let mut factors = HashMap::new();

        let word_count = task.description.split_whitespace().count() as f64;
        factors.insert("description_length".to_string(), (word_count / 50.0).min(1.0));

        let file_count = task.files.len() as f64;
        factors.insert("file_count".to_string(), (file_count / 10.0).min(1.0));

        factors.insert(
            "keyword_complexity".to_string(),
            keyword_score(&task.description),
        );

        factors.insert("task_kind".to_string(), kind_base_score(task.kind));

        let parallel_potential = parallel_potential(task);
        factors.insert("parallel_potential".to_string(), parallel_potential);

        let score = factors["description_length"] * 0.15
            + factors["file_count"] * 0.25
            + factors["keyword_complexity"] * 0.25
            + factors["task_kind"] * 0.25
            + factors["parallel_potential"] * 0.10;

        let (complexity, suggested_agents) = if score < 0.3 {
            (TaskComplexity::Simple, 1)
        } else if score < 0.5 {
            (TaskComplexity::Moderate, 2)
        } else if score < 0.7 {
            (TaskComplexity::Complex, 3)
        } else {
            (TaskComplexity::VeryComplex, 5)
        };

        debug!(task = %task.id, score, ?complexity, "complexity analyzed");

        ComplexityAnalysis {
            complexity,
            score,
            factors,
            suggested_agents,
            parallel_potential,
        }
    }

    /// Split a task into subtasks. Simple tasks return an empty list.
    pub fn decompose(&self, task: &Task, analysis: Option<&ComplexityAnalysis>) -> Vec<SubtaskDefinition> {
        let owned;
        let analysis = match analysis {
            Some(analysis) => analysis,
            None => {
                owned = self.analyze(task);
                &owned
            }
        };

        if analysis.complexity == TaskComplexity::Simple {
            return Vec::new();
        }

        let subtasks = match task.kind {
            TaskKind::CodeReview => decompose_code_review(analysis),
            TaskKind::Refactor => decompose_refactor(),
            TaskKind::TestGeneration => decompose_test_generation(analysis),
            TaskKind::Analysis => decompose_analysis(analysis),
            TaskKind::Implementation => decompose_implementation(),
            TaskKind::Migration => decompose_migration(),
            TaskKind::Optimization => decompose_optimization(),
            TaskKind::Generic | TaskKind::IsolatedExecution => decompose_generic(task, analysis),
        };

        if analysis.parallel_potential > 0.7 {
            minimize_dependencies(subtasks)
        } else {
            chain_dependencies(subtasks)
        }
    }

    /// Materialize subtask definitions into a parallel task, splitting
    /// the original file list evenly across subtasks.
    pub fn build_parallel_task(&self, original: &Task, subtasks: &[SubtaskDefinition]) -> Task {
        let mut children = Vec::with_capacity(subtasks.len());
        let per_subtask = if subtasks.is_empty() {
            0
        } else {
            original.files.len() / subtasks.len()
        };

        for (i, definition) in subtasks.iter().enumerate() {
            let mut child = Task::new(definition.kind, definition.description.clone());
            child.id = format!("{}_sub_{}", original.id, i);
            child.priority = definition.priority;
            child.timeout_secs = definition.estimated_time;

            if !original.files.is_empty() && per_subtask > 0 {
                let start = i * per_subtask;
                let end = if i == subtasks.len() - 1 {
                    original.files.len()
                } else {
                    start + per_subtask
                };
                child.files = original.files[start..end.min(original.files.len())].to_vec();
            }

            children.push(child);
        }

        let mut parallel = Task::new(original.kind, format!("[decomposed] {}", original.description));
        parallel.id = format!("{}_parallel", original.id);
        parallel.files = original.files.clone();
        parallel.parallel = true;
        parallel.priority = original.priority;
        parallel.timeout_secs = subtasks
            .iter()
            .map(|s| s.estimated_time)
            .fold(original.timeout_secs, f64::max);
        parallel.subtasks = Some(children);
        parallel
    }
}

fn keyword_score(description: &str) -> f64 {
    let lower = description.to_lowercase();
    let mut score: f64 = 0.2;

    let levels: [(&[&str], f64); 4] = [
        (KEYWORDS_SIMPLE, 0.2),
        (KEYWORDS_MODERATE, 0.4),
        (KEYWORDS_COMPLEX, 0.7),
        (KEYWORDS_VERY_COMPLEX, 1.0),
    ];
    for (keywords, level_score) in levels {
        if keywords.iter().any(|kw| lower.contains(kw)) {
            score = score.max(level_score);
        }
    }
    score
}

fn kind_base_score(kind: TaskKind) -> f64 {
    match kind {
        TaskKind::Generic => 0.2,
        TaskKind::CodeReview => 0.3,
        TaskKind::TestGeneration => 0.4,
        TaskKind::Analysis => 0.5,
        TaskKind::IsolatedExecution => 0.5,
        TaskKind::Refactor => 0.7,
        TaskKind::Implementation => 0.8,
        TaskKind::Optimization => 0.8,
        TaskKind::Migration => 0.9,
    }
}

fn parallel_potential(task: &Task) -> f64 {
    let mut score: f64 = 0.5;

    if task.files.len() > 1 {
        score += 0.2;
    }

    let lower = task.description.to_lowercase();
    if PARALLEL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        score += 0.2;
    }
    if SEQUENTIAL_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        score -= 0.3;
    }

    score.clamp(0.0, 1.0)
}

fn decompose_code_review(analysis: &ComplexityAnalysis) -> Vec<SubtaskDefinition> {
    let mut subtasks = vec![
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Perform static code analysis and linting",
            180.0,
            8,
        )
        .skills(&["static_analysis", "linting"]),
        SubtaskDefinition::new(
            TaskKind::CodeReview,
            "Security vulnerability assessment",
            300.0,
            9,
        )
        .skills(&["security", "vulnerability_analysis"]),
    ];

    if matches!(
        analysis.complexity,
        TaskComplexity::Complex | TaskComplexity::VeryComplex
    ) {
        subtasks.push(
            SubtaskDefinition::new(
                TaskKind::Analysis,
                "Performance analysis and optimization suggestions",
                240.0,
                7,
            )
            .skills(&["performance", "profiling"]),
        );
    }
    if analysis.complexity == TaskComplexity::VeryComplex {
        subtasks.push(
            SubtaskDefinition::new(
                TaskKind::CodeReview,
                "Architecture and design pattern review",
                360.0,
                8,
            )
            .skills(&["architecture", "design_patterns"]),
        );
    }

    subtasks
}

fn decompose_refactor() -> Vec<SubtaskDefinition> {
    vec![
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Analyze code structure and identify refactoring opportunities",
            240.0,
            9,
        )
        .skills(&["code_analysis", "pattern_recognition"]),
        SubtaskDefinition::new(
            TaskKind::TestGeneration,
            "Generate tests to ensure behavior preservation",
            300.0,
            8,
        )
        .depends_on(&[0])
        .skills(&["testing", "test_generation"]),
        SubtaskDefinition::new(
            TaskKind::Refactor,
            "Execute refactoring with safety checks",
            420.0,
            9,
        )
        .depends_on(&[1])
        .skills(&["refactoring", "code_transformation"]),
        SubtaskDefinition::new(
            TaskKind::TestGeneration,
            "Verify refactoring and run all tests",
            180.0,
            8,
        )
        .depends_on(&[2])
        .skills(&["testing", "validation"]),
    ]
}

fn decompose_test_generation(analysis: &ComplexityAnalysis) -> Vec<SubtaskDefinition> {
    let mut subtasks = vec![
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Analyze code structure and identify test scenarios",
            180.0,
            8,
        )
        .skills(&["code_analysis", "test_planning"]),
        SubtaskDefinition::new(
            TaskKind::TestGeneration,
            "Generate unit tests for individual functions",
            300.0,
            9,
        )
        .depends_on(&[0])
        .skills(&["unit_testing", "test_generation"]),
    ];

    if matches!(
        analysis.complexity,
        TaskComplexity::Complex | TaskComplexity::VeryComplex
    ) {
        subtasks.push(
            SubtaskDefinition::new(TaskKind::TestGeneration, "Generate integration tests", 360.0, 7)
                .depends_on(&[0])
                .skills(&["integration_testing", "test_generation"]),
        );
    }

    subtasks
}

fn decompose_analysis(analysis: &ComplexityAnalysis) -> Vec<SubtaskDefinition> {
    let mut subtasks = vec![SubtaskDefinition::new(
        TaskKind::Analysis,
        "Collect and preprocess data for analysis",
        180.0,
        8,
    )
    .skills(&["data_collection", "preprocessing"])];

    if analysis.complexity == TaskComplexity::Moderate {
        subtasks.push(
            SubtaskDefinition::new(TaskKind::Analysis, "Perform basic statistical analysis", 240.0, 7)
                .depends_on(&[0])
                .skills(&["statistics", "data_analysis"]),
        );
    } else {
        subtasks.extend([
            SubtaskDefinition::new(TaskKind::Analysis, "Perform structural analysis", 300.0, 8)
                .depends_on(&[0])
                .skills(&["structural_analysis"]),
            SubtaskDefinition::new(TaskKind::Analysis, "Perform behavioral analysis", 300.0, 8)
                .depends_on(&[0])
                .skills(&["behavioral_analysis"]),
            SubtaskDefinition::new(
                TaskKind::Analysis,
                "Generate insights and recommendations",
                240.0,
                9,
            )
            .depends_on(&[1, 2])
            .skills(&["synthesis", "recommendation"]),
        ]);
    }

    subtasks
}

fn decompose_implementation() -> Vec<SubtaskDefinition> {
    vec![
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Design architecture and create implementation plan",
            300.0,
            9,
        )
        .skills(&["architecture", "design"]),
        SubtaskDefinition::new(TaskKind::Implementation, "Implement core functionality", 600.0, 9)
            .depends_on(&[0])
            .skills(&["programming", "implementation"]),
        SubtaskDefinition::new(
            TaskKind::TestGeneration,
            "Create comprehensive test suite",
            300.0,
            8,
        )
        .depends_on(&[1])
        .skills(&["testing", "test_design"]),
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Create documentation and usage examples",
            240.0,
            6,
        )
        .depends_on(&[1])
        .skills(&["documentation", "technical_writing"]),
    ]
}

fn decompose_migration() -> Vec<SubtaskDefinition> {
    vec![
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Analyze current system and migration requirements",
            360.0,
            9,
        )
        .skills(&["system_analysis", "migration_planning"]),
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Check compatibility and identify breaking changes",
            300.0,
            9,
        )
        .depends_on(&[0])
        .skills(&["compatibility_analysis", "risk_assessment"]),
        SubtaskDefinition::new(
            TaskKind::Implementation,
            "Create migration scripts and tools",
            480.0,
            8,
        )
        .depends_on(&[1])
        .skills(&["scripting", "automation"]),
        SubtaskDefinition::new(
            TaskKind::TestGeneration,
            "Test migration in isolated environment",
            360.0,
            9,
        )
        .depends_on(&[2])
        .skills(&["testing", "migration_testing"]),
        SubtaskDefinition::new(TaskKind::Implementation, "Create rollback procedures", 240.0, 8)
            .depends_on(&[2])
            .skills(&["disaster_recovery", "planning"]),
    ]
}

fn decompose_optimization() -> Vec<SubtaskDefinition> {
    vec![
        SubtaskDefinition::new(
            TaskKind::Analysis,
            "Profile and identify performance bottlenecks",
            300.0,
            9,
        )
        .skills(&["profiling", "performance_analysis"]),
        SubtaskDefinition::new(TaskKind::Analysis, "Develop optimization strategies", 240.0, 8)
            .depends_on(&[0])
            .skills(&["optimization", "algorithm_design"]),
        SubtaskDefinition::new(TaskKind::Implementation, "Implement optimizations", 480.0, 9)
            .depends_on(&[1])
            .skills(&["optimization", "performance_tuning"]),
        SubtaskDefinition::new(
            TaskKind::TestGeneration,
            "Create benchmarks and verify improvements",
            240.0,
            8,
        )
        .depends_on(&[2])
        .skills(&["benchmarking", "performance_testing"]),
    ]
}

fn decompose_generic(task: &Task, analysis: &ComplexityAnalysis) -> Vec<SubtaskDefinition> {
    // Multi-file tasks split one subtask per file
    if task.files.len() > 1 {
        return task
            .files
            .iter()
            .map(|file| {
                SubtaskDefinition::new(
                    task.kind,
                    &format!("{} - {}", task.description, file),
                    task.timeout_secs / task.files.len() as f64,
                    task.priority,
                )
            })
            .collect();
    }

    match analysis.complexity {
        TaskComplexity::Moderate => vec![
            SubtaskDefinition::new(
                TaskKind::Analysis,
                &format!("Analyze requirements for: {}", task.description),
                task.timeout_secs * 0.3,
                task.priority,
            ),
            SubtaskDefinition::new(
                task.kind,
                &format!("Execute: {}", task.description),
                task.timeout_secs * 0.7,
                task.priority,
            )
            .depends_on(&[0]),
        ],
        TaskComplexity::Complex | TaskComplexity::VeryComplex => vec![
            SubtaskDefinition::new(
                TaskKind::Analysis,
                &format!("Planning phase for: {}", task.description),
                task.timeout_secs * 0.2,
                task.priority,
            ),
            SubtaskDefinition::new(
                task.kind,
                &format!("Implementation phase 1: {}", task.description),
                task.timeout_secs * 0.4,
                task.priority,
            )
            .depends_on(&[0]),
            SubtaskDefinition::new(
                task.kind,
                &format!("Implementation phase 2: {}", task.description),
                task.timeout_secs * 0.3,
                task.priority,
            )
            .depends_on(&[0]),
            SubtaskDefinition::new(
                TaskKind::Analysis,
                &format!("Validation and integration: {}", task.description),
                task.timeout_secs * 0.1,
                task.priority,
            )
            .depends_on(&[1, 2]),
        ],
        TaskComplexity::Simple => Vec::new(),
    }
}

/// High parallel potential: non-analysis subtasks depend at most on the
/// first independent analysis subtask.
fn minimize_dependencies(mut subtasks: Vec<SubtaskDefinition>) -> Vec<SubtaskDefinition> {
    let analysis_roots: Vec<usize> = subtasks
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == TaskKind::Analysis && s.dependencies.is_empty())
        .map(|(i, _)| i)
        .collect();

    for (i, subtask) in subtasks.iter_mut().enumerate() {
        if analysis_roots.contains(&i) {
            continue;
        }
        if !subtask.dependencies.is_empty() {
            let kept: Vec<usize> = subtask
                .dependencies
                .iter()
                .copied()
                .filter(|dep| analysis_roots.contains(dep))
                .collect();
            subtask.dependencies = if kept.is_empty() {
                analysis_roots.first().map(|&r| vec![r]).unwrap_or_default()
            } else {
                kept
            };
        }
    }

    subtasks
}

/// Low parallel potential: each non-initial subtask depends on the
/// previous one.
fn chain_dependencies(mut subtasks: Vec<SubtaskDefinition>) -> Vec<SubtaskDefinition> {
    for i in 1..subtasks.len() {
        if subtasks[i].dependencies.is_empty() {
            subtasks[i].dependencies = vec![i - 1];
        }
    }
    subtasks
}

/// Every dependency must reference an earlier subtask; this implies the
/// graph has no cycles.
pub fn is_acyclic(subtasks: &[SubtaskDefinition]) -> bool {
    subtasks
        .iter()
        .enumerate()
        .all(|(i, s)| s.dependencies.iter().all(|&dep| dep < i))
}
