//! Agent capability registry for coordination
//!
//! Tracks what each agent can do and how well it has been doing it. The
//! performance score is nudged after every coordination run and feeds
//! agent selection.

use std::collections::HashSet;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::agent::TaskStatus;
use crate::coordination::CoordinationResult;

const SCORE_FLOOR: f64 = 0.1;
const SCORE_CEILING: f64 = 1.0;
const SCORE_REWARD: f64 = 1.01;
const SCORE_PENALTY: f64 = 0.99;
const HISTORY_LIMIT: usize = 256;

/// Roles an agent can hold within a coordination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentRole {
    Lead,
    Sub,
    Specialist,
    Reviewer,
    Coordinator,
}

/// What one agent brings to a coordination
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCapability {
    pub agent_id: String,
    pub role: AgentRole,
    pub skills: HashSet<String>,
    pub max_concurrent_tasks: usize,
    pub specializations: Vec<String>,
    /// Rolling quality score in [0.1, 1.0]
    pub performance_score: f64,
}

impl AgentCapability {
    pub fn new(agent_id: impl Into<String>, role: AgentRole) -> Self {
        Self {
            agent_id: agent_id.into(),
            role,
            skills: ["execution", "reporting"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            max_concurrent_tasks: 3,
            specializations: Vec::new(),
            performance_score: 1.0,
        }
    }

    pub fn with_skills(mut self, skills: &[&str]) -> Self {
        self.skills = skills.iter().map(|s| s.to_string()).collect();
        self
    }
}

/// Summary of a finished coordination kept for trend inspection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSummary {
    pub task_id: String,
    pub strategy: String,
    pub subtask_count: usize,
    pub successful: usize,
}

/// Capability registry shared by coordinators
#[derive(Default)]
pub struct CoordinationRegistry {
    capabilities: DashMap<String, AgentCapability>,
    history: Mutex<Vec<CoordinationSummary>>,
}

impl CoordinationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, capability: AgentCapability) {
        info!(
            agent = %capability.agent_id,
            role = ?capability.role,
            "agent registered for coordination"
        );
        self.capabilities
            .insert(capability.agent_id.clone(), capability);
    }

    pub fn unregister(&self, agent_id: &str) {
        self.capabilities.remove(agent_id);
    }

    pub fn capability(&self, agent_id: &str) -> Option<AgentCapability> {
        self.capabilities.get(agent_id).map(|c| c.clone())
    }

    /// Agents whose skills cover the requirement, best performers first
    pub fn suitable_agents(&self, required_skills: &HashSet<String>, count: usize) -> Vec<String> {
        let mut matches: Vec<(String, f64)> = self
            .capabilities
            .iter()
            .filter(|entry| required_skills.is_subset(&entry.skills))
            .map(|entry| (entry.agent_id.clone(), entry.performance_score))
            .collect();

        matches.sort_by(|a, b| b.1.total_cmp(&a.1));
        matches.into_iter().take(count).map(|(id, _)| id).collect()
    }

    /// Nudge performance scores from one coordination outcome and
    /// append it to the history.
    pub fn record_result(&self, result: &CoordinationResult) {
        for (_, sub_result) in &result.agent_results {
            if let Some(mut capability) = self.capabilities.get_mut(&sub_result.agent_id) {
                let factor = if sub_result.status == TaskStatus::Success {
                    SCORE_REWARD
                } else {
                    SCORE_PENALTY
                };
                capability.performance_score =
                    (capability.performance_score * factor).clamp(SCORE_FLOOR, SCORE_CEILING);
            }
        }

        let summary = CoordinationSummary {
            task_id: result.task_id.clone(),
            strategy: result.strategy.to_string(),
            subtask_count: result.agent_results.len(),
            successful: result.successful(),
        };
        if let Ok(mut history) = self.history.try_lock() {
            if history.len() >= HISTORY_LIMIT {
                history.remove(0);
            }
            history.push(summary);
        }
    }

    pub async fn history(&self) -> Vec<CoordinationSummary> {
        self.history.lock().await.clone()
    }

    pub fn registered_count(&self) -> usize {
        self.capabilities.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::TaskResult;
    use crate::coordination::CoordinationStrategy;
    use std::time::Duration;

    fn result_with(agent_id: &str, status: TaskStatus) -> CoordinationResult {
        let sub = match status {
            TaskStatus::Success => {
                TaskResult::success("t1_sub_0", agent_id, serde_json::json!({}), Duration::ZERO)
            }
            _ => TaskResult::failed("t1_sub_0", agent_id, "boom", Duration::ZERO),
        };
        CoordinationResult {
            task_id: "t1".to_string(),
            strategy: CoordinationStrategy::Hierarchical,
            lead_agent_id: None,
            agent_results: vec![("t1_sub_0".to_string(), sub)],
            consensus_reached: None,
            final_result: serde_json::json!({}),
            coordination_time: Duration::ZERO,
        }
    }

    #[test]
    fn test_suitable_agents_ranked_by_score() {
        let registry = CoordinationRegistry::new();
        let mut strong = AgentCapability::new("strong", AgentRole::Sub);
        strong.performance_score = 0.9;
        let mut weak = AgentCapability::new("weak", AgentRole::Sub);
        weak.performance_score = 0.4;
        registry.register(strong);
        registry.register(weak);

        let required: HashSet<String> = ["execution".to_string()].into_iter().collect();
        let picked = registry.suitable_agents(&required, 2);
        assert_eq!(picked, vec!["strong".to_string(), "weak".to_string()]);
    }

    #[test]
    fn test_skill_filter() {
        let registry = CoordinationRegistry::new();
        registry.register(AgentCapability::new("generalist", AgentRole::Sub));
        registry.register(
            AgentCapability::new("reviewer", AgentRole::Reviewer).with_skills(&["review"]),
        );

        let required: HashSet<String> = ["review".to_string()].into_iter().collect();
        let picked = registry.suitable_agents(&required, 5);
        assert_eq!(picked, vec!["reviewer".to_string()]);
    }

    #[test]
    fn test_score_nudging_and_clamping() {
        let registry = CoordinationRegistry::new();
        registry.register(AgentCapability::new("agent_000", AgentRole::Sub));

        registry.record_result(&result_with("agent_000", TaskStatus::Success));
        let score = registry.capability("agent_000").unwrap().performance_score;
        assert!((score - 1.0).abs() < f64::EPSILON, "score clamped at 1.0");

        for _ in 0..500 {
            registry.record_result(&result_with("agent_000", TaskStatus::Failed));
        }
        let score = registry.capability("agent_000").unwrap().performance_score;
        assert!(score >= SCORE_FLOOR);
        assert!(score < 0.2);
    }
}
