//! Cross-agent coordination strategies
//!
//! A coordinator runs one task over a set of agents under one of five
//! strategies: hierarchical lead/sub decomposition, peer file sharding
//! with majority vote, redundant consensus, a fixed three-stage
//! pipeline, and perspective broadcast. Sub-results keep their agent
//! provenance and are reported in subtask-index order.

use std::collections::{HashMap, HashSet};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::agent::{Agent, Task, TaskKind, TaskResult, TaskStatus};
use crate::decomposer::TaskDecomposer;
use crate::error::{ConductorError, Result};
use crate::protocol::{AgentProtocol, MessageType};

pub mod registry;

pub use registry::{AgentCapability, AgentRole, CoordinationRegistry};

/// Default success-rate threshold for consensus runs
pub const DEFAULT_CONSENSUS_THRESHOLD: f64 = 0.7;
/// Consensus runs use at most this many agents
const CONSENSUS_AGENT_LIMIT: usize = 3;

/// The sealed set of coordination strategies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoordinationStrategy {
    Hierarchical,
    PeerToPeer,
    Consensus,
    Pipeline,
    Broadcast,
}

impl FromStr for CoordinationStrategy {
    type Err = ConductorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "hierarchical" => Ok(Self::Hierarchical),
            "peer_to_peer" | "peer" => Ok(Self::PeerToPeer),
            "consensus" => Ok(Self::Consensus),
            "pipeline" => Ok(Self::Pipeline),
            "broadcast" => Ok(Self::Broadcast),
            _ => Err(ConductorError::validation(format!(
                "unknown coordination strategy: {}",
                s
            ))),
        }
    }
}

impl std::fmt::Display for CoordinationStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Hierarchical => "hierarchical",
            Self::PeerToPeer => "peer_to_peer",
            Self::Consensus => "consensus",
            Self::Pipeline => "pipeline",
            Self::Broadcast => "broadcast",
        };
        write!(f, "{}", name)
    }
}

/// Outcome of one coordination run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationResult {
    pub task_id: String,
    pub strategy: CoordinationStrategy,
    pub lead_agent_id: Option<String>,
    /// (subtask id, result) pairs in subtask-index order
    pub agent_results: Vec<(String, TaskResult)>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub consensus_reached: Option<bool>,
    pub final_result: serde_json::Value,
    pub coordination_time: Duration,
}

impl CoordinationResult {
    pub fn successful(&self) -> usize {
        self.agent_results
            .iter()
            .filter(|(_, r)| r.is_success())
            .count()
    }

    pub fn failed(&self) -> usize {
        self.agent_results.len() - self.successful()
    }

    /// Collapse into a single top-level task result: `partial` when some
    /// subtasks failed, `failed` when all did.
    pub fn into_task_result(self, coordinator_id: &str) -> TaskResult {
        let successful = self.successful();
        let total = self.agent_results.len();
        let elapsed = self.coordination_time;
        let task_id = self.task_id.clone();

        let payload = json!({
            "strategy": self.strategy,
            "lead_agent_id": self.lead_agent_id,
            "consensus_reached": self.consensus_reached,
            "final_result": self.final_result,
            "subtask_count": total,
            "successful_subtasks": successful,
        });

        if total == 0 || successful == total {
            TaskResult::success(task_id, coordinator_id, payload, elapsed)
        } else if successful > 0 {
            TaskResult::partial(
                task_id,
                coordinator_id,
                payload,
                format!("{} of {} subtasks failed", total - successful, total),
                elapsed,
            )
        } else {
            let mut result =
                TaskResult::failed(task_id, coordinator_id, "all subtasks failed", elapsed);
            result.result = payload;
            result
        }
    }
}

/// Runs coordination strategies over sets of agents
pub struct Coordinator {
    decomposer: TaskDecomposer,
    registry: Arc<CoordinationRegistry>,
    /// When set, subtask dispatch goes through the messaging protocol;
    /// otherwise agents are invoked in-process.
    protocol: Option<Arc<AgentProtocol>>,
    consensus_threshold: f64,
}

impl Coordinator {
    pub fn new(registry: Arc<CoordinationRegistry>) -> Self {
        Self {
            decomposer: TaskDecomposer::new(),
            registry,
            protocol: None,
            consensus_threshold: DEFAULT_CONSENSUS_THRESHOLD,
        }
    }

    pub fn with_protocol(mut self, protocol: Arc<AgentProtocol>) -> Self {
        self.protocol = Some(protocol);
        self
    }

    pub fn with_consensus_threshold(mut self, threshold: f64) -> Self {
        self.consensus_threshold = threshold;
        self
    }

    pub fn registry(&self) -> &Arc<CoordinationRegistry> {
        &self.registry
    }

    /// Execute `task` under `strategy`, bounded by the task's deadline.
    /// Outstanding subtask futures are dropped once the deadline hits.
    pub async fn coordinate(
        &self,
        task: &Task,
        strategy: CoordinationStrategy,
        lead: Arc<Agent>,
        subs: Vec<Arc<Agent>>,
    ) -> Result<CoordinationResult> {
        let started = Instant::now();
        info!(task = %task.id, %strategy, subs = subs.len(), "coordinating task");

        let run = async {
            match strategy {
                CoordinationStrategy::Hierarchical => {
                    self.hierarchical(task, &lead, &subs).await
                }
                CoordinationStrategy::PeerToPeer => self.peer_to_peer(task, &lead, &subs).await,
                CoordinationStrategy::Consensus => self.consensus(task, &lead, &subs).await,
                CoordinationStrategy::Pipeline => self.pipeline(task, &lead, &subs).await,
                CoordinationStrategy::Broadcast => self.broadcast(task, &lead, &subs).await,
            }
        };

        let mut result = tokio::time::timeout(task.timeout(), run)
            .await
            .map_err(|_| ConductorError::task_timeout(task.id.clone(), started.elapsed()))??;

        result.coordination_time = started.elapsed();
        self.registry.record_result(&result);
        Ok(result)
    }

    fn dispatcher(&self) -> DispatchHandle {
        DispatchHandle {
            protocol: self.protocol.clone(),
        }
    }

    /// Fan subtasks out to their assigned agents; results come back in
    /// subtask-index order regardless of completion order.
    async fn fan_out(
        &self,
        assignments: Vec<(Arc<Agent>, Task)>,
    ) -> Vec<(String, TaskResult)> {
        let mut join_set = JoinSet::new();
        let mut ids: Vec<String> = Vec::with_capacity(assignments.len());

        for (index, (agent, subtask)) in assignments.into_iter().enumerate() {
            ids.push(subtask.id.clone());
            let dispatcher = self.dispatcher();
            join_set.spawn(async move {
                let result = dispatcher.dispatch(agent, subtask).await;
                (index, result)
            });
        }

        let mut slots: Vec<Option<TaskResult>> = (0..ids.len()).map(|_| None).collect();
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, result)) => slots[index] = Some(result),
                Err(e) => warn!("subtask future failed: {}", e),
            }
        }

        ids.into_iter()
            .zip(slots)
            .map(|(id, slot)| {
                let result = slot.unwrap_or_else(|| {
                    TaskResult::failed(&id, "coordinator", "subtask future lost", Duration::ZERO)
                });
                (id, result)
            })
            .collect()
    }

    /// Lead decomposes, assigns round-robin, gathers, synthesizes.
    /// Failed subtasks are reported, never abort the run.
    async fn hierarchical(
        &self,
        task: &Task,
        lead: &Arc<Agent>,
        subs: &[Arc<Agent>],
    ) -> Result<CoordinationResult> {
        let subtasks = self.split_for_hierarchy(task);
        let workers: Vec<Arc<Agent>> = if subs.is_empty() {
            vec![Arc::clone(lead)]
        } else {
            subs.to_vec()
        };

        let assignments: Vec<(Arc<Agent>, Task)> = subtasks
            .into_iter()
            .enumerate()
            .map(|(i, subtask)| (Arc::clone(&workers[i % workers.len()]), subtask))
            .collect();

        let agent_results = self.fan_out(assignments).await;

        let mut results = serde_json::Map::new();
        for (subtask_id, result) in &agent_results {
            results.insert(
                subtask_id.clone(),
                json!({
                    "status": result.status,
                    "agent": result.agent_id,
                    "output": result.result,
                }),
            );
        }
        let successful = agent_results.iter().filter(|(_, r)| r.is_success()).count();

        let final_result = json!({
            "total_subtasks": agent_results.len(),
            "successful": successful,
            "failed": agent_results.len() - successful,
            "results": results,
        });

        Ok(CoordinationResult {
            task_id: task.id.clone(),
            strategy: CoordinationStrategy::Hierarchical,
            lead_agent_id: Some(lead.id().to_string()),
            agent_results,
            consensus_reached: None,
            final_result,
            coordination_time: Duration::ZERO,
        })
    }

    fn split_for_hierarchy(&self, task: &Task) -> Vec<Task> {
        // Multi-file tasks split per file; otherwise ask the decomposer
        if task.files.len() > 1 {
            return task
                .files
                .iter()
                .enumerate()
                .map(|(i, file)| {
                    let mut subtask = Task::new(
                        task.kind,
                        format!("{} - {}", task.description, file),
                    );
                    subtask.id = format!("{}_sub_{}", task.id, i);
                    subtask.files = vec![file.clone()];
                    subtask.priority = task.priority;
                    subtask.timeout_secs = task.timeout_secs / task.files.len() as f64;
                    subtask
                })
                .collect();
        }

        let definitions = self.decomposer.decompose(task, None);
        if definitions.is_empty() {
            let mut only = task.clone();
            only.id = format!("{}_sub_0", task.id);
            return vec![only];
        }

        definitions
            .iter()
            .enumerate()
            .map(|(i, def)| {
                let mut subtask = Task::new(def.kind, def.description.clone());
                subtask.id = format!("{}_sub_{}", task.id, i);
                subtask.files = task.files.clone();
                subtask.priority = def.priority;
                subtask.timeout_secs = def.estimated_time;
                subtask
            })
            .collect()
    }

    /// Files are partitioned evenly across all agents; final status is
    /// a majority vote over sub-statuses.
    async fn peer_to_peer(
        &self,
        task: &Task,
        lead: &Arc<Agent>,
        subs: &[Arc<Agent>],
    ) -> Result<CoordinationResult> {
        let mut peers: Vec<Arc<Agent>> = vec![Arc::clone(lead)];
        peers.extend(subs.iter().cloned());

        let chunk = if task.files.is_empty() {
            0
        } else {
            (task.files.len() / peers.len()).max(1)
        };

        let assignments: Vec<(Arc<Agent>, Task)> = peers
            .iter()
            .enumerate()
            .map(|(i, peer)| {
                let files = if task.files.is_empty() {
                    Vec::new()
                } else {
                    let start = (i * chunk).min(task.files.len());
                    let end = if i == peers.len() - 1 {
                        task.files.len()
                    } else {
                        ((i + 1) * chunk).min(task.files.len())
                    };
                    task.files[start..end].to_vec()
                };

                let mut subtask =
                    Task::new(task.kind, format!("{} (peer {})", task.description, i));
                subtask.id = format!("{}_peer_{}", task.id, i);
                subtask.files = files;
                subtask.priority = task.priority;
                subtask.timeout_secs = task.timeout_secs;
                (Arc::clone(peer), subtask)
            })
            .collect();

        let agent_results = self.fan_out(assignments).await;

        let mut votes: HashMap<String, usize> = HashMap::new();
        for (_, result) in &agent_results {
            *votes.entry(result.status.to_string()).or_default() += 1;
        }
        let consensus_status = votes
            .iter()
            .max_by_key(|(_, count)| **count)
            .map(|(status, _)| status.clone())
            .unwrap_or_else(|| "failed".to_string());

        let final_result = json!({
            "consensus_status": consensus_status,
            "votes": votes,
            "peer_count": agent_results.len(),
        });

        Ok(CoordinationResult {
            task_id: task.id.clone(),
            strategy: CoordinationStrategy::PeerToPeer,
            lead_agent_id: None,
            agent_results,
            consensus_reached: None,
            final_result,
            coordination_time: Duration::ZERO,
        })
    }

    /// Up to three agents run the identical task; consensus is reached
    /// when the success rate clears the threshold.
    async fn consensus(
        &self,
        task: &Task,
        lead: &Arc<Agent>,
        subs: &[Arc<Agent>],
    ) -> Result<CoordinationResult> {
        let agents: Vec<Arc<Agent>> = subs.iter().take(CONSENSUS_AGENT_LIMIT).cloned().collect();

        if agents.is_empty() {
            let final_result = json!({
                "consensus_reached": false,
                "success_rate": 0.0,
                "threshold": self.consensus_threshold,
                "agent_count": 0,
            });
            return Ok(CoordinationResult {
                task_id: task.id.clone(),
                strategy: CoordinationStrategy::Consensus,
                lead_agent_id: Some(lead.id().to_string()),
                agent_results: Vec::new(),
                consensus_reached: Some(false),
                final_result,
                coordination_time: Duration::ZERO,
            });
        }

        let assignments: Vec<(Arc<Agent>, Task)> = agents
            .iter()
            .enumerate()
            .map(|(i, agent)| {
                let mut replica = task.clone();
                replica.id = format!("{}_consensus_{}", task.id, i);
                (Arc::clone(agent), replica)
            })
            .collect();

        let agent_results = self.fan_out(assignments).await;

        let successes = agent_results.iter().filter(|(_, r)| r.is_success()).count();
        let success_rate = successes as f64 / agent_results.len() as f64;
        let consensus_reached = success_rate >= self.consensus_threshold;

        let final_result = json!({
            "consensus_reached": consensus_reached,
            "success_rate": success_rate,
            "threshold": self.consensus_threshold,
            "agent_count": agent_results.len(),
        });

        Ok(CoordinationResult {
            task_id: task.id.clone(),
            strategy: CoordinationStrategy::Consensus,
            lead_agent_id: Some(lead.id().to_string()),
            agent_results,
            consensus_reached: Some(consensus_reached),
            final_result,
            coordination_time: Duration::ZERO,
        })
    }

    /// Fixed analysis → kind → review stages; each stage sees the
    /// previous result; the run aborts on the first non-success.
    async fn pipeline(
        &self,
        task: &Task,
        lead: &Arc<Agent>,
        subs: &[Arc<Agent>],
    ) -> Result<CoordinationResult> {
        let stages: [(&str, TaskKind); 3] = [
            ("analysis", TaskKind::Analysis),
            ("implementation", task.kind),
            ("review", TaskKind::CodeReview),
        ];
        let workers: Vec<Arc<Agent>> = if subs.is_empty() {
            vec![Arc::clone(lead)]
        } else {
            subs.to_vec()
        };

        let mut agent_results: Vec<(String, TaskResult)> = Vec::new();
        let mut previous: Option<serde_json::Value> = None;

        for (i, (stage_name, stage_kind)) in stages.iter().enumerate() {
            let agent = Arc::clone(&workers[i % workers.len()]);

            let mut description = format!("{}: {}", stage_name, task.description);
            if let Some(previous) = &previous {
                description.push_str(&format!("\nPrevious stage result: {}", previous));
            }

            let mut stage_task = Task::new(*stage_kind, description);
            stage_task.id = format!("{}_stage_{}", task.id, stage_name);
            stage_task.files = task.files.clone();
            stage_task.priority = task.priority;
            stage_task.timeout_secs = task.timeout_secs / stages.len() as f64;

            let result = self.dispatcher().dispatch(agent, stage_task.clone()).await;
            let ok = result.is_success();
            previous = Some(result.result.clone());
            agent_results.push((stage_task.id, result));

            if !ok {
                warn!(task = %task.id, stage = %stage_name, "pipeline aborted");
                break;
            }
        }

        let final_result = json!({
            "pipeline_complete": agent_results.len() == stages.len()
                && agent_results.iter().all(|(_, r)| r.is_success()),
            "stages_completed": agent_results.len(),
            "final_output": previous,
        });

        Ok(CoordinationResult {
            task_id: task.id.clone(),
            strategy: CoordinationStrategy::Pipeline,
            lead_agent_id: Some(lead.id().to_string()),
            agent_results,
            consensus_reached: None,
            final_result,
            coordination_time: Duration::ZERO,
        })
    }

    /// Every sub runs its own perspective on the task; all successful
    /// outputs are merged.
    async fn broadcast(
        &self,
        task: &Task,
        lead: &Arc<Agent>,
        subs: &[Arc<Agent>],
    ) -> Result<CoordinationResult> {
        let assignments: Vec<(Arc<Agent>, Task)> = subs
            .iter()
            .map(|agent| {
                let mut variant = Task::new(
                    task.kind,
                    format!("{} (perspective: {})", task.description, agent.id()),
                );
                variant.id = format!("{}_broadcast_{}", task.id, agent.id());
                variant.files = task.files.clone();
                variant.priority = task.priority;
                variant.timeout_secs = task.timeout_secs;
                (Arc::clone(agent), variant)
            })
            .collect();

        let agent_results = self.fan_out(assignments).await;

        let mut merged = serde_json::Map::new();
        for (_, result) in &agent_results {
            if result.is_success() {
                merged.insert(result.agent_id.clone(), result.result.clone());
            }
        }

        let final_result = json!({
            "perspectives_collected": merged.len(),
            "total_agents": agent_results.len(),
            "merged_data": merged,
        });

        Ok(CoordinationResult {
            task_id: task.id.clone(),
            strategy: CoordinationStrategy::Broadcast,
            lead_agent_id: Some(lead.id().to_string()),
            agent_results,
            consensus_reached: None,
            final_result,
            coordination_time: Duration::ZERO,
        })
    }
}

/// Dispatch logic shared between the coordinator and its fan-out tasks
struct DispatchHandle {
    protocol: Option<Arc<AgentProtocol>>,
}

impl DispatchHandle {
    async fn dispatch(&self, agent: Arc<Agent>, subtask: Task) -> TaskResult {
        if let Some(protocol) = &self.protocol {
            if let Ok(payload) = serde_json::to_value(&subtask) {
                match protocol
                    .request(agent.id(), payload, subtask.timeout())
                    .await
                {
                    Ok(reply) if reply.message_type == MessageType::TaskResponse => {
                        if let Ok(result) =
                            serde_json::from_value::<TaskResult>(reply.payload.clone())
                        {
                            return result;
                        }
                        warn!(task = %subtask.id, "malformed task response, running locally");
                    }
                    Ok(reply) => {
                        let detail =
                            reply.payload["detail"].as_str().unwrap_or("request failed");
                        return TaskResult::failed(
                            &subtask.id,
                            agent.id(),
                            detail.to_string(),
                            Duration::ZERO,
                        );
                    }
                    Err(e) => {
                        warn!(task = %subtask.id, "protocol dispatch failed, running locally: {}", e);
                    }
                }
            }
        }
        agent.execute(subtask).await
    }
}

/// Majority vote over a list of statuses
pub fn majority_status(statuses: &[TaskStatus]) -> TaskStatus {
    let mut votes: HashMap<TaskStatus, usize> = HashMap::new();
    for status in statuses {
        *votes.entry(*status).or_default() += 1;
    }
    votes
        .into_iter()
        .max_by_key(|(_, count)| *count)
        .map(|(status, _)| status)
        .unwrap_or(TaskStatus::Failed)
}

/// Skills required for a task kind, used for registry matching
pub fn required_skills(kind: TaskKind) -> HashSet<String> {
    let skills: &[&str] = match kind {
        TaskKind::CodeReview => &["review"],
        TaskKind::Refactor => &["refactoring"],
        TaskKind::TestGeneration => &["testing"],
        TaskKind::Analysis => &["analysis"],
        _ => &["execution"],
    };
    skills.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strategy_parse() {
        assert_eq!(
            "peer".parse::<CoordinationStrategy>().unwrap(),
            CoordinationStrategy::PeerToPeer
        );
        assert_eq!(
            "consensus".parse::<CoordinationStrategy>().unwrap(),
            CoordinationStrategy::Consensus
        );
        assert!("quorum".parse::<CoordinationStrategy>().is_err());
    }

    #[test]
    fn test_majority_status() {
        let statuses = [TaskStatus::Success, TaskStatus::Success, TaskStatus::Failed];
        assert_eq!(majority_status(&statuses), TaskStatus::Success);

        let statuses = [TaskStatus::Failed, TaskStatus::Failed, TaskStatus::Success];
        assert_eq!(majority_status(&statuses), TaskStatus::Failed);
    }

    #[test]
    fn test_coordination_result_collapse() {
        let make = |statuses: &[TaskStatus]| CoordinationResult {
            task_id: "t1".to_string(),
            strategy: CoordinationStrategy::Hierarchical,
            lead_agent_id: Some("lead".to_string()),
            agent_results: statuses
                .iter()
                .enumerate()
                .map(|(i, status)| {
                    let result = match status {
                        TaskStatus::Success => TaskResult::success(
                            format!("t1_sub_{}", i),
                            "agent",
                            json!({}),
                            Duration::ZERO,
                        ),
                        _ => TaskResult::failed(
                            format!("t1_sub_{}", i),
                            "agent",
                            "boom",
                            Duration::ZERO,
                        ),
                    };
                    (format!("t1_sub_{}", i), result)
                })
                .collect(),
            consensus_reached: None,
            final_result: json!({}),
            coordination_time: Duration::ZERO,
        };

        let all_ok = make(&[TaskStatus::Success, TaskStatus::Success]);
        assert_eq!(all_ok.into_task_result("orchestrator").status, TaskStatus::Success);

        let mixed = make(&[TaskStatus::Success, TaskStatus::Failed]);
        assert_eq!(mixed.into_task_result("orchestrator").status, TaskStatus::Partial);

        let none = make(&[TaskStatus::Failed, TaskStatus::Failed]);
        assert_eq!(none.into_task_result("orchestrator").status, TaskStatus::Failed);
    }
}
