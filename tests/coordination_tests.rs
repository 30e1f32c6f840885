//! Coordination strategy scenarios over scripted agents

mod support;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use conductor::agent::{Agent, Task, TaskKind, TaskStatus};
use conductor::coordination::{
    AgentCapability, AgentRole, CoordinationRegistry, CoordinationStrategy, Coordinator,
};

use support::{scripted_agent, Rule, ScriptedWorker};

fn coordinator() -> Coordinator {
    Coordinator::new(Arc::new(CoordinationRegistry::new()))
}

fn ok_agent(id: &str, dir: &TempDir) -> Arc<Agent> {
    scripted_agent(id, dir.path(), ScriptedWorker::echoing(&["ok"]))
}

fn broken_agent(id: &str, dir: &TempDir) -> Arc<Agent> {
    scripted_agent(id, dir.path(), ScriptedWorker::broken())
}

#[tokio::test]
async fn test_consensus_two_of_three_below_threshold() {
    let dir = TempDir::new().unwrap();
    let lead = ok_agent("lead", &dir);
    let subs = vec![
        ok_agent("sub_0", &dir),
        ok_agent("sub_1", &dir),
        broken_agent("sub_2", &dir),
    ];

    let task = Task::builder("verify the deployment")
        .id("t_consensus")
        .timeout_secs(10.0)
        .build();

    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::Consensus, lead, subs)
        .await
        .unwrap();

    assert_eq!(result.consensus_reached, Some(false));
    let rate = result.final_result["success_rate"].as_f64().unwrap();
    assert!((rate - 2.0 / 3.0).abs() < 1e-9);
    assert_eq!(result.final_result["threshold"], 0.7);
    assert_eq!(result.agent_results.len(), 3);
}

#[tokio::test]
async fn test_consensus_meets_threshold_when_all_succeed() {
    let dir = TempDir::new().unwrap();
    let lead = ok_agent("lead", &dir);
    let subs = vec![
        ok_agent("sub_0", &dir),
        ok_agent("sub_1", &dir),
        ok_agent("sub_2", &dir),
    ];

    let task = Task::builder("verify the deployment")
        .id("t_consensus_ok")
        .timeout_secs(10.0)
        .build();

    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::Consensus, lead, subs)
        .await
        .unwrap();

    assert_eq!(result.consensus_reached, Some(true));
    assert_eq!(result.final_result["success_rate"], 1.0);
}

#[tokio::test]
async fn test_consensus_with_no_agents() {
    let dir = TempDir::new().unwrap();
    let lead = ok_agent("lead", &dir);

    let task = Task::builder("anything").id("t_lonely").timeout_secs(5.0).build();
    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::Consensus, lead, vec![])
        .await
        .unwrap();

    assert_eq!(result.consensus_reached, Some(false));
    assert_eq!(result.final_result["success_rate"], 0.0);
    assert!(result.agent_results.is_empty());
}

#[tokio::test]
async fn test_pipeline_aborts_on_failed_stage() {
    let dir = TempDir::new().unwrap();
    let lead = ok_agent("lead", &dir);
    // Stage order is analysis -> implementation -> review, assigned
    // round-robin; the second stage lands on the broken sub.
    let subs = vec![
        ok_agent("sub_0", &dir),
        broken_agent("sub_1", &dir),
        ok_agent("sub_2", &dir),
    ];

    let task = Task::builder("ship the feature")
        .id("t_pipe")
        .timeout_secs(15.0)
        .build();

    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::Pipeline, lead, subs)
        .await
        .unwrap();

    assert_eq!(result.final_result["stages_completed"], 2);
    assert_eq!(result.final_result["pipeline_complete"], false);
    assert_eq!(result.agent_results.len(), 2);
    assert_eq!(result.agent_results[1].1.status, TaskStatus::Failed);
}

#[tokio::test]
async fn test_pipeline_complete_passes_results_forward() {
    let dir = TempDir::new().unwrap();
    let lead = ok_agent("lead", &dir);
    let sub_0 = scripted_agent(
        "sub_0",
        dir.path(),
        ScriptedWorker::new(vec![Rule::reply("", &["stage output"])]),
    );
    let worker_1 = ScriptedWorker::echoing(&["ok"]);
    let sub_1 = scripted_agent("sub_1", dir.path(), Arc::clone(&worker_1));
    let subs = vec![sub_0, sub_1, ok_agent("sub_2", &dir)];

    let task = Task::builder("ship the feature")
        .id("t_pipe_ok")
        .timeout_secs(15.0)
        .build();

    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::Pipeline, lead, subs)
        .await
        .unwrap();

    assert_eq!(result.final_result["pipeline_complete"], true);
    assert_eq!(result.final_result["stages_completed"], 3);

    // The second stage saw the first stage's output in its command
    let sent = worker_1.sent_commands().await;
    assert!(sent[0].contains("Previous stage result"));
}

#[tokio::test]
async fn test_peer_to_peer_shards_files_and_votes() {
    let dir = TempDir::new().unwrap();
    for name in ["a.py", "b.py", "c.py", "d.py"] {
        tokio::fs::write(dir.path().join(name), "pass").await.unwrap();
    }
    let files: Vec<String> = ["a.py", "b.py", "c.py", "d.py"]
        .iter()
        .map(|n| dir.path().join(n).display().to_string())
        .collect();

    let lead_worker = ScriptedWorker::echoing(&[r#"{"type":"review","issues":1}"#]);
    let sub_worker = ScriptedWorker::echoing(&[r#"{"type":"review","issues":0}"#]);
    let lead = scripted_agent("lead", dir.path(), Arc::clone(&lead_worker));
    let subs = vec![scripted_agent("sub_0", dir.path(), Arc::clone(&sub_worker))];

    let task = Task::builder("review the changes")
        .id("t_peer")
        .kind(TaskKind::CodeReview)
        .files(files)
        .timeout_secs(20.0)
        .build();

    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::PeerToPeer, lead, subs)
        .await
        .unwrap();

    assert!(result.lead_agent_id.is_none());
    assert_eq!(result.final_result["peer_count"], 2);
    assert_eq!(result.final_result["consensus_status"], "success");

    // Both peers actually reviewed their shard
    assert!(!lead_worker.sent_commands().await.is_empty());
    assert!(!sub_worker.sent_commands().await.is_empty());
}

#[tokio::test]
async fn test_broadcast_merges_perspectives() {
    let dir = TempDir::new().unwrap();
    let lead = ok_agent("lead", &dir);
    let subs = vec![
        ok_agent("sub_0", &dir),
        ok_agent("sub_1", &dir),
        broken_agent("sub_2", &dir),
    ];

    let task = Task::builder("summarize the incident")
        .id("t_cast")
        .timeout_secs(10.0)
        .build();

    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::Broadcast, lead, subs)
        .await
        .unwrap();

    assert_eq!(result.final_result["perspectives_collected"], 2);
    assert_eq!(result.final_result["total_agents"], 3);
    let merged = result.final_result["merged_data"].as_object().unwrap();
    assert!(merged.contains_key("sub_0"));
    assert!(merged.contains_key("sub_1"));
    assert!(!merged.contains_key("sub_2"));
}

#[tokio::test]
async fn test_hierarchical_reports_failed_subtasks_without_aborting() {
    let dir = TempDir::new().unwrap();
    for name in ["a.py", "b.py"] {
        tokio::fs::write(dir.path().join(name), "pass").await.unwrap();
    }
    let files: Vec<String> = ["a.py", "b.py"]
        .iter()
        .map(|n| dir.path().join(n).display().to_string())
        .collect();

    let lead = ok_agent("lead", &dir);
    let subs = vec![ok_agent("sub_0", &dir), broken_agent("sub_1", &dir)];

    let task = Task::builder("process every file")
        .id("t_hier")
        .files(files)
        .timeout_secs(20.0)
        .build();

    let result = coordinator()
        .coordinate(&task, CoordinationStrategy::Hierarchical, lead, subs)
        .await
        .unwrap();

    assert_eq!(result.final_result["total_subtasks"], 2);
    assert_eq!(result.final_result["successful"], 1);
    assert_eq!(result.final_result["failed"], 1);

    // Subtask results are reported in subtask-index order
    assert_eq!(result.agent_results[0].0, "t_hier_sub_0");
    assert_eq!(result.agent_results[1].0, "t_hier_sub_1");
}

#[tokio::test]
async fn test_coordination_respects_task_deadline() {
    let dir = TempDir::new().unwrap();
    let lead = ok_agent("lead", &dir);
    let slow = scripted_agent(
        "sub_0",
        dir.path(),
        ScriptedWorker::new(vec![Rule::delayed("", Duration::from_secs(10), &["late"])]),
    );

    let task = Task::builder("slow consensus")
        .id("t_deadline")
        .timeout_secs(1.0)
        .build();

    let err = coordinator()
        .coordinate(&task, CoordinationStrategy::Consensus, lead, vec![slow])
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        conductor::error::ConductorError::TaskTimeout { .. }
    ));
}

#[tokio::test]
async fn test_registry_scores_update_after_run() {
    let dir = TempDir::new().unwrap();
    let registry = Arc::new(CoordinationRegistry::new());
    registry.register(AgentCapability::new("sub_0", AgentRole::Sub));
    registry.register(AgentCapability::new("sub_1", AgentRole::Sub));

    let coordinator = Coordinator::new(Arc::clone(&registry));
    let lead = ok_agent("lead", &dir);
    let subs = vec![ok_agent("sub_0", &dir), broken_agent("sub_1", &dir)];

    let task = Task::builder("score me").id("t_score").timeout_secs(10.0).build();
    coordinator
        .coordinate(&task, CoordinationStrategy::Broadcast, lead, subs)
        .await
        .unwrap();

    let good = registry.capability("sub_0").unwrap().performance_score;
    let bad = registry.capability("sub_1").unwrap().performance_score;
    assert!(good > bad);
}
