//! End-to-end orchestrator scenarios over scripted workers

mod support;

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use conductor::agent::{AgentState, Task, TaskStatus};
use conductor::error::ConductorError;
use conductor::orchestrator::Orchestrator;

use support::{scripted_factory, test_config, Rule, ScriptedWorker};

#[tokio::test]
async fn test_single_code_review() -> anyhow::Result<()> {
    let dir = TempDir::new()?;
    let source = dir.path().join("a.py");
    tokio::fs::write(&source, "def f(): pass").await?;

    let worker = ScriptedWorker::new(vec![Rule::reply(
        "review",
        &[r#"{"type":"review","issues":3}"#],
    )]);
    let orchestrator = Orchestrator::with_factory(
        test_config(dir.path(), 1),
        scripted_factory(dir.path().to_path_buf(), vec![Arc::clone(&worker)]),
    );
    orchestrator.start().await?;

    let mut task = Task::code_review("t1", vec![source.display().to_string()]);
    task.timeout_secs = 10.0;

    let handle = orchestrator.submit(task).await?;
    let result = handle.await?;

    assert_eq!(result.status, TaskStatus::Success);
    assert_eq!(result.result["files_reviewed"], 1);
    assert_eq!(result.result["total_issues"], 3);
    assert!(result.error.is_none());

    // Result idempotence: repeated reads return the same record
    let stored = orchestrator.task_result("t1").await.unwrap();
    let again = orchestrator.task_result("t1").await.unwrap();
    assert_eq!(stored.completed_at, again.completed_at);
    assert_eq!(stored.status, TaskStatus::Success);

    orchestrator.shutdown().await;
    Ok(())
}

#[tokio::test]
async fn test_priority_ordering_with_single_agent() {
    let dir = TempDir::new().unwrap();

    let worker = ScriptedWorker::new(vec![
        Rule::delayed("block", Duration::from_millis(300), &["ok"]),
        Rule::reply("", &["ok"]),
    ]);
    let orchestrator = Orchestrator::with_factory(
        test_config(dir.path(), 1),
        scripted_factory(dir.path().to_path_buf(), vec![Arc::clone(&worker)]),
    );
    orchestrator.start().await.unwrap();

    // Occupy the only agent so both tasks sit in the queue together
    let blocker = Task::builder("block").id("blocker").priority(5).build();
    let blocker_handle = orchestrator.submit(blocker).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let low = Task::builder("low_task").id("low").priority(1).build();
    let high = Task::builder("high_task").id("high").priority(9).build();
    let low_handle = orchestrator.submit(low).await.unwrap();
    let high_handle = orchestrator.submit(high).await.unwrap();

    let blocker_result = blocker_handle.await.unwrap();
    let low_result = low_handle.await.unwrap();
    let high_result = high_handle.await.unwrap();
    assert_eq!(blocker_result.status, TaskStatus::Success);
    assert_eq!(low_result.status, TaskStatus::Success);
    assert_eq!(high_result.status, TaskStatus::Success);

    let sent = worker.sent_commands().await;
    let low_pos = sent.iter().position(|c| c == "low_task").unwrap();
    let high_pos = sent.iter().position(|c| c == "high_task").unwrap();
    assert!(
        high_pos < low_pos,
        "high priority should dispatch first: {:?}",
        sent
    );

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_timeout_produces_timeout_status_and_releases_agent() {
    let dir = TempDir::new().unwrap();

    let worker = ScriptedWorker::new(vec![Rule::delayed(
        "",
        Duration::from_secs(5),
        &["too late"],
    )]);
    let orchestrator = Orchestrator::with_factory(
        test_config(dir.path(), 1),
        scripted_factory(dir.path().to_path_buf(), vec![worker]),
    );
    orchestrator.start().await.unwrap();

    let task = Task::builder("slow work")
        .id("t_slow")
        .timeout_secs(1.0)
        .build();

    let started = std::time::Instant::now();
    let handle = orchestrator.submit(task).await.unwrap();
    let result = handle.await.unwrap();

    assert_eq!(result.status, TaskStatus::Timeout);
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(result.execution_time <= Duration::from_secs(2));

    // The agent must come back to idle shortly after its own read
    // window expires
    let mut idle = false;
    for _ in 0..40 {
        tokio::time::sleep(Duration::from_millis(100)).await;
        let status = orchestrator.agent_status().await;
        if status.values().any(|view| view.state == AgentState::Idle) {
            idle = true;
            break;
        }
    }
    assert!(idle, "agent did not return to idle after timeout");

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_validation_rejections() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::with_factory(
        test_config(dir.path(), 1),
        scripted_factory(dir.path().to_path_buf(), vec![]),
    );
    orchestrator.start().await.unwrap();

    let mut bad_priority = Task::builder("work").id("bp").build();
    bad_priority.priority = 11;
    let err = orchestrator.submit(bad_priority).await.unwrap_err();
    assert!(matches!(err, ConductorError::TaskValidation { .. }));

    let bad_timeout = Task::builder("work").id("bt").timeout_secs(0.0).build();
    let err = orchestrator.submit(bad_timeout).await.unwrap_err();
    assert!(matches!(err, ConductorError::TaskValidation { .. }));

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_stats_conservation_over_batch() {
    let dir = TempDir::new().unwrap();

    let workers = vec![
        ScriptedWorker::echoing(&["ok"]),
        ScriptedWorker::echoing(&["ok"]),
    ];
    let orchestrator = Orchestrator::with_factory(
        test_config(dir.path(), 2),
        scripted_factory(dir.path().to_path_buf(), workers),
    );
    orchestrator.start().await.unwrap();

    let tasks: Vec<Task> = (0..6)
        .map(|i| Task::builder(format!("work {}", i)).id(format!("b{}", i)).build())
        .collect();
    let handles = orchestrator.submit_batch(tasks).await;
    let results = orchestrator.wait_for_batch(handles).await;

    assert_eq!(results.len(), 6);
    assert!(results.iter().all(|r| r.status == TaskStatus::Success));

    let stats = orchestrator.statistics().await;
    assert_eq!(stats.tasks_completed + stats.tasks_failed, 6);
    assert_eq!(stats.active_agents, 2);
    assert!(stats.avg_execution_time >= 0.0);

    orchestrator.shutdown().await;
}

#[tokio::test]
async fn test_zero_agents_fails_startup() {
    let dir = TempDir::new().unwrap();

    // Factory yields agents whose workspace path is unusable, so every
    // startup fails and the orchestrator must refuse to come up.
    let blocker = dir.path().join("not-a-dir");
    tokio::fs::write(&blocker, "file in the way").await.unwrap();

    let mut config = test_config(dir.path(), 2);
    config.agent.workspace_root = blocker.clone();

    let factory = scripted_factory(blocker, vec![]);
    let orchestrator = Orchestrator::with_factory(config, factory);

    let err = orchestrator.start().await.unwrap_err();
    assert!(matches!(err, ConductorError::AgentStartup { .. }));
}

#[tokio::test]
async fn test_startup_breaker_fails_fast_after_threshold() {
    let dir = TempDir::new().unwrap();

    let blocker = dir.path().join("blocked");
    tokio::fs::write(&blocker, "x").await.unwrap();

    let mut config = test_config(dir.path(), 5);
    config.agent.workspace_root = blocker.clone();

    let orchestrator = Orchestrator::with_factory(config, scripted_factory(blocker, vec![]));
    let err = orchestrator.start().await.unwrap_err();
    assert!(matches!(err, ConductorError::AgentStartup { .. }));

    // After three real failures the breaker opens; attempts four and
    // five were rejected without reaching the factory's agents.
    let enhanced = orchestrator.enhanced_statistics().await;
    assert_eq!(enhanced["error_handling"]["startup_breaker_state"], "open");
}

#[tokio::test]
async fn test_submit_after_shutdown_is_rejected() {
    let dir = TempDir::new().unwrap();
    let orchestrator = Orchestrator::with_factory(
        test_config(dir.path(), 1),
        scripted_factory(dir.path().to_path_buf(), vec![ScriptedWorker::echoing(&["ok"])]),
    );
    orchestrator.start().await.unwrap();
    orchestrator.shutdown().await;

    let err = orchestrator
        .submit(Task::builder("late").id("late").build())
        .await
        .unwrap_err();
    assert!(matches!(err, ConductorError::ServiceUnavailable { .. }));
}
