//! Agent-to-orchestrator messaging over the socket channel

mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use conductor::agent::{Agent, AgentSettings, Task, TaskResult, TaskStatus};
use conductor::channel::SocketChannel;
use conductor::protocol::{AgentProtocol, MessageType};

use support::ScriptedWorker;

async fn orchestrator_endpoint(
    path: &std::path::Path,
) -> (Arc<AgentProtocol>, Arc<AtomicBool>) {
    let channel = Arc::new(SocketChannel::bind(path).await.unwrap());
    let protocol = Arc::new(AgentProtocol::new("orchestrator", channel));
    let running = Arc::new(AtomicBool::new(true));
    tokio::spawn(Arc::clone(&protocol).run(Arc::clone(&running)));
    (protocol, running)
}

async fn connected_agent(
    dir: &TempDir,
    socket: &std::path::Path,
    worker: Arc<ScriptedWorker>,
) -> Arc<Agent> {
    let mut settings = AgentSettings::standalone(dir.path().join("agent_000"));
    settings.orchestrator_socket = Some(socket.to_path_buf());
    let agent = Arc::new(Agent::with_transport("agent_000", settings, worker, None, None));
    agent.start().await.unwrap();
    agent
}

#[tokio::test]
async fn test_task_request_gets_correlated_response() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("orch.sock");

    let (protocol, running) = orchestrator_endpoint(&socket).await;
    let worker = ScriptedWorker::echoing(&["done"]);
    let agent = connected_agent(&dir, &socket, worker).await;

    // Wait until the agent's readiness announcement registered it
    for _ in 0..50 {
        if protocol.channel().peer_count().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let task = Task::builder("echo done").id("t_remote").timeout_secs(5.0).build();
    let reply = protocol
        .request(
            "agent_000",
            serde_json::to_value(&task).unwrap(),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(reply.message_type, MessageType::TaskResponse);
    assert!(reply.correlation_id.is_some());
    assert_eq!(reply.sender_id, "agent_000");

    let result: TaskResult = serde_json::from_value(reply.payload).unwrap();
    assert_eq!(result.task_id, "t_remote");
    assert_eq!(result.agent_id, "agent_000");
    assert_eq!(result.status, TaskStatus::Success);

    running.store(false, Ordering::SeqCst);
    agent.stop().await;
}

#[tokio::test]
async fn test_malformed_task_request_yields_failure_response() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("orch.sock");

    let (protocol, running) = orchestrator_endpoint(&socket).await;
    let worker = ScriptedWorker::echoing(&["done"]);
    let agent = connected_agent(&dir, &socket, worker).await;

    for _ in 0..50 {
        if protocol.channel().peer_count().await > 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let reply = protocol
        .request(
            "agent_000",
            serde_json::json!({"this_is": "not a task"}),
            Duration::from_secs(5),
        )
        .await
        .unwrap();

    assert_eq!(reply.message_type, MessageType::TaskResponse);
    assert_eq!(reply.payload["status"], "failed");

    running.store(false, Ordering::SeqCst);
    agent.stop().await;
}

#[tokio::test]
async fn test_request_to_unknown_peer_fails() {
    let dir = TempDir::new().unwrap();
    let socket = dir.path().join("orch.sock");

    let (protocol, running) = orchestrator_endpoint(&socket).await;

    let err = protocol
        .request(
            "agent_404",
            serde_json::json!({}),
            Duration::from_secs(1),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        conductor::error::ConductorError::Communication { .. }
    ));

    running.store(false, Ordering::SeqCst);
}
