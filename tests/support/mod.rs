//! Shared helpers for integration tests: scripted worker transports and
//! orchestrator construction without a container runtime.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use conductor::agent::{Agent, AgentSettings};
use conductor::config::ConductorConfig;
use conductor::error::{ConductorError, Result};
use conductor::orchestrator::AgentFactory;
use conductor::worker::{OutputLine, StreamTag, WorkerTransport};

const GRACE: Duration = Duration::from_millis(200);

/// One scripted response: commands starting with `prefix` produce
/// `lines` after `delay`; `fail_send` simulates a dead worker stdin.
#[derive(Clone)]
pub struct Rule {
    pub prefix: String,
    pub delay: Duration,
    pub lines: Vec<String>,
    pub fail_send: bool,
}

impl Rule {
    pub fn reply(prefix: &str, lines: &[&str]) -> Self {
        Self {
            prefix: prefix.to_string(),
            delay: Duration::ZERO,
            lines: lines.iter().map(|s| s.to_string()).collect(),
            fail_send: false,
        }
    }

    pub fn delayed(prefix: &str, delay: Duration, lines: &[&str]) -> Self {
        Self {
            delay,
            ..Self::reply(prefix, lines)
        }
    }

    pub fn broken(prefix: &str) -> Self {
        Self {
            prefix: prefix.to_string(),
            delay: Duration::ZERO,
            lines: Vec::new(),
            fail_send: true,
        }
    }
}

/// Worker double that replays scripted output per command
pub struct ScriptedWorker {
    rules: Vec<Rule>,
    pub sent: Mutex<Vec<String>>,
    tx: mpsc::Sender<OutputLine>,
    rx: Mutex<mpsc::Receiver<OutputLine>>,
    running: AtomicBool,
}

impl ScriptedWorker {
    pub fn new(rules: Vec<Rule>) -> Arc<Self> {
        let (tx, rx) = mpsc::channel(256);
        Arc::new(Self {
            rules,
            sent: Mutex::new(Vec::new()),
            tx,
            rx: Mutex::new(rx),
            running: AtomicBool::new(true),
        })
    }

    /// Worker that answers every command with the given lines
    pub fn echoing(lines: &[&str]) -> Arc<Self> {
        Self::new(vec![Rule::reply("", lines)])
    }

    /// Worker whose stdin is dead; every send fails
    pub fn broken() -> Arc<Self> {
        Self::new(vec![Rule::broken("")])
    }

    fn rule_for(&self, command: &str) -> Option<Rule> {
        self.rules
            .iter()
            .find(|rule| command.starts_with(&rule.prefix))
            .cloned()
    }

    pub async fn sent_commands(&self) -> Vec<String> {
        self.sent.lock().await.clone()
    }
}

#[async_trait]
impl WorkerTransport for ScriptedWorker {
    async fn send(&self, command: &str) -> Result<()> {
        self.sent.lock().await.push(command.to_string());

        let Some(rule) = self.rule_for(command) else {
            return Ok(());
        };
        if rule.fail_send {
            return Err(ConductorError::container_exec("scripted", "worker stdin closed"));
        }

        let tx = self.tx.clone();
        tokio::spawn(async move {
            if !rule.delay.is_zero() {
                tokio::time::sleep(rule.delay).await;
            }
            for line in rule.lines {
                let _ = tx
                    .send(OutputLine {
                        tag: StreamTag::Stdout,
                        line,
                    })
                    .await;
            }
        });
        Ok(())
    }

    async fn read_output(&self, timeout: Duration) -> Vec<OutputLine> {
        let mut rx = self.rx.lock().await;
        let mut outputs = Vec::new();

        match tokio::time::timeout(timeout, rx.recv()).await {
            Ok(Some(line)) => outputs.push(line),
            _ => return outputs,
        }
        loop {
            match tokio::time::timeout(GRACE, rx.recv()).await {
                Ok(Some(line)) => outputs.push(line),
                _ => break,
            }
        }
        outputs
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

/// Standalone agent over a scripted worker
pub fn scripted_agent(agent_id: &str, base: &Path, worker: Arc<ScriptedWorker>) -> Arc<Agent> {
    let settings = AgentSettings::standalone(base.join(agent_id));
    Arc::new(Agent::with_transport(agent_id, settings, worker, None, None))
}

/// Orchestrator configuration pointing every path into the test dir
pub fn test_config(dir: &Path, num_agents: usize) -> ConductorConfig {
    let mut config = ConductorConfig::default();
    config.num_agents = num_agents;
    config.max_workers = 4;
    config.task_timeout_secs = 30;
    config.socket_path = Some(dir.join("orchestrator.sock"));
    config.agent.workspace_root = dir.join("workspaces");
    config
}

/// Agent factory handing out pre-built scripted workers in order
pub fn scripted_factory(base: PathBuf, workers: Vec<Arc<ScriptedWorker>>) -> AgentFactory {
    let remaining = std::sync::Mutex::new(workers);
    Arc::new(move |agent_id: &str| {
        let worker = {
            let mut guard = remaining.lock().unwrap();
            if guard.is_empty() {
                ScriptedWorker::echoing(&["ok"])
            } else {
                guard.remove(0)
            }
        };
        let settings = AgentSettings::standalone(base.join(agent_id));
        Arc::new(Agent::with_transport(agent_id, settings, worker, None, None))
    })
}
