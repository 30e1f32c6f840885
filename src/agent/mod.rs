//! Agent lifecycle and task execution
//!
//! An agent owns one worker (container-bound process) and optionally one
//! protocol endpoint connected to the orchestrator channel. It executes
//! tasks through the kind-handler registry, answers task requests from
//! peers, and runs a periodic health-check loop.

pub mod handlers;
pub mod task;

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{error, info, warn};

pub use handlers::{HandlerContext, HandlerRegistry, KindHandler};
pub use task::{Task, TaskBuilder, TaskKind, TaskResult, TaskStatus};

use crate::channel::SocketChannel;
use crate::config::ConductorConfig;
use crate::error::{ConductorError, Result};
use crate::protocol::{AgentProtocol, MessageType};
use crate::worker::{WorkerTransport, WorkerWrapper};
use crate::workspace::WorkspaceManager;

/// Receiver id of the orchestrator on the shared channel
pub const ORCHESTRATOR_ID: &str = "orchestrator";

/// Consecutive probe failures before an agent is marked unhealthy
const HEALTH_FAILURE_LIMIT: u32 = 3;

/// Current lifecycle state of an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentState {
    Starting,
    Idle,
    Busy,
    Unhealthy,
    Stopped,
}

impl std::fmt::Display for AgentState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            AgentState::Starting => "starting",
            AgentState::Idle => "idle",
            AgentState::Busy => "busy",
            AgentState::Unhealthy => "unhealthy",
            AgentState::Stopped => "stopped",
        };
        write!(f, "{}", name)
    }
}

/// Per-agent execution counters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentStats {
    pub completed: u64,
    pub failed: u64,
    pub last_task_id: Option<String>,
}

/// Read-only snapshot of an agent for status endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatusView {
    pub agent_id: String,
    pub state: AgentState,
    pub current_task_id: Option<String>,
    pub consecutive_health_failures: u32,
    pub stats: AgentStats,
}

/// Runtime settings for one agent
#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub work_dir: PathBuf,
    /// Orchestrator channel path; `None` runs the agent standalone
    pub orchestrator_socket: Option<PathBuf>,
    pub health_check_interval: Duration,
    pub health_probe_timeout: Duration,
    pub environment: String,
    pub snapshots_enabled: bool,
    pub restore_on_error: bool,
    /// Keep a failed isolated workspace around for debugging
    pub preserve_on_error: bool,
}

impl AgentSettings {
    pub fn from_config(agent_id: &str, config: &ConductorConfig) -> Self {
        Self {
            work_dir: config.agent.workspace_root.join(agent_id),
            orchestrator_socket: Some(config.socket_path()),
            health_check_interval: Duration::from_secs(config.agent.health_check_interval_secs),
            health_probe_timeout: Duration::from_secs(config.agent.health_probe_timeout_secs),
            environment: config.isolated_workspace.default_environment.clone(),
            snapshots_enabled: config.isolated_workspace.enable_snapshots,
            restore_on_error: config.isolated_workspace.restore_on_error,
            preserve_on_error: config.isolated_workspace.preserve_on_error,
        }
    }

    /// Standalone settings for tests and embedded use
    pub fn standalone(work_dir: PathBuf) -> Self {
        Self {
            work_dir,
            orchestrator_socket: None,
            health_check_interval: Duration::from_secs(30),
            health_probe_timeout: Duration::from_secs(5),
            environment: "minimal".to_string(),
            snapshots_enabled: false,
            restore_on_error: false,
            preserve_on_error: false,
        }
    }
}

/// A supervised worker executing tasks on behalf of the orchestrator
pub struct Agent {
    id: String,
    settings: AgentSettings,
    worker: Arc<dyn WorkerTransport>,
    /// Present when the worker is the production container wrapper;
    /// drives container setup and teardown.
    wrapper: Option<Arc<WorkerWrapper>>,
    isolation: Option<Arc<WorkspaceManager>>,
    registry: Arc<HandlerRegistry>,
    protocol: RwLock<Option<Arc<AgentProtocol>>>,
    state: RwLock<AgentState>,
    current_task: RwLock<Option<String>>,
    running: Arc<AtomicBool>,
    health_failures: AtomicU32,
    stats: RwLock<AgentStats>,
    /// Serializes task execution on this agent
    exec_lock: Mutex<()>,
}

impl Agent {
    /// Agent backed by the production container worker
    pub fn new(
        id: impl Into<String>,
        settings: AgentSettings,
        wrapper: Arc<WorkerWrapper>,
        isolation: Option<Arc<WorkspaceManager>>,
    ) -> Self {
        let worker: Arc<dyn WorkerTransport> = Arc::clone(&wrapper) as Arc<dyn WorkerTransport>;
        Self::with_transport(id, settings, worker, Some(wrapper), isolation)
    }

    /// Agent over an arbitrary worker transport (tests, embedding)
    pub fn with_transport(
        id: impl Into<String>,
        settings: AgentSettings,
        worker: Arc<dyn WorkerTransport>,
        wrapper: Option<Arc<WorkerWrapper>>,
        isolation: Option<Arc<WorkspaceManager>>,
    ) -> Self {
        Self {
            id: id.into(),
            settings,
            worker,
            wrapper,
            isolation,
            registry: Arc::new(HandlerRegistry::with_defaults()),
            protocol: RwLock::new(None),
            state: RwLock::new(AgentState::Starting),
            current_task: RwLock::new(None),
            running: Arc::new(AtomicBool::new(false)),
            health_failures: AtomicU32::new(0),
            stats: RwLock::new(AgentStats::default()),
            exec_lock: Mutex::new(()),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub async fn state(&self) -> AgentState {
        *self.state.read().await
    }

    /// Atomically reserve this agent for dispatch. Returns false when it
    /// is not idle.
    pub async fn try_reserve(&self) -> bool {
        let mut state = self.state.write().await;
        if *state == AgentState::Idle {
            *state = AgentState::Busy;
            true
        } else {
            false
        }
    }

    /// Start the agent: workspace, container, protocol, worker, loops
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(agent = %self.id, "starting agent");
        *self.state.write().await = AgentState::Starting;

        tokio::fs::create_dir_all(&self.settings.work_dir)
            .await
            .map_err(|e| {
                ConductorError::agent_startup(self.id.clone(), "failed to create workspace")
                    .with_source(e)
            })?;

        if let Some(isolation) = &self.isolation {
            isolation
                .create(&self.id, &self.settings.environment)
                .await
                .map_err(|e| {
                    ConductorError::agent_startup(self.id.clone(), "workspace isolation failed")
                        .with_source(e)
                })?;
        } else if let Some(wrapper) = &self.wrapper {
            wrapper.setup().await.map_err(|e| {
                ConductorError::agent_startup(self.id.clone(), "container setup failed")
                    .with_source(e)
            })?;
        }

        // Connect to the orchestrator; a failure here is not fatal, the
        // agent keeps working in standalone mode.
        if let Some(socket) = &self.settings.orchestrator_socket {
            match SocketChannel::connect(socket).await {
                Ok(channel) => {
                    let protocol = Arc::new(AgentProtocol::new(self.id.clone(), Arc::new(channel)));
                    self.register_task_request_handler(&protocol).await;
                    *self.protocol.write().await = Some(Arc::clone(&protocol));
                }
                Err(e) => {
                    warn!(agent = %self.id, "failed to connect to orchestrator: {}", e);
                }
            }
        }

        if let Some(wrapper) = &self.wrapper {
            wrapper.start_worker(true).await.map_err(|e| {
                ConductorError::agent_startup(self.id.clone(), "worker startup failed")
                    .with_source(e)
            })?;
        }

        self.running.store(true, Ordering::SeqCst);
        *self.state.write().await = AgentState::Idle;

        if let Some(protocol) = self.protocol.read().await.clone() {
            // Announce readiness; this also registers the agent as a
            // peer on the server side of the channel.
            let _ = protocol
                .send_status(
                    ORCHESTRATOR_ID,
                    serde_json::json!({ "state": "idle", "agent_id": self.id }),
                )
                .await;
            tokio::spawn(protocol.run(Arc::clone(&self.running)));
        }

        let health_agent = Arc::clone(self);
        tokio::spawn(async move {
            health_agent.health_check_loop().await;
        });

        info!(agent = %self.id, "agent started");
        Ok(())
    }

    async fn register_task_request_handler(self: &Arc<Self>, protocol: &Arc<AgentProtocol>) {
        let agent = Arc::clone(self);
        let protocol_for_handler = Arc::clone(protocol);
        protocol
            .register_handler(MessageType::TaskRequest, move |message| {
                let agent = Arc::clone(&agent);
                let protocol = Arc::clone(&protocol_for_handler);
                async move {
                    let task: Task = match serde_json::from_value(message.payload.clone()) {
                        Ok(task) => task,
                        Err(e) => {
                            warn!(agent = %agent.id, "malformed task request: {}", e);
                            let _ = protocol
                                .send_response(
                                    &message,
                                    serde_json::json!({
                                        "status": "failed",
                                        "error": format!("malformed task request: {}", e),
                                    }),
                                )
                                .await;
                            return;
                        }
                    };

                    info!(agent = %agent.id, task = %task.id, peer = %message.sender_id,
                        "executing task for peer");
                    let result = agent.execute(task).await;
                    let payload = serde_json::to_value(&result)
                        .unwrap_or_else(|_| serde_json::json!({"status": "failed"}));
                    if let Err(e) = protocol.send_response(&message, payload).await {
                        error!(agent = %agent.id, "failed to send task response: {}", e);
                    }
                }
            })
            .await;
    }

    /// Stop the agent and tear down its worker
    pub async fn stop(&self) {
        info!(agent = %self.id, "stopping agent");
        self.running.store(false, Ordering::SeqCst);
        *self.state.write().await = AgentState::Stopped;

        if let Some(isolation) = &self.isolation {
            let failed_last = self.stats.read().await.failed > 0;
            let preserve = failed_last && self.settings.preserve_on_error;
            let _ = isolation.cleanup(&self.id, preserve).await;
        }
        if let Some(wrapper) = &self.wrapper {
            wrapper.cleanup().await;
        } else {
            self.worker.stop().await;
        }

        if let Some(protocol) = self.protocol.write().await.take() {
            protocol.channel().close().await;
        }
    }

    /// Execute one task to completion. Task-level failures surface in
    /// the result status, never as errors.
    pub async fn execute(&self, task: Task) -> TaskResult {
        let _exec = self.exec_lock.lock().await;
        let started = Instant::now();

        *self.current_task.write().await = Some(task.id.clone());
        *self.state.write().await = AgentState::Busy;
        info!(agent = %self.id, task = %task.id, kind = %task.kind, "executing task");

        let ctx = HandlerContext {
            agent_id: self.id.clone(),
            work_dir: self.settings.work_dir.clone(),
            worker: Arc::clone(&self.worker),
            isolation: self.isolation.clone(),
            snapshots_enabled: self.settings.snapshots_enabled,
            restore_on_error: self.settings.restore_on_error,
        };

        let outcome = handlers::run_task(&self.registry, &task, &ctx).await;
        let elapsed = started.elapsed();

        let result = match outcome {
            Ok(value) => TaskResult::success(&task.id, &self.id, value, elapsed),
            Err(e) => {
                error!(agent = %self.id, task = %task.id, "task failed: {}", e);
                TaskResult::failed(&task.id, &self.id, e.to_string(), elapsed)
            }
        };

        {
            let mut stats = self.stats.write().await;
            if result.is_success() {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
            stats.last_task_id = Some(task.id.clone());
        }

        *self.current_task.write().await = None;
        {
            let mut state = self.state.write().await;
            if *state == AgentState::Busy {
                *state = AgentState::Idle;
            }
        }

        result
    }

    /// Periodic liveness probe against the worker process
    async fn health_check_loop(self: Arc<Self>) {
        let mut interval = tokio::time::interval(self.settings.health_check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick fires immediately; skip it so a freshly started
        // worker is not probed mid-boot.
        interval.tick().await;

        while self.running.load(Ordering::SeqCst) {
            interval.tick().await;
            if !self.running.load(Ordering::SeqCst) {
                break;
            }
            // Never interleave probe output with task output
            if self.current_task.read().await.is_some() {
                continue;
            }

            let healthy = match self.worker.send("echo health_check").await {
                Ok(()) => {
                    let outputs = self
                        .worker
                        .read_output(self.settings.health_probe_timeout)
                        .await;
                    !outputs.is_empty()
                }
                Err(e) => {
                    warn!(agent = %self.id, "health probe send failed: {}", e);
                    false
                }
            };

            if healthy {
                self.health_failures.store(0, Ordering::SeqCst);
                continue;
            }

            let failures = self.health_failures.fetch_add(1, Ordering::SeqCst) + 1;
            warn!(agent = %self.id, failures, "health check returned no output");

            if failures >= HEALTH_FAILURE_LIMIT {
                error!(agent = %self.id, "agent marked unhealthy");
                *self.state.write().await = AgentState::Unhealthy;

                if let Some(protocol) = self.protocol.read().await.clone() {
                    let _ = protocol
                        .send_status(
                            ORCHESTRATOR_ID,
                            serde_json::json!({
                                "state": "unhealthy",
                                "agent_id": self.id,
                                "consecutive_failures": failures,
                            }),
                        )
                        .await;
                }
            }
        }
    }

    /// Release a reservation made with [`try_reserve`] without running
    /// a task.
    ///
    /// [`try_reserve`]: Agent::try_reserve
    pub async fn release(&self) {
        let mut state = self.state.write().await;
        if *state == AgentState::Busy {
            *state = AgentState::Idle;
        }
    }

    /// Force-stop the worker process; used by the orchestrator after
    /// persistent deadline overruns.
    pub async fn kill_worker(&self) {
        warn!(agent = %self.id, "force-stopping worker");
        self.worker.stop().await;
    }

    pub async fn status(&self) -> AgentStatusView {
        AgentStatusView {
            agent_id: self.id.clone(),
            state: *self.state.read().await,
            current_task_id: self.current_task.read().await.clone(),
            consecutive_health_failures: self.health_failures.load(Ordering::SeqCst),
            stats: self.stats.read().await.clone(),
        }
    }
}
