//! Multi-agent orchestrator
//!
//! Owns the agent pool, validates and dispatches tasks through a
//! priority queue and a bounded worker pool, enforces deadlines, records
//! results, and delegates parallel tasks to the coordinator. Agent
//! startup runs behind a circuit breaker; resource incidents gate new
//! admissions.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{oneshot, Mutex, RwLock, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::agent::{
    Agent, AgentSettings, AgentStatusView, Task, TaskResult, TaskStatus, ORCHESTRATOR_ID,
};
use crate::channel::SocketChannel;
use crate::config::ConductorConfig;
use crate::coordination::{
    AgentCapability, AgentRole, CoordinationRegistry, CoordinationStrategy, Coordinator,
};
use crate::error::{ConductorError, Result};
use crate::protocol::{AgentProtocol, MessageType};
use crate::queue::{InMemoryQueue, QueueStats, ResultStore, TaskQueue};
use crate::recovery::{CircuitBreaker, ErrorContext, ErrorMonitor};
use crate::runtime::ContainerRuntime;
use crate::tokens::{TokenLedger, TokenUsage};
use crate::worker::{WorkerConfig, WorkerWrapper};
use crate::workspace::WorkspaceManager;

const DISPATCH_POLL: Duration = Duration::from_millis(200);
const AGENT_WAIT_POLL: Duration = Duration::from_millis(50);
const STATS_REPORT_INTERVAL: Duration = Duration::from_secs(60);
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Builds one agent for the pool; overridable for embedding and tests
pub type AgentFactory = Arc<dyn Fn(&str) -> Arc<Agent> + Send + Sync>;

/// Aggregate execution counters
#[derive(Debug, Clone, Default)]
struct OrchestratorStats {
    completed: u64,
    failed: u64,
    total_execution_time: f64,
}

/// Read-only statistics snapshot
#[derive(Debug, Clone, serde::Serialize)]
pub struct StatisticsView {
    pub runtime_secs: f64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub avg_execution_time: f64,
    pub total_execution_time: f64,
    pub active_agents: usize,
    pub total_agents: usize,
    pub queue: QueueStats,
}

/// Shared context threaded through orchestrator components instead of
/// globals: token accounting and the error monitor.
pub struct Deps {
    pub ledger: Arc<TokenLedger>,
    pub monitor: Arc<ErrorMonitor>,
}

impl Default for Deps {
    fn default() -> Self {
        Self {
            ledger: TokenLedger::new(),
            monitor: Arc::new(ErrorMonitor::new("orchestrator")),
        }
    }
}

pub struct Orchestrator {
    config: ConductorConfig,
    channel: RwLock<Option<Arc<SocketChannel>>>,
    protocol: RwLock<Option<Arc<AgentProtocol>>>,
    agents: RwLock<HashMap<String, Arc<Agent>>>,
    results: RwLock<HashMap<String, TaskResult>>,
    stats: Mutex<OrchestratorStats>,
    started_at: Mutex<Option<Instant>>,
    pool: Arc<Semaphore>,
    queue: Arc<dyn TaskQueue>,
    pending_callers: Mutex<HashMap<String, oneshot::Sender<TaskResult>>>,
    /// Optional mirror of completed results into the shared store
    result_store: RwLock<Option<Arc<ResultStore>>>,
    startup_breaker: CircuitBreaker,
    registry: Arc<CoordinationRegistry>,
    agent_factory: AgentFactory,
    deps: Deps,
    accepting: AtomicBool,
    running: Arc<AtomicBool>,
}

impl Orchestrator {
    /// Orchestrator with the production container-backed agent factory
    pub fn new(config: ConductorConfig) -> Result<Arc<Self>> {
        config.validate()?;
        let factory = Self::container_agent_factory(&config)?;
        Ok(Self::with_factory(config, factory))
    }

    /// Orchestrator with a custom agent factory
    pub fn with_factory(config: ConductorConfig, agent_factory: AgentFactory) -> Arc<Self> {
        let queue: Arc<dyn TaskQueue> = Arc::new(InMemoryQueue::new());
        Self::assemble(config, agent_factory, queue)
    }

    /// Orchestrator over an explicit queue backend
    pub fn with_queue(
        config: ConductorConfig,
        agent_factory: AgentFactory,
        queue: Arc<dyn TaskQueue>,
    ) -> Arc<Self> {
        Self::assemble(config, agent_factory, queue)
    }

    fn assemble(
        config: ConductorConfig,
        agent_factory: AgentFactory,
        queue: Arc<dyn TaskQueue>,
    ) -> Arc<Self> {
        let pool = Arc::new(Semaphore::new(config.max_workers));
        Arc::new(Self {
            startup_breaker: CircuitBreaker::new(
                "agent_startup",
                3,
                2,
                Duration::from_secs(30),
            ),
            pool,
            queue,
            channel: RwLock::new(None),
            protocol: RwLock::new(None),
            agents: RwLock::new(HashMap::new()),
            results: RwLock::new(HashMap::new()),
            stats: Mutex::new(OrchestratorStats::default()),
            started_at: Mutex::new(None),
            pending_callers: Mutex::new(HashMap::new()),
            result_store: RwLock::new(None),
            registry: Arc::new(CoordinationRegistry::new()),
            agent_factory,
            deps: Deps::default(),
            accepting: AtomicBool::new(false),
            running: Arc::new(AtomicBool::new(false)),
            config,
        })
    }

    fn container_agent_factory(config: &ConductorConfig) -> Result<AgentFactory> {
        let runtime = ContainerRuntime::new(&config.container.program);
        let isolation = if config.isolated_workspace.enabled {
            Some(Arc::new(WorkspaceManager::new(
                runtime.clone(),
                config.isolated_workspace.clone(),
                config.agent.workspace_root.join("isolated"),
            )))
        } else {
            None
        };
        let config = config.clone();

        Ok(Arc::new(move |agent_id: &str| {
            let settings = AgentSettings::from_config(agent_id, &config);
            let worker_config = WorkerConfig::from_settings(
                agent_id,
                settings.work_dir.clone(),
                &config.container,
            );
            let wrapper = Arc::new(WorkerWrapper::new(
                worker_config,
                ContainerRuntime::new(&config.container.program),
            ));
            Arc::new(Agent::new(agent_id, settings, wrapper, isolation.clone()))
        }))
    }

    pub fn config(&self) -> &ConductorConfig {
        &self.config
    }

    pub fn deps(&self) -> &Deps {
        &self.deps
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    /// Mirror completed results into a shared store
    pub async fn attach_result_store(&self, store: Arc<ResultStore>) {
        *self.result_store.write().await = Some(store);
    }

    /// Bring up the server channel, the agent pool, and the background
    /// loops. Fails only when no agent at all could be started.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        info!(
            num_agents = self.config.num_agents,
            max_workers = self.config.max_workers,
            "starting orchestrator"
        );
        *self.started_at.lock().await = Some(Instant::now());
        self.running.store(true, Ordering::SeqCst);

        let socket_path = self.config.socket_path();
        let channel = Arc::new(SocketChannel::bind(&socket_path).await.map_err(|e| {
            self.deps.monitor.observe_error(
                "bind_channel",
                &e,
                &ErrorContext::new("orchestrator", "start"),
            );
            e
        })?);
        let protocol = Arc::new(AgentProtocol::new(ORCHESTRATOR_ID, Arc::clone(&channel)));
        self.register_status_handler(&protocol).await;
        tokio::spawn(Arc::clone(&protocol).run(Arc::clone(&self.running)));
        *self.channel.write().await = Some(channel);
        *self.protocol.write().await = Some(protocol);

        let mut started = 0usize;
        for i in 0..self.config.num_agents {
            let agent_id = format!("agent_{:03}", i);
            let agent = (self.agent_factory)(&agent_id);

            let startup = self
                .startup_breaker
                .call(|| async { agent.start().await })
                .await;

            match startup {
                Ok(()) => {
                    self.registry
                        .register(AgentCapability::new(&agent_id, AgentRole::Sub));
                    self.agents.write().await.insert(agent_id.clone(), agent);
                    started += 1;
                    info!(agent = %agent_id, "agent started");
                }
                Err(e) => {
                    let ctx = ErrorContext::new(agent_id.clone(), "start").startup_phase();
                    self.deps.monitor.observe_error("agent_start", &e, &ctx);
                    warn!(agent = %agent_id, "agent failed to start: {}", e);
                }
            }
        }

        if started == 0 {
            let err = ConductorError::agent_startup("orchestrator", "no agents could be started");
            error!("{}", err);
            return Err(err);
        }
        info!(started, requested = self.config.num_agents, "agent pool ready");

        self.accepting.store(true, Ordering::SeqCst);
        self.spawn_dispatcher();
        self.spawn_stats_reporter();
        self.spawn_queue_janitor();

        Ok(())
    }

    /// Periodic lease recovery for queue backends that need it
    fn spawn_queue_janitor(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            interval.tick().await;
            while orchestrator.running.load(Ordering::SeqCst) {
                interval.tick().await;
                match orchestrator.queue.maintain().await {
                    Ok(0) => {}
                    Ok(recovered) => info!(recovered, "queue janitor recovered tasks"),
                    Err(e) => warn!("queue maintenance failed: {}", e),
                }
            }
        });
    }

    async fn register_status_handler(self: &Arc<Self>, protocol: &Arc<AgentProtocol>) {
        let orchestrator = Arc::clone(self);
        protocol
            .register_handler(MessageType::StatusUpdate, move |message| {
                let orchestrator = Arc::clone(&orchestrator);
                async move {
                    let state = message.payload["state"].as_str().unwrap_or("");
                    debug!(agent = %message.sender_id, state, "agent status update");
                    if state == "unhealthy" {
                        warn!(agent = %message.sender_id, "agent reported unhealthy");
                        let ctx = ErrorContext::new(message.sender_id.clone(), "health_check")
                            .consecutive_failures(
                                message.payload["consecutive_failures"].as_u64().unwrap_or(0)
                                    as u32,
                            );
                        let err = ConductorError::container_exec(
                            message.sender_id.clone(),
                            "health checks failing",
                        );
                        orchestrator
                            .deps
                            .monitor
                            .observe_error("health_check", &err, &ctx);
                    }
                }
            })
            .await;
    }

    /// Single queue consumer. An idle agent is reserved before any task
    /// is claimed, so the highest-priority pending task is always the
    /// one dispatched when capacity frees up.
    fn spawn_dispatcher(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            while orchestrator.running.load(Ordering::SeqCst) {
                let permit = match Arc::clone(&orchestrator.pool).acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => break,
                };

                let Some(agent) = orchestrator.reserve_idle_agent().await else {
                    break;
                };

                let Some(task) = orchestrator.queue.dequeue(DISPATCH_POLL).await else {
                    agent.release().await;
                    continue;
                };

                // Routing feedback: prefer the most token-efficient
                // agent for this kind when it happens to be idle too.
                let agent = orchestrator.prefer_efficient_agent(agent, &task).await;

                let runner = Arc::clone(&orchestrator);
                tokio::spawn(async move {
                    let result = runner.execute_with_deadline(&agent, task.clone()).await;
                    runner.finish_task(&task, result).await;
                    drop(permit);
                });
            }
        });
    }

    fn spawn_stats_reporter(self: &Arc<Self>) {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(STATS_REPORT_INTERVAL);
            interval.tick().await;
            while orchestrator.running.load(Ordering::SeqCst) {
                interval.tick().await;
                let stats = orchestrator.statistics().await;
                info!(
                    completed = stats.tasks_completed,
                    failed = stats.tasks_failed,
                    active_agents = stats.active_agents,
                    pending = stats.queue.pending,
                    "orchestrator statistics"
                );
            }
        });
    }

    /// Reserve any idle agent, waiting while everything is busy.
    /// Returns `None` only at shutdown.
    async fn reserve_idle_agent(&self) -> Option<Arc<Agent>> {
        loop {
            if !self.running.load(Ordering::SeqCst) {
                return None;
            }

            let agents: Vec<Arc<Agent>> = self.agents.read().await.values().cloned().collect();
            for agent in agents {
                if agent.try_reserve().await {
                    return Some(agent);
                }
            }

            tokio::time::sleep(AGENT_WAIT_POLL).await;
        }
    }

    /// Swap the reserved agent for the ledger's most efficient one for
    /// this kind, when that agent exists and is idle.
    async fn prefer_efficient_agent(&self, reserved: Arc<Agent>, task: &Task) -> Arc<Agent> {
        let Some(preferred_id) = self.deps.ledger.best_agent_for(task.kind).await else {
            return reserved;
        };
        if preferred_id == reserved.id() {
            return reserved;
        }
        let Some(preferred) = self.agents.read().await.get(&preferred_id).cloned() else {
            return reserved;
        };
        if preferred.try_reserve().await {
            reserved.release().await;
            debug!(task = %task.id, agent = %preferred_id, "routed to efficient agent");
            preferred
        } else {
            reserved
        }
    }

    /// Run one task on one agent under the effective deadline. On
    /// expiry the dispatcher side is cancelled and the agent stays busy
    /// until its own execution winds down (or its worker is killed).
    async fn execute_with_deadline(&self, agent: &Arc<Agent>, task: Task) -> TaskResult {
        let deadline = task
            .timeout()
            .min(Duration::from_secs(self.config.task_timeout_secs));
        let task_id = task.id.clone();
        let agent_id = agent.id().to_string();

        let exec_agent = Arc::clone(agent);
        let mut exec_handle = tokio::spawn(async move { exec_agent.execute(task).await });

        match tokio::time::timeout(deadline, &mut exec_handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_err)) => {
                error!(task = %task_id, "execution task panicked: {}", join_err);
                TaskResult::failed(&task_id, &agent_id, "execution aborted", deadline)
            }
            Err(_) => {
                warn!(task = %task_id, agent = %agent_id, "task deadline exceeded");
                let err = ConductorError::task_timeout(task_id.clone(), deadline);
                self.deps.monitor.observe_error(
                    "execute_task",
                    &err,
                    &ErrorContext::new(agent_id.clone(), "execute"),
                );

                // Let the agent-side execution wind down on its own; if
                // it overruns a second deadline, kill the worker.
                let reap_agent = Arc::clone(agent);
                tokio::spawn(async move {
                    if tokio::time::timeout(deadline, &mut exec_handle).await.is_err() {
                        warn!(agent = %reap_agent.id(), "worker unresponsive after timeout, stopping it");
                        reap_agent.kill_worker().await;
                        let _ = exec_handle.await;
                    }
                });

                TaskResult::timeout(&task_id, &agent_id, deadline)
            }
        }
    }

    /// Record a finished task: results map, stats, queue ack, caller
    /// notification, token accounting.
    async fn finish_task(&self, task: &Task, result: TaskResult) {
        match result.status {
            TaskStatus::Failed | TaskStatus::Timeout => {
                let _ = self.queue.fail(&task.id, result.error.as_deref().unwrap_or("")).await;
            }
            _ => {
                let _ = self.queue.complete(&task.id).await;
            }
        }

        {
            let mut stats = self.stats.lock().await;
            if result.status == TaskStatus::Success || result.status == TaskStatus::Partial {
                stats.completed += 1;
            } else {
                stats.failed += 1;
            }
            stats.total_execution_time += result.execution_time.as_secs_f64();
        }

        self.record_token_usage(task, &result).await;

        if let Some(store) = self.result_store.read().await.clone() {
            store.record(&result).await;
        }

        if self.config.enable_evaluation && result.status == TaskStatus::Success {
            debug!(task = %task.id, "scheduling evaluation pass");
        }

        self.results
            .write()
            .await
            .insert(task.id.clone(), result.clone());

        if let Some(tx) = self.pending_callers.lock().await.remove(&task.id) {
            let _ = tx.send(result);
        }
    }

    /// Pull token counts out of the worker payload when present
    async fn record_token_usage(&self, task: &Task, result: &TaskResult) {
        let Some(usage) = result.result.get("token_usage") else {
            return;
        };
        let input = usage.get("input_tokens").and_then(|v| v.as_u64());
        let output = usage.get("output_tokens").and_then(|v| v.as_u64());
        if let (Some(input_tokens), Some(output_tokens)) = (input, output) {
            let record = TokenUsage::new(
                &task.id,
                &result.agent_id,
                crate::tokens::ModelTier::Standard,
                input_tokens,
                output_tokens,
            )
            .with_kind(task.kind)
            .with_success(result.is_success());
            self.deps.ledger.record(record).await;
        }
    }

    /// Validate and admit one task. The returned handle resolves to the
    /// task's result; the caller never blocks beyond the enqueue.
    pub async fn submit(self: &Arc<Self>, task: Task) -> Result<JoinHandle<TaskResult>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConductorError::service_unavailable(
                "orchestrator",
                "stopped",
                Duration::ZERO,
            ));
        }
        if self.deps.monitor.resource_incident_open() {
            return Err(ConductorError::service_unavailable(
                "orchestrator",
                "resource_incident",
                Duration::from_secs(30),
            ));
        }
        task.validate()?;

        if task.parallel {
            return Ok(self.spawn_coordination(task, CoordinationStrategy::PeerToPeer));
        }

        let (tx, rx) = oneshot::channel();
        self.pending_callers.lock().await.insert(task.id.clone(), tx);

        let task_id = task.id.clone();
        // Enqueue is an outward call when the queue lives in a shared
        // store; transient failures go through the adaptive retry layer.
        let retry_stats = self.deps.monitor.retry();
        let enqueued = crate::recovery::retry::retry_with(&retry_stats, "enqueue", || {
            let task = task.clone();
            async { self.queue.enqueue(task).await }
        })
        .await;
        if let Err(e) = enqueued {
            self.pending_callers.lock().await.remove(&task_id);
            return Err(e);
        }
        debug!(task = %task_id, "task enqueued");

        Ok(tokio::spawn(async move {
            rx.await.unwrap_or_else(|_| {
                TaskResult::failed(task_id, ORCHESTRATOR_ID, "orchestrator stopped", Duration::ZERO)
            })
        }))
    }

    /// Submit a task under an explicit coordination strategy
    pub async fn submit_with_strategy(
        self: &Arc<Self>,
        task: Task,
        strategy: CoordinationStrategy,
    ) -> Result<JoinHandle<TaskResult>> {
        if !self.accepting.load(Ordering::SeqCst) {
            return Err(ConductorError::service_unavailable(
                "orchestrator",
                "stopped",
                Duration::ZERO,
            ));
        }
        task.validate()?;
        Ok(self.spawn_coordination(task, strategy))
    }

    fn spawn_coordination(
        self: &Arc<Self>,
        task: Task,
        strategy: CoordinationStrategy,
    ) -> JoinHandle<TaskResult> {
        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let result = orchestrator.run_coordination(&task, strategy).await;
            orchestrator.finish_task(&task, result.clone()).await;
            result
        })
    }

    async fn run_coordination(
        self: &Arc<Self>,
        task: &Task,
        strategy: CoordinationStrategy,
    ) -> TaskResult {
        let agents: Vec<Arc<Agent>> = self.agents.read().await.values().cloned().collect();
        let Some(lead) = agents.first().cloned() else {
            return TaskResult::failed(&task.id, ORCHESTRATOR_ID, "no agents available", Duration::ZERO);
        };
        let subs: Vec<Arc<Agent>> = agents.into_iter().skip(1).collect();

        let mut coordinator = Coordinator::new(Arc::clone(&self.registry));
        if let Some(protocol) = self.protocol.read().await.clone() {
            coordinator = coordinator.with_protocol(protocol);
        }
        match coordinator.coordinate(task, strategy, lead, subs).await {
            Ok(result) => result.into_task_result(ORCHESTRATOR_ID),
            Err(e) => {
                self.deps.monitor.observe_error(
                    "coordinate",
                    &e,
                    &ErrorContext::new("orchestrator", "coordinate"),
                );
                match e {
                    ConductorError::TaskTimeout { elapsed, .. } => {
                        TaskResult::timeout(&task.id, ORCHESTRATOR_ID, elapsed)
                    }
                    other => TaskResult::failed(
                        &task.id,
                        ORCHESTRATOR_ID,
                        other.to_string(),
                        Duration::ZERO,
                    ),
                }
            }
        }
    }

    /// Submit many tasks; submission failures become immediately
    /// resolved failure handles.
    pub async fn submit_batch(self: &Arc<Self>, tasks: Vec<Task>) -> Vec<JoinHandle<TaskResult>> {
        let mut handles = Vec::with_capacity(tasks.len());
        for task in tasks {
            let task_id = task.id.clone();
            match self.submit(task).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    warn!(task = %task_id, "batch submission rejected: {}", e);
                    handles.push(tokio::spawn(async move {
                        TaskResult::failed(task_id, ORCHESTRATOR_ID, e.to_string(), Duration::ZERO)
                    }));
                }
            }
        }
        handles
    }

    /// Gather a batch, converting panics into failure results
    pub async fn wait_for_batch(
        &self,
        handles: Vec<JoinHandle<TaskResult>>,
    ) -> Vec<TaskResult> {
        let mut results = Vec::with_capacity(handles.len());
        for handle in handles {
            match handle.await {
                Ok(result) => results.push(result),
                Err(e) => results.push(TaskResult::failed(
                    "unknown",
                    ORCHESTRATOR_ID,
                    format!("task future failed: {}", e),
                    Duration::ZERO,
                )),
            }
        }
        results
    }

    /// Per-agent status snapshot
    pub async fn agent_status(&self) -> HashMap<String, AgentStatusView> {
        let agents = self.agents.read().await;
        let mut status = HashMap::with_capacity(agents.len());
        for (agent_id, agent) in agents.iter() {
            status.insert(agent_id.clone(), agent.status().await);
        }
        status
    }

    /// Retrieve a stored task result; repeated reads return the same
    /// record.
    pub async fn task_result(&self, task_id: &str) -> Option<TaskResult> {
        self.results.read().await.get(task_id).cloned()
    }

    pub async fn statistics(&self) -> StatisticsView {
        let stats = self.stats.lock().await.clone();
        let runtime_secs = self
            .started_at
            .lock()
            .await
            .map(|at| at.elapsed().as_secs_f64())
            .unwrap_or(0.0);

        let agents = self.agents.read().await;
        let mut active = 0;
        for agent in agents.values() {
            if agent.is_running() {
                active += 1;
            }
        }

        let total_tasks = stats.completed + stats.failed;
        StatisticsView {
            runtime_secs,
            tasks_completed: stats.completed,
            tasks_failed: stats.failed,
            avg_execution_time: if total_tasks > 0 {
                stats.total_execution_time / total_tasks as f64
            } else {
                0.0
            },
            total_execution_time: stats.total_execution_time,
            active_agents: active,
            total_agents: agents.len(),
            queue: self.queue.stats().await,
        }
    }

    /// Statistics plus recovery-layer state
    pub async fn enhanced_statistics(&self) -> serde_json::Value {
        let base = self.statistics().await;
        let retry = self.deps.monitor.retry();

        serde_json::json!({
            "runtime_secs": base.runtime_secs,
            "tasks_completed": base.tasks_completed,
            "tasks_failed": base.tasks_failed,
            "avg_execution_time": base.avg_execution_time,
            "active_agents": base.active_agents,
            "total_agents": base.total_agents,
            "queue": base.queue,
            "error_handling": {
                "health_status": self.deps.monitor.health_status(),
                "startup_breaker_state": self.startup_breaker.state().await.to_string(),
                "adaptive_retry_stats": {
                    "tracked_operations": retry.tracked_operations(),
                    "data_points": retry.data_points(),
                },
            },
        })
    }

    /// Resolve a live incident by id
    pub fn resolve_incident(&self, incident_id: &str, resolution: &str) -> bool {
        self.deps.monitor.incidents().resolve(incident_id, resolution)
    }

    /// Stop accepting work, drain best-effort, then tear everything
    /// down.
    pub async fn shutdown(&self) {
        info!("shutting down orchestrator");
        self.accepting.store(false, Ordering::SeqCst);

        // Give in-flight dispatches a moment to finish
        let drained = tokio::time::timeout(SHUTDOWN_GRACE, async {
            loop {
                if self.pending_callers.lock().await.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;
        if drained.is_err() {
            warn!("shutdown grace expired with tasks still in flight");
        }

        self.running.store(false, Ordering::SeqCst);
        self.pool.close();

        // Fail any callers still waiting
        let stranded: Vec<(String, oneshot::Sender<TaskResult>)> =
            self.pending_callers.lock().await.drain().collect();
        for (task_id, tx) in stranded {
            let _ = tx.send(TaskResult::failed(
                &task_id,
                ORCHESTRATOR_ID,
                "orchestrator shut down",
                Duration::ZERO,
            ));
        }

        let agents: Vec<Arc<Agent>> = self.agents.read().await.values().cloned().collect();
        for agent in agents {
            agent.stop().await;
        }

        if let Some(channel) = self.channel.write().await.take() {
            channel.close().await;
        }

        let stats = self.statistics().await;
        info!(
            runtime_secs = stats.runtime_secs,
            completed = stats.tasks_completed,
            failed = stats.tasks_failed,
            "orchestrator stopped"
        );
    }
}
