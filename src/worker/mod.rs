//! Worker wrapper
//!
//! Owns one container and the line-oriented worker process inside it.
//! Commands go in over stdin; stdout and stderr are read by two
//! background tasks and merged into a single tagged FIFO.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, warn};

use crate::config::ContainerSettings;
use crate::error::{ConductorError, Result};
use crate::runtime::ContainerRuntime;

const OUTPUT_CAPACITY: usize = 1024;
/// After the first output line arrives, keep draining for this long
const DRAIN_GRACE: Duration = Duration::from_millis(200);
/// How long `stop` waits for the worker to exit before killing it
const STOP_GRACE: Duration = Duration::from_secs(5);

/// Which stream a line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamTag {
    Stdout,
    Stderr,
}

impl std::fmt::Display for StreamTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stdout => write!(f, "stdout"),
            Self::Stderr => write!(f, "stderr"),
        }
    }
}

/// One line of worker output with its stream tag
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub tag: StreamTag,
    pub line: String,
}

/// Seam between agents and the process that executes their commands.
/// The production implementation is [`WorkerWrapper`]; tests substitute
/// scripted transports.
#[async_trait]
pub trait WorkerTransport: Send + Sync {
    /// Write one command line to the worker's stdin
    async fn send(&self, command: &str) -> Result<()>;

    /// Drain available output: waits up to `timeout` for the first
    /// line, then keeps reading within a short grace window.
    async fn read_output(&self, timeout: Duration) -> Vec<OutputLine>;

    fn is_running(&self) -> bool;

    /// Terminate the worker process
    async fn stop(&self);
}

/// Per-worker configuration derived from the global container settings
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub agent_id: String,
    pub container_name: String,
    pub work_dir: PathBuf,
    pub image: String,
    pub memory_limit: String,
    pub cpu_limit: String,
    pub setup_commands: Vec<String>,
    pub worker_command: String,
}

impl WorkerConfig {
    pub fn from_settings(agent_id: &str, work_dir: PathBuf, settings: &ContainerSettings) -> Self {
        Self {
            agent_id: agent_id.to_string(),
            container_name: format!("conductor-agent-{}", agent_id),
            work_dir,
            image: settings.image.clone(),
            memory_limit: settings.memory_limit.clone(),
            cpu_limit: settings.cpu_limit.clone(),
            setup_commands: settings.setup_commands.clone(),
            worker_command: settings.worker_command.clone(),
        }
    }
}

/// Container-bound worker process manager
pub struct WorkerWrapper {
    config: WorkerConfig,
    runtime: ContainerRuntime,
    container_id: Mutex<Option<String>>,
    child: Mutex<Option<Child>>,
    stdin: Mutex<Option<ChildStdin>>,
    output: Mutex<Option<mpsc::Receiver<OutputLine>>>,
    running: AtomicBool,
}

impl WorkerWrapper {
    pub fn new(config: WorkerConfig, runtime: ContainerRuntime) -> Self {
        Self {
            config,
            runtime,
            container_id: Mutex::new(None),
            child: Mutex::new(None),
            stdin: Mutex::new(None),
            output: Mutex::new(None),
            running: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Destroy any stale container of the same name, create a fresh one
    /// with resource limits and the workspace mount, and install the
    /// base tooling plus the worker binary.
    pub async fn setup(&self) -> Result<String> {
        info!(agent = %self.config.agent_id, "setting up container");

        self.runtime.remove(&self.config.container_name).await;

        tokio::fs::create_dir_all(&self.config.work_dir).await?;

        let env = [(
            "CONDUCTOR_AGENT_ID".to_string(),
            self.config.agent_id.clone(),
        )];
        let container_id = self
            .runtime
            .run_detached(
                &self.config.container_name,
                &self.config.image,
                &self.config.work_dir,
                &self.config.memory_limit,
                &self.config.cpu_limit,
                &env,
            )
            .await?;

        // The runtime reports the container as created; confirm it is
        // actually accepting exec before installing anything.
        let probe = self.runtime.exec(&self.config.container_name, "echo ready").await?;
        if !probe.success() {
            return Err(ConductorError::container_setup(
                &self.config.container_name,
                format!("container not running: {}", probe.stderr.trim()),
            ));
        }

        for command in &self.config.setup_commands {
            let output = self.runtime.exec(&self.config.container_name, command).await?;
            if !output.success() {
                warn!(
                    container = %self.config.container_name,
                    command = %command,
                    "setup command failed: {}",
                    output.stderr.trim()
                );
            }
        }

        *self.container_id.lock().await = Some(container_id.clone());
        info!(
            agent = %self.config.agent_id,
            container = %&container_id[..container_id.len().min(12)],
            "container ready"
        );
        Ok(container_id)
    }

    /// Spawn the worker process inside the container with piped stdio
    /// and start the two stream readers.
    pub async fn start_worker(&self, headless: bool) -> Result<()> {
        info!(agent = %self.config.agent_id, "starting worker process");

        let mut worker_command = self.config.worker_command.clone();
        if headless && !worker_command.contains("--headless") {
            worker_command.push_str(" --headless");
        }

        let mut command = Command::new(self.runtime.program());
        command
            .arg("exec")
            .arg("-i")
            .arg(&self.config.container_name);
        command.args(worker_command.split_whitespace());
        command
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = command.spawn().map_err(|e| {
            ConductorError::container_exec(&self.config.container_name, "failed to spawn worker")
                .with_source(e)
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ConductorError::container_exec(&self.config.container_name, "worker stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ConductorError::container_exec(&self.config.container_name, "worker stdout unavailable")
        })?;
        let stderr = child.stderr.take().ok_or_else(|| {
            ConductorError::container_exec(&self.config.container_name, "worker stderr unavailable")
        })?;

        let (tx, rx) = mpsc::channel(OUTPUT_CAPACITY);

        let stdout_tx = tx.clone();
        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if stdout_tx
                    .send(OutputLine {
                        tag: StreamTag::Stdout,
                        line,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if tx
                    .send(OutputLine {
                        tag: StreamTag::Stderr,
                        line,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
        });

        *self.stdin.lock().await = Some(stdin);
        *self.child.lock().await = Some(child);
        *self.output.lock().await = Some(rx);
        self.running.store(true, Ordering::SeqCst);

        Ok(())
    }

    /// Stop the worker and remove its container
    pub async fn cleanup(&self) {
        self.stop().await;
        self.runtime.stop(&self.config.container_name).await;
        self.runtime.remove(&self.config.container_name).await;
        info!(container = %self.config.container_name, "container cleaned up");
    }
}

#[async_trait]
impl WorkerTransport for WorkerWrapper {
    async fn send(&self, command: &str) -> Result<()> {
        if !self.is_running() {
            return Err(ConductorError::container_exec(
                &self.config.container_name,
                "worker is not running",
            ));
        }

        debug!(agent = %self.config.agent_id, command = %command, "sending command");
        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or_else(|| {
            ConductorError::container_exec(&self.config.container_name, "worker stdin closed")
        })?;
        stdin
            .write_all(format!("{}\n", command).as_bytes())
            .await
            .map_err(|e| {
                ConductorError::container_exec(&self.config.container_name, "stdin write failed")
                    .with_source(e)
            })?;
        stdin.flush().await.map_err(|e| {
            ConductorError::container_exec(&self.config.container_name, "stdin flush failed")
                .with_source(e)
        })?;
        Ok(())
    }

    async fn read_output(&self, timeout: Duration) -> Vec<OutputLine> {
        let mut guard = self.output.lock().await;
        match guard.as_mut() {
            Some(rx) => drain_output(rx, timeout, DRAIN_GRACE).await,
            None => Vec::new(),
        }
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }
        info!(agent = %self.config.agent_id, "stopping worker");

        // Closing stdin asks the worker to exit; kill if it lingers.
        *self.stdin.lock().await = None;

        let mut child_guard = self.child.lock().await;
        if let Some(child) = child_guard.as_mut() {
            match tokio::time::timeout(STOP_GRACE, child.wait()).await {
                Ok(Ok(status)) => debug!(agent = %self.config.agent_id, ?status, "worker exited"),
                _ => {
                    warn!(agent = %self.config.agent_id, "worker did not exit, killing");
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                }
            }
        }
        *child_guard = None;
    }
}

/// Drain the merged output queue: block up to `timeout` for the first
/// line, then keep collecting while lines keep arriving within `grace`.
pub(crate) async fn drain_output(
    rx: &mut mpsc::Receiver<OutputLine>,
    timeout: Duration,
    grace: Duration,
) -> Vec<OutputLine> {
    let mut outputs = Vec::new();

    match tokio::time::timeout(timeout, rx.recv()).await {
        Ok(Some(line)) => outputs.push(line),
        _ => return outputs,
    }

    loop {
        match tokio::time::timeout(grace, rx.recv()).await {
            Ok(Some(line)) => outputs.push(line),
            _ => break,
        }
    }

    outputs
}

/// Join tagged output lines into one text block
pub fn format_output(outputs: &[OutputLine]) -> String {
    outputs
        .iter()
        .map(|o| format!("[{}] {}", o.tag, o.line))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Concatenate only the line contents, used by JSON parsers
pub fn output_text(outputs: &[OutputLine]) -> String {
    outputs
        .iter()
        .map(|o| o.line.as_str())
        .collect::<Vec<_>>()
        .join("\n")
}
