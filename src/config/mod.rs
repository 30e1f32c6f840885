//! Orchestrator configuration
//!
//! Loaded once at startup from a YAML file (or built in code), validated
//! eagerly so misconfiguration fails fast before any agent is spawned.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};
use crate::workspace::EnvironmentSpec;

/// Log verbosity, mapped onto the tracing env-filter at startup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_filter(&self) -> &'static str {
        match self {
            LogLevel::Error => "error",
            LogLevel::Warn => "warn",
            LogLevel::Info => "info",
            LogLevel::Debug => "debug",
            LogLevel::Trace => "trace",
        }
    }
}

/// Container settings shared by all non-isolated agent workers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContainerSettings {
    /// Container runtime CLI program (podman or docker)
    pub program: String,
    /// Base image for agent containers
    pub image: String,
    /// Memory limit passed to the runtime (e.g. "2g")
    pub memory_limit: String,
    /// CPU limit passed to the runtime (e.g. "1.0")
    pub cpu_limit: String,
    /// Commands run inside a fresh container before the worker starts
    #[serde(default)]
    pub setup_commands: Vec<String>,
    /// Command line that launches the worker process
    pub worker_command: String,
}

impl Default for ContainerSettings {
    fn default() -> Self {
        Self {
            program: "podman".to_string(),
            image: "ubuntu:22.04".to_string(),
            memory_limit: "2g".to_string(),
            cpu_limit: "1.0".to_string(),
            setup_commands: vec![
                "apt-get update".to_string(),
                "apt-get install -y curl git python3".to_string(),
            ],
            worker_command: "worker --headless".to_string(),
        }
    }
}

/// Network settings for isolated workspaces
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkSettings {
    pub name: String,
    pub subnet: String,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            name: "conductor-net".to_string(),
            subnet: "10.89.0.0/24".to_string(),
        }
    }
}

/// Isolated workspace configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IsolationSettings {
    /// Whether agents get isolated workspace containers
    #[serde(default)]
    pub enabled: bool,
    /// Default environment name for agents without an explicit one
    #[serde(default = "default_environment")]
    pub default_environment: String,
    /// Whether snapshots are taken around isolated executions
    #[serde(default = "default_true")]
    pub enable_snapshots: bool,
    /// Keep a failed workspace around for debugging instead of removing it
    #[serde(default = "default_true")]
    pub preserve_on_error: bool,
    /// Restore the pre-task snapshot when a command fails
    #[serde(default = "default_true")]
    pub restore_on_error: bool,
    /// Named environment catalog
    #[serde(default)]
    pub environments: Vec<EnvironmentSpec>,
    #[serde(default)]
    pub network: NetworkSettings,
    /// Containers older than this many seconds are garbage collected
    #[serde(default = "default_max_age")]
    pub max_age_secs: u64,
}

fn default_environment() -> String {
    "minimal".to_string()
}

fn default_true() -> bool {
    true
}

fn default_max_age() -> u64 {
    86_400
}

impl Default for IsolationSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            default_environment: default_environment(),
            enable_snapshots: true,
            preserve_on_error: true,
            restore_on_error: true,
            environments: Vec::new(),
            network: NetworkSettings::default(),
            max_age_secs: default_max_age(),
        }
    }
}

/// Connection parameters for the optional shared queue/result store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SharedStoreSettings {
    pub url: String,
    /// Processing leases older than this are requeued by the janitor
    #[serde(default = "default_lease_secs")]
    pub lease_timeout_secs: u64,
    /// Task payload and result TTL
    #[serde(default = "default_ttl_secs")]
    pub ttl_secs: u64,
}

fn default_lease_secs() -> u64 {
    300
}

fn default_ttl_secs() -> u64 {
    3_600
}

/// Agent-level tuning knobs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentDefaults {
    /// Base directory for per-agent workspaces
    pub workspace_root: PathBuf,
    /// Seconds between health-check probes
    #[serde(default = "default_health_interval")]
    pub health_check_interval_secs: u64,
    /// Seconds to wait for a probe response
    #[serde(default = "default_probe_timeout")]
    pub health_probe_timeout_secs: u64,
}

fn default_health_interval() -> u64 {
    30
}

fn default_probe_timeout() -> u64 {
    5
}

impl Default for AgentDefaults {
    fn default() -> Self {
        Self {
            workspace_root: std::env::temp_dir().join("conductor"),
            health_check_interval_secs: default_health_interval(),
            health_probe_timeout_secs: default_probe_timeout(),
        }
    }
}

/// Complete conductor configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConductorConfig {
    /// Number of agents to spawn at startup
    #[serde(default = "default_num_agents")]
    pub num_agents: usize,
    /// Size of the dispatch worker pool
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    /// Global per-task deadline ceiling in seconds
    #[serde(default = "default_task_timeout")]
    pub task_timeout_secs: u64,
    #[serde(default = "default_log_level")]
    pub log_level: LogLevel,
    /// Server socket path; derived from the runtime dir when unset
    #[serde(default)]
    pub socket_path: Option<PathBuf>,
    #[serde(default)]
    pub container: ContainerSettings,
    #[serde(default)]
    pub agent: AgentDefaults,
    #[serde(default)]
    pub isolated_workspace: IsolationSettings,
    #[serde(default)]
    pub shared_store: Option<SharedStoreSettings>,
    /// Schedule an asynchronous scoring pass after successful tasks
    #[serde(default)]
    pub enable_evaluation: bool,
}

fn default_num_agents() -> usize {
    3
}

fn default_max_workers() -> usize {
    10
}

fn default_task_timeout() -> u64 {
    300
}

fn default_log_level() -> LogLevel {
    LogLevel::Info
}

impl Default for ConductorConfig {
    fn default() -> Self {
        Self {
            num_agents: default_num_agents(),
            max_workers: default_max_workers(),
            task_timeout_secs: default_task_timeout(),
            log_level: default_log_level(),
            socket_path: None,
            container: ContainerSettings::default(),
            agent: AgentDefaults::default(),
            isolated_workspace: IsolationSettings::default(),
            shared_store: None,
            enable_evaluation: false,
        }
    }
}

impl ConductorConfig {
    /// Load configuration from a YAML file, merged over defaults
    pub async fn from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = tokio::fs::read_to_string(&path).await.map_err(|e| {
            ConductorError::config(format!("configuration file not found: {}", path.display()))
                .with_source(e)
        })?;
        let config: Self = serde_yaml::from_str(&contents).map_err(|e| {
            ConductorError::config(format!("invalid YAML configuration: {}", path.display()))
                .with_source(e)
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a YAML file
    pub async fn to_file(&self, path: impl Into<PathBuf>) -> Result<()> {
        let contents = serde_yaml::to_string(self)
            .map_err(|e| ConductorError::config("failed to serialize configuration").with_source(e))?;
        tokio::fs::write(path.into(), contents).await?;
        Ok(())
    }

    /// Validate configuration values; fails fast, never retried
    pub fn validate(&self) -> Result<()> {
        if self.num_agents < 1 {
            return Err(ConductorError::config("num_agents must be at least 1"));
        }
        if self.max_workers < 1 {
            return Err(ConductorError::config("max_workers must be at least 1"));
        }
        if self.task_timeout_secs < 1 {
            return Err(ConductorError::config(
                "task_timeout must be at least 1 second",
            ));
        }
        Ok(())
    }

    /// Well-known server socket path for this orchestrator instance
    pub fn socket_path(&self) -> PathBuf {
        self.socket_path.clone().unwrap_or_else(|| {
            let runtime_dir =
                std::env::var("XDG_RUNTIME_DIR").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(runtime_dir).join("conductor-orchestrator.sock")
        })
    }
}
