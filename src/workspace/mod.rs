//! Workspace isolation manager
//!
//! One container per agent, created on demand from a named environment.
//! The agent workspace directory is mounted at /workspace. Snapshots
//! commit the running container to a tagged image; restore recreates the
//! container from a tag. Operations for the same agent are serialized.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::IsolationSettings;
use crate::error::{ConductorError, Result};
use crate::runtime::ContainerRuntime;
use crate::utils::command::CommandOutput;

/// A named development environment agents can request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvironmentSpec {
    pub name: String,
    pub image: String,
    /// Packages installed after the container starts
    #[serde(default)]
    pub packages: Vec<String>,
    /// Extra setup commands run inside the fresh container
    #[serde(default)]
    pub setup_commands: Vec<String>,
}

impl EnvironmentSpec {
    /// Fallback environment when nothing matches the requested name
    pub fn minimal() -> Self {
        Self {
            name: "minimal".to_string(),
            image: "alpine:latest".to_string(),
            packages: vec!["git".to_string(), "curl".to_string()],
            setup_commands: Vec::new(),
        }
    }
}

/// Live isolated workspace container for one agent
#[derive(Debug, Clone)]
pub struct WorkspaceRecord {
    pub agent_id: String,
    pub container_name: String,
    pub container_id: String,
    pub environment: String,
    pub workspace_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub snapshots: Vec<String>,
}

/// Manages per-agent isolated workspace containers
pub struct WorkspaceManager {
    runtime: ContainerRuntime,
    settings: IsolationSettings,
    base_dir: PathBuf,
    containers: DashMap<String, WorkspaceRecord>,
    /// Per-agent operation locks
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl WorkspaceManager {
    pub fn new(
        runtime: ContainerRuntime,
        settings: IsolationSettings,
        base_dir: PathBuf,
    ) -> Self {
        Self {
            runtime,
            settings,
            base_dir,
            containers: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Create the shared network once at startup
    pub async fn init_network(&self) -> Result<()> {
        self.runtime
            .ensure_network(&self.settings.network.name, &self.settings.network.subnet)
            .await
    }

    fn lock_for(&self, agent_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(agent_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn resolve_environment(&self, name: &str) -> EnvironmentSpec {
        self.settings
            .environments
            .iter()
            .find(|env| env.name == name)
            .cloned()
            .unwrap_or_else(|| {
                if name != "minimal" {
                    warn!(environment = %name, "unknown environment, using minimal");
                }
                EnvironmentSpec::minimal()
            })
    }

    /// Create an isolated workspace container for an agent
    pub async fn create(&self, agent_id: &str, environment: &str) -> Result<WorkspaceRecord> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let env = self.resolve_environment(environment);
        let workspace_dir = self.base_dir.join(format!("agent_{}", agent_id));
        tokio::fs::create_dir_all(&workspace_dir).await?;

        let container_name = format!(
            "conductor-ws-{}-{}",
            agent_id,
            &Uuid::new_v4().simple().to_string()[..8]
        );

        let env_vars = vec![
            ("AGENT_ID".to_string(), agent_id.to_string()),
            ("WORKSPACE".to_string(), "/workspace".to_string()),
            ("CONDUCTOR_ENV".to_string(), env.name.clone()),
        ];
        let container_id = self
            .runtime
            .run_detached(
                &container_name,
                &env.image,
                &workspace_dir,
                "2g",
                "1.0",
                &env_vars,
            )
            .await
            .map_err(|e| {
                ConductorError::workspace(agent_id, "workspace container creation failed")
                    .with_source(e)
            })?;

        if !env.packages.is_empty() {
            match package_install_command(&env.image, &env.packages) {
                Some(command) => {
                    // Minimal images may not ship bash
                    let output = self
                        .runtime
                        .exec_argv(&container_name, &["sh", "-c", &command])
                        .await?;
                    if output.success() {
                        info!(agent = %agent_id, count = env.packages.len(), "packages installed");
                    } else {
                        warn!(
                            agent = %agent_id,
                            "package installation failed: {}",
                            output.stderr.trim()
                        );
                    }
                }
                None => warn!(
                    image = %env.image,
                    "unknown image type, skipping package installation"
                ),
            }
        }

        for command in &env.setup_commands {
            let output = self
                .runtime
                .exec_argv(&container_name, &["sh", "-c", command])
                .await?;
            if !output.success() {
                warn!(
                    agent = %agent_id,
                    command = %command,
                    "environment setup command failed"
                );
            }
        }

        let record = WorkspaceRecord {
            agent_id: agent_id.to_string(),
            container_name,
            container_id,
            environment: env.name,
            workspace_path: workspace_dir,
            created_at: Utc::now(),
            snapshots: Vec::new(),
        };
        self.containers.insert(agent_id.to_string(), record.clone());

        info!(
            agent = %agent_id,
            container = %record.container_name,
            "isolated workspace created"
        );
        Ok(record)
    }

    /// Execute an argv inside the agent's workspace container
    pub async fn exec(&self, agent_id: &str, argv: &[&str]) -> Result<CommandOutput> {
        let container_name = self
            .containers
            .get(agent_id)
            .map(|r| r.container_name.clone())
            .ok_or_else(|| {
                ConductorError::workspace(agent_id, "no workspace container for agent")
            })?;

        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;
        self.runtime.exec_argv(&container_name, argv).await
    }

    /// Commit the running container to a tagged image
    pub async fn snapshot(&self, agent_id: &str, name: &str) -> Result<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let mut record = self.containers.get_mut(agent_id).ok_or_else(|| {
            ConductorError::workspace(agent_id, "no workspace container for agent")
        })?;

        let tag = format!("{}:{}", record.container_name, name);
        self.runtime.commit(&record.container_name, &tag).await?;
        record.snapshots.push(name.to_string());
        debug!(agent = %agent_id, snapshot = %name, "snapshot created");
        Ok(())
    }

    /// Stop the current container and recreate it from a snapshot tag
    pub async fn restore(&self, agent_id: &str, name: &str) -> Result<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        let mut record = self.containers.get_mut(agent_id).ok_or_else(|| {
            ConductorError::workspace(agent_id, "no workspace container for agent")
        })?;
        if !record.snapshots.iter().any(|s| s == name) {
            return Err(ConductorError::workspace(
                agent_id,
                format!("unknown snapshot: {}", name),
            ));
        }

        let tag = format!("{}:{}", record.container_name, name);
        self.runtime.stop(&record.container_name).await;
        self.runtime.remove(&record.container_name).await;

        let env_vars = vec![("AGENT_ID".to_string(), agent_id.to_string())];
        let container_id = self
            .runtime
            .run_detached(
                &record.container_name,
                &tag,
                &record.workspace_path,
                "2g",
                "1.0",
                &env_vars,
            )
            .await
            .map_err(|e| {
                ConductorError::workspace(agent_id, "restore from snapshot failed").with_source(e)
            })?;

        record.container_id = container_id;
        info!(agent = %agent_id, snapshot = %name, "workspace restored");
        Ok(())
    }

    /// Remove the agent's workspace container; optionally keep the
    /// workspace directory on disk.
    pub async fn cleanup(&self, agent_id: &str, preserve_volumes: bool) -> Result<()> {
        let lock = self.lock_for(agent_id);
        let _guard = lock.lock().await;

        if let Some((_, record)) = self.containers.remove(agent_id) {
            self.runtime.stop(&record.container_name).await;
            self.runtime.remove(&record.container_name).await;

            if !preserve_volumes {
                tokio::fs::remove_dir_all(&record.workspace_path).await.ok();
            }
            info!(agent = %agent_id, "workspace cleaned up");
        }
        Ok(())
    }

    /// Remove containers older than the configured maximum age
    pub async fn collect_garbage(&self) -> usize {
        let max_age = chrono::Duration::seconds(self.settings.max_age_secs as i64);
        let now = Utc::now();

        let stale: Vec<String> = self
            .containers
            .iter()
            .filter(|entry| now - entry.created_at > max_age)
            .map(|entry| entry.agent_id.clone())
            .collect();

        let mut removed = 0;
        for agent_id in stale {
            if self.cleanup(&agent_id, true).await.is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            info!(removed, "workspace garbage collection finished");
        }
        removed
    }

    /// Current workspace info for an agent
    pub fn info(&self, agent_id: &str) -> Option<HashMap<String, serde_json::Value>> {
        self.containers.get(agent_id).map(|record| {
            let mut info = HashMap::new();
            info.insert(
                "container_name".to_string(),
                serde_json::json!(record.container_name),
            );
            info.insert(
                "environment".to_string(),
                serde_json::json!(record.environment),
            );
            info.insert(
                "workspace_path".to_string(),
                serde_json::json!(record.workspace_path.display().to_string()),
            );
            info.insert(
                "snapshots".to_string(),
                serde_json::json!(record.snapshots),
            );
            info
        })
    }
}

/// Package-manager install line for an environment's packages, chosen
/// by image family. Unknown families return `None` and installation is
/// skipped with a warning.
fn package_install_command(image: &str, packages: &[String]) -> Option<String> {
    let list = packages.join(" ");
    if image.contains("alpine") {
        Some(format!("apk add --no-cache {}", list))
    } else if image.contains("ubuntu") || image.contains("debian") {
        Some(format!("apt-get update && apt-get install -y {}", list))
    } else if image.contains("python") {
        Some(format!("pip install {}", list))
    } else if image.contains("node") {
        Some(format!("npm install -g {}", list))
    } else {
        None
    }
}
