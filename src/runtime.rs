//! Container runtime CLI wrapper
//!
//! Drives podman/docker through its command-line interface. Exit code 0
//! means success; stderr carries diagnostics and is surfaced in errors.

use std::path::Path;

use tracing::{debug, warn};

use crate::error::{ConductorError, Result};
use crate::utils::command::{CommandExecutor, CommandOutput};

/// Handle to the container runtime CLI (podman or docker)
#[derive(Debug, Clone)]
pub struct ContainerRuntime {
    program: String,
}

impl ContainerRuntime {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    /// Verify the runtime CLI is installed and responding
    pub async fn verify(&self) -> Result<String> {
        CommandExecutor::run(&self.program, &["version"], None)
            .await
            .map_err(|e| {
                ConductorError::config(format!("container runtime '{}' not available", self.program))
                    .with_source(e)
            })
    }

    /// Create a detached container with a workspace mount and resource
    /// limits, kept alive by `sleep infinity`. Returns the container id.
    pub async fn run_detached(
        &self,
        name: &str,
        image: &str,
        workspace: &Path,
        memory_limit: &str,
        cpu_limit: &str,
        env: &[(String, String)],
    ) -> Result<String> {
        let volume = format!("{}:/workspace:Z", workspace.display());
        let mut args: Vec<String> = vec![
            "run".into(),
            "-d".into(),
            "--name".into(),
            name.into(),
            "-v".into(),
            volume,
            "-w".into(),
            "/workspace".into(),
            "--memory".into(),
            memory_limit.into(),
            "--cpus".into(),
            cpu_limit.into(),
        ];
        for (key, value) in env {
            args.push("-e".into());
            args.push(format!("{}={}", key, value));
        }
        args.push(image.into());
        args.push("sleep".into());
        args.push("infinity".into());

        let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = CommandExecutor::run_unchecked(&self.program, &arg_refs, None).await?;
        if !output.success() {
            return Err(ConductorError::container_setup(
                name,
                format!("container creation failed: {}", output.stderr.trim()),
            ));
        }

        let container_id = output.stdout.trim().to_string();
        debug!(container = %name, id = %container_id, "container created");
        Ok(container_id)
    }

    /// Execute a shell command inside a running container
    pub async fn exec(&self, name: &str, command: &str) -> Result<CommandOutput> {
        self.exec_argv(name, &["bash", "-c", command]).await
    }

    /// Execute an argv inside a running container.
    ///
    /// A non-zero exit is NOT an error here; callers inspect the output.
    /// Runtime-level failures (container missing, CLI unusable) are.
    pub async fn exec_argv(&self, name: &str, argv: &[&str]) -> Result<CommandOutput> {
        let mut args = vec!["exec", name];
        args.extend_from_slice(argv);

        CommandExecutor::run_unchecked(&self.program, &args, None)
            .await
            .map_err(|e| {
                ConductorError::container_exec(name, "exec failed").with_source(e)
            })
    }

    /// Stop a container; failures are logged, not fatal
    pub async fn stop(&self, name: &str) {
        if let Err(e) = CommandExecutor::run(&self.program, &["stop", name], None).await {
            warn!(container = %name, "stop failed: {}", e);
        }
    }

    /// Force-remove a container, ignoring "no such container"
    pub async fn remove(&self, name: &str) {
        if let Err(e) = CommandExecutor::run(&self.program, &["rm", "-f", name], None).await {
            debug!(container = %name, "remove: {}", e);
        }
    }

    /// Commit a running container to a tagged image
    pub async fn commit(&self, name: &str, tag: &str) -> Result<()> {
        let output =
            CommandExecutor::run_unchecked(&self.program, &["commit", name, tag], None).await?;
        if !output.success() {
            return Err(ConductorError::container_exec(
                name,
                format!("commit to {} failed: {}", tag, output.stderr.trim()),
            ));
        }
        debug!(container = %name, tag = %tag, "container committed");
        Ok(())
    }

    /// Create a named network with the given subnet if it does not exist
    pub async fn ensure_network(&self, name: &str, subnet: &str) -> Result<()> {
        let existing =
            CommandExecutor::run_unchecked(&self.program, &["network", "ls", "--format", "{{.Name}}"], None)
                .await?;
        if existing.stdout.lines().any(|line| line.trim() == name) {
            return Ok(());
        }

        let output = CommandExecutor::run_unchecked(
            &self.program,
            &["network", "create", "--subnet", subnet, name],
            None,
        )
        .await?;
        if !output.success() {
            return Err(ConductorError::container_setup(
                name,
                format!("network creation failed: {}", output.stderr.trim()),
            ));
        }
        debug!(network = %name, subnet = %subnet, "network created");
        Ok(())
    }

    /// Build an image from a directory containing a Containerfile
    pub async fn build(&self, tag: &str, dir: &Path) -> Result<()> {
        let dir_str = dir.display().to_string();
        let output =
            CommandExecutor::run_unchecked(&self.program, &["build", "-t", tag, &dir_str], None)
                .await?;
        if !output.success() {
            return Err(ConductorError::container_setup(
                tag,
                format!("image build failed: {}", output.stderr.trim()),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_program_accessor() {
        let runtime = ContainerRuntime::new("podman");
        assert_eq!(runtime.program(), "podman");
    }

    #[tokio::test]
    async fn test_missing_runtime_is_config_error() {
        let runtime = ContainerRuntime::new("definitely-not-a-container-cli");
        let err = runtime.verify().await.unwrap_err();
        assert!(matches!(err, ConductorError::Configuration { .. }));
    }
}
