//! Command execution utilities

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

use crate::error::{ConductorError, Result};

/// Captured output of a finished subprocess
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Utility for executing subprocesses with consistent error handling
pub struct CommandExecutor;

impl CommandExecutor {
    /// Run a command and fail on non-zero exit
    pub async fn run(cmd: &str, args: &[&str], dir: Option<&Path>) -> Result<String> {
        let output = Self::run_unchecked(cmd, args, dir).await?;

        if !output.success() {
            return Err(ConductorError::communication(format!(
                "command failed: {} {}\nstderr: {}",
                cmd,
                args.join(" "),
                output.stderr
            )));
        }

        Ok(output.stdout)
    }

    /// Run a command and capture exit code plus both streams
    pub async fn run_unchecked(
        cmd: &str,
        args: &[&str],
        dir: Option<&Path>,
    ) -> Result<CommandOutput> {
        let mut command = Command::new(cmd);
        command.args(args);

        if let Some(dir) = dir {
            command.current_dir(dir);
        }

        command.stdout(Stdio::piped());
        command.stderr(Stdio::piped());

        let output = command.output().await.map_err(|e| {
            ConductorError::communication(format!(
                "failed to execute command: {} {}",
                cmd,
                args.join(" ")
            ))
            .with_source(e)
        })?;

        Ok(CommandOutput {
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            exit_code: output.status.code().unwrap_or(-1),
        })
    }

    /// Run a command with a deadline
    pub async fn run_with_timeout(
        cmd: &str,
        args: &[&str],
        dir: Option<&Path>,
        timeout: Duration,
    ) -> Result<String> {
        tokio::time::timeout(timeout, Self::run(cmd, args, dir))
            .await
            .map_err(|_| {
                ConductorError::communication(format!("command timed out: {} {}", cmd, args.join(" ")))
            })?
    }

    /// Check if a command exists in PATH
    pub async fn command_exists(cmd: &str) -> bool {
        Command::new("which")
            .arg(cmd)
            .output()
            .await
            .map(|output| output.status.success())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = CommandExecutor::run("echo", &["hello"], None).await.unwrap();
        assert_eq!(out.trim(), "hello");
    }

    #[tokio::test]
    async fn test_run_unchecked_reports_exit_code() {
        let out = CommandExecutor::run_unchecked("sh", &["-c", "exit 3"], None)
            .await
            .unwrap();
        assert_eq!(out.exit_code, 3);
        assert!(!out.success());
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_error() {
        let result = CommandExecutor::run("sh", &["-c", "echo boom >&2; exit 1"], None).await;
        assert!(result.is_err());
    }
}
