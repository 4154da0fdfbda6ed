//! Process execution for terraform and custom run steps.
//!
//! Commands run through `sh -c`. Terraform arguments are shell-quoted one by
//! one, so comment text never becomes shell syntax. Every process is bounded
//! by a timeout and a cancellation token; when either fires the child is
//! killed and the step fails.

use crate::error::{StepError, StepResult};
use async_trait::async_trait;
use semver::Version;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Runs terraform at a chosen version
#[async_trait]
pub trait ToolExecutor: Send + Sync {
    /// Run terraform with `args` in `path`. Each arg is passed as one literal
    /// argument. `None` version means the default binary.
    ///
    /// Returns combined output; a non-zero exit is an error carrying that output.
    async fn run_command_with_version(
        &self,
        span: &tracing::Span,
        path: &Path,
        args: &[String],
        version: Option<&Version>,
        workspace: &str,
        cancel: &CancellationToken,
    ) -> StepResult<String>;
}

/// A shell command plus its environment and bounds
#[derive(Debug, Clone)]
pub struct ShellCommand {
    pub command: String,
    pub path: PathBuf,
    pub env: Vec<(String, String)>,
    pub timeout: Duration,
}

impl ShellCommand {
    pub fn new(command: impl Into<String>, path: &Path, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            path: path.to_path_buf(),
            env: Vec::new(),
            timeout,
        }
    }

    pub fn env(mut self, key: &str, value: impl Into<String>) -> Self {
        self.env.push((key.to_string(), value.into()));
        self
    }

    /// Run to completion, timeout or cancellation
    pub async fn run(&self, cancel: &CancellationToken) -> StepResult<String> {
        let child = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.path)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StepError::SpawnFailed(format!("{}: {}", self.command, e)))?;

        tracing::debug!(command = %self.command, path = %self.path.display(), "started process");

        // Dropping the wait future kills the child
        let output = tokio::select! {
            res = child.wait_with_output() => res?,
            _ = cancel.cancelled() => {
                tracing::warn!(command = %self.command, "process cancelled");
                return Err(StepError::Cancelled);
            }
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(command = %self.command, "process timed out");
                return Err(StepError::TimedOut(self.timeout.as_secs()));
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
        combined.push_str(&String::from_utf8_lossy(&output.stderr));

        if output.status.success() {
            tracing::debug!(command = %self.command, "process succeeded");
            Ok(combined)
        } else {
            tracing::warn!(
                command = %self.command,
                code = output.status.code().unwrap_or(-1),
                "process failed"
            );
            Err(StepError::ToolFailed {
                command: self.command.clone(),
                path: self.path.clone(),
                output: combined,
            })
        }
    }
}

/// [`ToolExecutor`] that shells out to `terraform` or `terraform<version>`
#[derive(Debug, Clone)]
pub struct TerraformExecutor {
    binary: String,
    timeout: Duration,
}

impl TerraformExecutor {
    pub fn new(binary: impl Into<String>, timeout: Duration) -> Self {
        Self {
            binary: binary.into(),
            timeout,
        }
    }

    /// Binary to invoke; pinned versions are installed side by side
    pub fn binary_for(&self, version: Option<&Version>) -> String {
        match version {
            Some(v) => format!("{}{}", self.binary, v),
            None => self.binary.clone(),
        }
    }
}

#[async_trait]
impl ToolExecutor for TerraformExecutor {
    async fn run_command_with_version(
        &self,
        span: &tracing::Span,
        path: &Path,
        args: &[String],
        version: Option<&Version>,
        workspace: &str,
        cancel: &CancellationToken,
    ) -> StepResult<String> {
        let binary = self.binary_for(version);
        let command = shell_words::join(
            std::iter::once(binary.as_str()).chain(args.iter().map(String::as_str)),
        );
        let mut shell = ShellCommand::new(command, path, self.timeout)
            .env("WORKSPACE", workspace)
            .env("DIR", path.display().to_string());
        if let Some(v) = version {
            shell = shell.env("TF_PILOT_TERRAFORM_VERSION", v.to_string());
        }
        shell.run(cancel).instrument(span.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_binary_for() {
        let exec = TerraformExecutor::new("terraform", Duration::from_secs(1));
        assert_eq!(exec.binary_for(None), "terraform");
        assert_eq!(
            exec.binary_for(Some(&Version::new(0, 11, 7))),
            "terraform0.11.7"
        );
    }

    #[tokio::test]
    async fn test_terraform_args_stay_literal() {
        let dir = TempDir::new().unwrap();
        let exec = TerraformExecutor::new("printf", Duration::from_secs(10));
        let args: Vec<String> = ["[%s]", "-var=x;touch injected", "$(touch injected)", "a b"]
            .iter()
            .map(|s| s.to_string())
            .collect();
        let out = exec
            .run_command_with_version(
                &tracing::Span::none(),
                dir.path(),
                &args,
                None,
                "default",
                &CancellationToken::new(),
            )
            .await
            .unwrap();
        assert_eq!(out, "[-var=x;touch injected][$(touch injected)][a b]");
        assert!(!dir.path().join("injected").exists());
    }

    #[tokio::test]
    async fn test_shell_success_and_env() {
        let dir = TempDir::new().unwrap();
        let out = ShellCommand::new("echo \"$WORKSPACE\"; echo oops >&2", dir.path(), Duration::from_secs(10))
            .env("WORKSPACE", "staging")
            .run(&CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(out, "staging\noops\n");
    }

    #[tokio::test]
    async fn test_shell_failure_keeps_output() {
        let dir = TempDir::new().unwrap();
        let err = ShellCommand::new("echo broken; exit 3", dir.path(), Duration::from_secs(10))
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            StepError::ToolFailed { output, .. } => assert_eq!(output, "broken\n"),
            other => panic!("expected ToolFailed, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shell_timeout() {
        let dir = TempDir::new().unwrap();
        let err = ShellCommand::new("sleep 5", dir.path(), Duration::from_millis(100))
            .run(&CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::TimedOut(_)));
    }

    #[tokio::test]
    async fn test_shell_cancelled() {
        let dir = TempDir::new().unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = ShellCommand::new("sleep 5", dir.path(), Duration::from_secs(10))
            .run(&cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, StepError::Cancelled));
    }
}
