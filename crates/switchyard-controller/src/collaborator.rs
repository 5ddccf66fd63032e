//! Build/update collaborator: whatever puts a version onto an environment.
//!
//! The controller only needs `build_and_start` to return once the new
//! version has been handed off; readiness is then established by probing.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info, warn};

use switchyard_core::EnvironmentId;

#[derive(Debug, Error)]
pub enum DeployError {
    #[error("deploy command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },

    #[error("deploy command timed out after {0}s")]
    Timeout(u64),

    #[error("could not run deploy command: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait BuildCollaborator: Send + Sync {
    async fn build_and_start(&self, id: EnvironmentId, version: &str) -> Result<(), DeployError>;
}

/// Runs a shell command with `SWITCHYARD_ENVIRONMENT` and
/// `SWITCHYARD_VERSION` set.
pub struct CommandCollaborator {
    command: String,
    timeout: Duration,
}

impl CommandCollaborator {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

#[async_trait]
impl BuildCollaborator for CommandCollaborator {
    async fn build_and_start(&self, id: EnvironmentId, version: &str) -> Result<(), DeployError> {
        debug!(command = %self.command, environment = %id, version, "running deploy command");
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .env("SWITCHYARD_ENVIRONMENT", id.to_string())
            .env("SWITCHYARD_VERSION", version)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(environment = %id, version, "deploy command timed out");
                return Err(DeployError::Timeout(self.timeout.as_secs()));
            }
        };

        if !output.status.success() {
            return Err(DeployError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        info!(environment = %id, version, "deploy command finished");
        Ok(())
    }
}

/// For environments updated out of band: deploy only waits for health.
pub struct ExternalCollaborator;

#[async_trait]
impl BuildCollaborator for ExternalCollaborator {
    async fn build_and_start(&self, id: EnvironmentId, version: &str) -> Result<(), DeployError> {
        debug!(environment = %id, version, "no deploy command configured");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn command_sees_environment_and_version() {
        let collaborator = CommandCollaborator::new(
            r#"test "$SWITCHYARD_ENVIRONMENT" = secondary && test "$SWITCHYARD_VERSION" = 2.0.0"#,
            Duration::from_secs(5),
        );
        collaborator
            .build_and_start(EnvironmentId::Secondary, "2.0.0")
            .await
            .unwrap();
        let err = collaborator
            .build_and_start(EnvironmentId::Primary, "2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Failed { .. }));
    }

    #[tokio::test]
    async fn stderr_is_reported() {
        let collaborator = CommandCollaborator::new("echo image not found >&2; exit 2", Duration::from_secs(5));
        let err = collaborator
            .build_and_start(EnvironmentId::Secondary, "9.9.9")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("image not found"), "{err}");
    }

    #[tokio::test]
    async fn slow_command_times_out() {
        let collaborator = CommandCollaborator::new("sleep 5", Duration::from_millis(100));
        let err = collaborator
            .build_and_start(EnvironmentId::Secondary, "2.0.0")
            .await
            .unwrap_err();
        assert!(matches!(err, DeployError::Timeout(_)));
    }
}
