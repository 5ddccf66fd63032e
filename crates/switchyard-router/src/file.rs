//! Upstream-file router for an external proxy.
//!
//! The adopted configuration lives in a JSON file the proxy consumes.
//! Each reload writes the full file to a sibling temp path and renames it
//! over the original, so the proxy never reads a half-written file, then
//! runs the configured reload command under a timeout. `current_config`
//! reads the file back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use switchyard_core::EnvironmentId;
use switchyard_state::TrafficState;

use crate::{EdgeRouter, RouterError};

/// On-disk upstream configuration.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UpstreamFile {
    pub traffic: TrafficState,
    /// Endpoints per environment, for proxies that need addresses.
    pub upstreams: BTreeMap<EnvironmentId, Vec<String>>,
}

pub struct FileRouter {
    path: PathBuf,
    reload_command: Option<String>,
    reload_timeout: Duration,
    upstreams: BTreeMap<EnvironmentId, Vec<String>>,
}

impl FileRouter {
    pub fn new(
        path: impl Into<PathBuf>,
        reload_command: Option<String>,
        reload_timeout: Duration,
        upstreams: BTreeMap<EnvironmentId, Vec<String>>,
    ) -> Self {
        Self {
            path: path.into(),
            reload_command,
            reload_timeout,
            upstreams,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    async fn write_atomically(&self, state: &TrafficState) -> Result<(), RouterError> {
        let file = UpstreamFile {
            traffic: state.clone(),
            upstreams: self.upstreams.clone(),
        };
        let bytes = serde_json::to_vec_pretty(&file).map_err(|e| RouterError::Config(e.to_string()))?;
        let tmp = self.temp_path();
        tokio::fs::write(&tmp, &bytes).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        debug!(path = %self.path.display(), revision = state.revision, "upstream file written");
        Ok(())
    }

    async fn run_reload_command(&self, command: &str) -> Result<(), RouterError> {
        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let output = match tokio::time::timeout(self.reload_timeout, child.wait_with_output()).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(command, "reload command timed out");
                return Err(RouterError::Timeout(self.reload_timeout.as_millis() as u64));
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(RouterError::Reload(format!(
                "`{command}` exited with {}: {stderr}",
                output.status
            )));
        }
        info!(command, "edge router reloaded");
        Ok(())
    }
}

#[async_trait]
impl EdgeRouter for FileRouter {
    async fn reload(&self, state: &TrafficState) -> Result<(), RouterError> {
        self.write_atomically(state).await?;
        if let Some(command) = &self.reload_command {
            self.run_reload_command(command).await?;
        }
        Ok(())
    }

    async fn current_config(&self) -> Result<Option<TrafficState>, RouterError> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let file: UpstreamFile =
            serde_json::from_slice(&bytes).map_err(|e| RouterError::Config(e.to_string()))?;
        Ok(Some(file.traffic))
    }
}
