//! Async subprocess wrapper over the container runtime (`docker` /
//! `docker compose`). One-shot commands only; unlike the on-host process
//! supervisor this crate does not need to watch a long-running child, so
//! there is no typestate here — just a function per operation.

use serde::Deserialize;
use std::path::Path;
use thiserror::Error;
use tokio::process::Command;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("failed to spawn `{command}`: `{source}`")]
    Spawn {
        command: String,
        source: std::io::Error,
    },
    #[error("`{command}` exited with status {status}: {stderr}")]
    NonZeroExit {
        command: String,
        status: i32,
        stderr: String,
    },
    #[error("failed to parse `{command}` output: `{source}`")]
    Parse {
        command: String,
        source: serde_json::Error,
    },
    #[error("no container found matching `{0}`")]
    ContainerNotFound(String),
}

#[derive(Debug, Deserialize)]
struct InspectEntry {
    #[serde(rename = "Id")]
    id: String,
    #[serde(rename = "RepoDigests", default)]
    repo_digests: Vec<String>,
}

#[cfg_attr(test, mockall::automock)]
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError>;
    async fn inspect_image_digest(&self, image: &str) -> Result<String, RuntimeError>;
    async fn inspect_container_digest(&self, container_name: &str) -> Result<String, RuntimeError>;
    async fn list_containers(&self, name_filter: &str) -> Result<Vec<String>, RuntimeError>;
    async fn stop(&self, container_name: &str) -> Result<(), RuntimeError>;
    async fn remove(&self, container_name: &str) -> Result<(), RuntimeError>;
    async fn compose_up(&self, compose_dir: &Path) -> Result<(), RuntimeError>;
}

pub struct DockerRuntime;

impl DockerRuntime {
    pub fn new() -> Self {
        Self
    }

    async fn run(&self, args: &[&str]) -> Result<String, RuntimeError> {
        let command_desc = format!("docker {}", args.join(" "));
        let output = Command::new("docker")
            .args(args)
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command_desc.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::NonZeroExit {
                command: command_desc,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn digest_from_inspect(command: &str, stdout: &str) -> Result<String, RuntimeError> {
        let entries: Vec<InspectEntry> =
            serde_json::from_str(stdout).map_err(|source| RuntimeError::Parse {
                command: command.to_string(),
                source,
            })?;
        let entry = entries
            .first()
            .ok_or_else(|| RuntimeError::ContainerNotFound(command.to_string()))?;
        if let Some(digest_ref) = entry.repo_digests.first() {
            if let Some((_, digest)) = digest_ref.rsplit_once('@') {
                return Ok(digest.to_string());
            }
        }
        Ok(entry.id.clone())
    }
}

impl Default for DockerRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn pull(&self, image: &str) -> Result<(), RuntimeError> {
        self.run(&["pull", image]).await.map(|_| ())
    }

    async fn inspect_image_digest(&self, image: &str) -> Result<String, RuntimeError> {
        let stdout = self.run(&["inspect", image]).await?;
        Self::digest_from_inspect(&format!("docker inspect {image}"), &stdout)
    }

    async fn inspect_container_digest(&self, container_name: &str) -> Result<String, RuntimeError> {
        let stdout = self.run(&["inspect", container_name]).await?;
        Self::digest_from_inspect(&format!("docker inspect {container_name}"), &stdout)
    }

    async fn list_containers(&self, name_filter: &str) -> Result<Vec<String>, RuntimeError> {
        let filter = format!("name={name_filter}");
        let stdout = self
            .run(&["ps", "--filter", &filter, "--format", "{{.Names}}"])
            .await?;
        Ok(stdout.lines().map(|s| s.to_string()).filter(|s| !s.is_empty()).collect())
    }

    async fn stop(&self, container_name: &str) -> Result<(), RuntimeError> {
        self.run(&["stop", container_name]).await.map(|_| ())
    }

    async fn remove(&self, container_name: &str) -> Result<(), RuntimeError> {
        self.run(&["rm", container_name]).await.map(|_| ())
    }

    async fn compose_up(&self, compose_dir: &Path) -> Result<(), RuntimeError> {
        let dir = compose_dir.to_string_lossy().to_string();
        let command_desc = "docker compose up -d --force-recreate".to_string();
        let output = Command::new("docker")
            .current_dir(&dir)
            .args(["compose", "up", "-d", "--force-recreate"])
            .output()
            .await
            .map_err(|source| RuntimeError::Spawn {
                command: command_desc.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(RuntimeError::NonZeroExit {
                command: command_desc,
                status: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        Ok(())
    }
}
