//! Updates the front-end (nginx/GUI) container and tracks a short version
//! history (current / n-1 / n-2) so an operator can roll back without
//! re-resolving a digest from the registry.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

use crate::runtime::{ContainerRuntime, RuntimeError};

#[derive(Error, Debug)]
pub enum NginxSidecarError {
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error("failed to read version history: `{0}`")]
    Read(std::io::Error),
    #[error("failed to write version history: `{0}`")]
    Write(std::io::Error),
    #[error("failed to serialize version history: `{0}`")]
    Serialize(#[from] serde_json::Error),
    #[error("no container named `{0}` found to update")]
    ContainerNotFound(String),
    #[error("requested rollback slot is not present in history")]
    SlotUnavailable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionSlot {
    pub image_digest: String,
    pub compose_dir: PathBuf,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VersionHistory {
    pub current: Option<VersionSlot>,
    pub previous: Option<VersionSlot>,
    pub before_previous: Option<VersionSlot>,
}

impl VersionHistory {
    fn push(&mut self, slot: VersionSlot) {
        self.before_previous = self.previous.take();
        self.previous = self.current.take();
        self.current = Some(slot);
    }

    pub fn slot(&self, rollback_slot: u8) -> Option<&VersionSlot> {
        match rollback_slot {
            0 => self.current.as_ref(),
            1 => self.previous.as_ref(),
            2 => self.before_previous.as_ref(),
            _ => None,
        }
    }
}

pub struct NginxSidecar {
    runtime: Arc<dyn ContainerRuntime>,
    history_path: PathBuf,
    container_name: String,
}

impl NginxSidecar {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, history_path: PathBuf, container_name: impl Into<String>) -> Self {
        Self {
            runtime,
            history_path,
            container_name: container_name.into(),
        }
    }

    fn load_history(&self) -> Result<VersionHistory, NginxSidecarError> {
        if !self.history_path.exists() {
            return Ok(VersionHistory::default());
        }
        let data = fs::read(&self.history_path).map_err(NginxSidecarError::Read)?;
        Ok(serde_json::from_slice(&data)?)
    }

    fn save_history(&self, history: &VersionHistory) -> Result<(), NginxSidecarError> {
        let serialized = serde_json::to_string_pretty(history)?;
        if let Some(parent) = self.history_path.parent() {
            fs::create_dir_all(parent).map_err(NginxSidecarError::Write)?;
        }
        let tmp_path = self.history_path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized).map_err(NginxSidecarError::Write)?;
        fs::rename(&tmp_path, &self.history_path).map_err(NginxSidecarError::Write)?;
        Ok(())
    }

    /// Stops and removes the running container matched by name, then
    /// recreates it via `docker compose up -d --force-recreate`, recording
    /// the new slot in the rotating history.
    pub async fn update(&self, image_digest: String, compose_dir: PathBuf) -> Result<(), NginxSidecarError> {
        let containers = self.runtime.list_containers(&self.container_name).await?;
        for container in &containers {
            self.runtime.stop(container).await?;
            self.runtime.remove(container).await?;
        }
        self.runtime.compose_up(&compose_dir).await?;

        let mut history = self.load_history()?;
        history.push(VersionSlot { image_digest, compose_dir });
        self.save_history(&history)?;
        Ok(())
    }

    /// Restores a previously-recorded slot by re-running compose-up against
    /// its compose directory, without re-pulling or re-resolving digests.
    pub async fn rollback_to(&self, slot: u8) -> Result<(), NginxSidecarError> {
        let history = self.load_history()?;
        let target = history.slot(slot).ok_or(NginxSidecarError::SlotUnavailable)?.clone();
        let containers = self.runtime.list_containers(&self.container_name).await?;
        for container in &containers {
            self.runtime.stop(container).await?;
            self.runtime.remove(container).await?;
        }
        self.runtime.compose_up(&target.compose_dir).await?;
        Ok(())
    }

    pub fn history(&self) -> Result<VersionHistory, NginxSidecarError> {
        self.load_history()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rotation_keeps_three_most_recent_slots() {
        let mut history = VersionHistory::default();
        history.push(VersionSlot { image_digest: "a".into(), compose_dir: PathBuf::new() });
        history.push(VersionSlot { image_digest: "b".into(), compose_dir: PathBuf::new() });
        history.push(VersionSlot { image_digest: "c".into(), compose_dir: PathBuf::new() });
        assert_eq!(history.current.as_ref().unwrap().image_digest, "c");
        assert_eq!(history.previous.as_ref().unwrap().image_digest, "b");
        assert_eq!(history.before_previous.as_ref().unwrap().image_digest, "a");

        history.push(VersionSlot { image_digest: "d".into(), compose_dir: PathBuf::new() });
        assert_eq!(history.before_previous.as_ref().unwrap().image_digest, "b");
    }

    #[test]
    fn slot_lookup_by_index() {
        let mut history = VersionHistory::default();
        history.push(VersionSlot { image_digest: "a".into(), compose_dir: PathBuf::new() });
        history.push(VersionSlot { image_digest: "b".into(), compose_dir: PathBuf::new() });
        assert_eq!(history.slot(0).unwrap().image_digest, "b");
        assert_eq!(history.slot(1).unwrap().image_digest, "a");
        assert!(history.slot(2).is_none());
    }

    #[tokio::test]
    async fn update_recreates_container_and_records_new_slot() {
        use crate::runtime::MockContainerRuntime;
        use tempfile::tempdir;

        let mut mock = MockContainerRuntime::new();
        mock.expect_list_containers()
            .returning(|_| Box::pin(async { Ok(vec!["gui-1".to_string()]) }));
        mock.expect_stop().returning(|_| Box::pin(async { Ok(()) }));
        mock.expect_remove().returning(|_| Box::pin(async { Ok(()) }));
        mock.expect_compose_up().returning(|_| Box::pin(async { Ok(()) }));

        let dir = tempdir().unwrap();
        let sidecar = NginxSidecar::new(Arc::new(mock), dir.path().join("history.json"), "gui");
        sidecar
            .update("sha256:newdigest".to_string(), dir.path().to_path_buf())
            .await
            .unwrap();

        let history = sidecar.history().unwrap();
        assert_eq!(history.current.unwrap().image_digest, "sha256:newdigest");
    }
}
