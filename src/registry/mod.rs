//! Persistent record of known agents: identity, canary assignment, current
//! deployment tag, version transition history and encrypted service tokens.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("failed to read registry metadata: `{0}`")]
    Read(std::io::Error),
    #[error("failed to write registry metadata: `{0}`")]
    Write(std::io::Error),
    #[error("failed to serialize registry metadata: `{0}`")]
    Serialize(#[from] serde_json::Error),
    #[error("agent `{0}` is already registered")]
    AlreadyRegistered(String),
    #[error("agent `{0}` is not registered")]
    NotFound(String),
}

/// Composite identity for an agent occurrence: one logical agent id may have
/// multiple occurrences (e.g. blue/green siblings), disambiguated by
/// `occurrence_id`, further scoped to the host that runs it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeKey {
    pub agent_id: String,
    pub occurrence_id: Option<String>,
    #[serde(default = "default_server_id")]
    pub server_id: String,
}

fn default_server_id() -> String {
    "main".to_string()
}

impl CompositeKey {
    pub fn new(agent_id: impl Into<String>) -> Self {
        Self {
            agent_id: agent_id.into(),
            occurrence_id: None,
            server_id: default_server_id(),
        }
    }

    pub fn with_occurrence(mut self, occurrence_id: impl Into<String>) -> Self {
        self.occurrence_id = Some(occurrence_id.into());
        self
    }

    pub fn with_server(mut self, server_id: impl Into<String>) -> Self {
        self.server_id = server_id.into();
        self
    }

    /// Stable string form used as a map key / filename fragment.
    pub fn as_string(&self) -> String {
        match &self.occurrence_id {
            Some(occ) => format!("{}:{}@{}", self.agent_id, occ, self.server_id),
            None => format!("{}@{}", self.agent_id, self.server_id),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CanaryGroup {
    Explorer,
    EarlyAdopter,
    General,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionTransition {
    pub from_version: Option<String>,
    pub to_version: String,
    pub timestamp: DateTime<Utc>,
    pub initial_state: Option<String>,
    pub reached_work: bool,
    pub work_state_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentRecord {
    pub key: CompositeKey,
    pub name: String,
    pub api_port: u16,
    /// Directory containing the `docker-compose.yml` this agent is recreated
    /// from after a cooperative shutdown.
    pub compose_path: PathBuf,
    pub encrypted_token: Option<String>,
    pub encrypted_admin_password: Option<String>,
    pub canary_group: Option<CanaryGroup>,
    pub deployment_id: Option<String>,
    pub current_image_digest: Option<String>,
    pub version_transitions: Vec<VersionTransition>,
    pub last_work_state_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl AgentRecord {
    pub fn new(key: CompositeKey, name: impl Into<String>, api_port: u16, compose_path: PathBuf) -> Self {
        Self {
            key,
            name: name.into(),
            api_port,
            compose_path,
            encrypted_token: None,
            encrypted_admin_password: None,
            canary_group: None,
            deployment_id: None,
            current_image_digest: None,
            version_transitions: Vec::new(),
            last_work_state_at: None,
            created_at: Utc::now(),
            metadata: HashMap::new(),
        }
    }

    pub fn with_admin_password(mut self, encrypted_admin_password: String) -> Self {
        self.encrypted_admin_password = Some(encrypted_admin_password);
        self
    }

    pub fn with_metadata(mut self, metadata: HashMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }
}

#[derive(Default, Serialize, Deserialize)]
struct RegistryMetadata {
    agents: Vec<AgentRecord>,
}

pub struct Registry {
    path: PathBuf,
    token_backups_dir: PathBuf,
    agents: Mutex<HashMap<String, AgentRecord>>,
}

impl Registry {
    /// Loads the registry from disk if present, otherwise starts empty.
    pub fn load(path: PathBuf, token_backups_dir: PathBuf) -> Result<Self, RegistryError> {
        let agents = if path.exists() {
            let data = fs::read(&path).map_err(RegistryError::Read)?;
            let metadata: RegistryMetadata = serde_json::from_slice(&data)?;
            metadata
                .agents
                .into_iter()
                .map(|a| (a.key.as_string(), a))
                .collect()
        } else {
            HashMap::new()
        };
        Ok(Self {
            path,
            token_backups_dir,
            agents: Mutex::new(agents),
        })
    }

    fn save(&self, agents: &HashMap<String, AgentRecord>) -> Result<(), RegistryError> {
        let metadata = RegistryMetadata {
            agents: agents.values().cloned().collect(),
        };
        let serialized = serde_json::to_string_pretty(&metadata)?;
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(RegistryError::Write)?;
        }
        let tmp_path = self.path.with_extension("json.tmp");
        fs::write(&tmp_path, serialized).map_err(RegistryError::Write)?;
        fs::rename(&tmp_path, &self.path).map_err(RegistryError::Write)?;
        Ok(())
    }

    pub fn register_agent(&self, record: AgentRecord) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let key = record.key.as_string();
        if agents.contains_key(&key) {
            return Err(RegistryError::AlreadyRegistered(key));
        }
        agents.insert(key, record);
        self.save(&agents)
    }

    pub fn unregister_agent(&self, key: &CompositeKey) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let k = key.as_string();
        if agents.remove(&k).is_none() {
            return Err(RegistryError::NotFound(k));
        }
        self.save(&agents)
    }

    pub fn get_agent(&self, key: &CompositeKey) -> Option<AgentRecord> {
        self.agents.lock().unwrap().get(&key.as_string()).cloned()
    }

    pub fn get_agent_by_name(&self, name: &str) -> Option<AgentRecord> {
        self.agents
            .lock()
            .unwrap()
            .values()
            .find(|a| a.name == name)
            .cloned()
    }

    pub fn list_agents(&self) -> Vec<AgentRecord> {
        self.agents.lock().unwrap().values().cloned().collect()
    }

    pub fn update_agent_token(
        &self,
        key: &CompositeKey,
        encrypted_token: String,
    ) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let k = key.as_string();
        let agent = agents.get_mut(&k).ok_or_else(|| RegistryError::NotFound(k))?;
        agent.encrypted_token = Some(encrypted_token);
        self.save(&agents)
    }

    /// Snapshots the agent's current encrypted token under
    /// `token_backups/<key>-<timestamp>.json` before rotation.
    pub fn backup_token(&self, key: &CompositeKey) -> Result<(), RegistryError> {
        let agents = self.agents.lock().unwrap();
        let k = key.as_string();
        let agent = agents.get(&k).ok_or_else(|| RegistryError::NotFound(k.clone()))?;
        let Some(token) = &agent.encrypted_token else {
            return Ok(());
        };
        fs::create_dir_all(&self.token_backups_dir).map_err(RegistryError::Write)?;
        let filename = format!(
            "{}-{}.json",
            sanitize_filename(&k),
            Utc::now().format("%Y%m%dT%H%M%S%.fZ")
        );
        let backup = serde_json::json!({ "key": k, "encrypted_token": token, "backed_up_at": Utc::now() });
        fs::write(
            self.token_backups_dir.join(filename),
            serde_json::to_string_pretty(&backup)?,
        )
        .map_err(RegistryError::Write)?;
        Ok(())
    }

    /// Records the digest the agent's container was last recreated from.
    pub fn set_agent_image_digest(&self, key: &CompositeKey, digest: String) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let k = key.as_string();
        let agent = agents.get_mut(&k).ok_or_else(|| RegistryError::NotFound(k))?;
        agent.current_image_digest = Some(digest);
        self.save(&agents)
    }

    pub fn set_canary_group(
        &self,
        key: &CompositeKey,
        group: Option<CanaryGroup>,
    ) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let k = key.as_string();
        let agent = agents.get_mut(&k).ok_or_else(|| RegistryError::NotFound(k))?;
        agent.canary_group = group;
        self.save(&agents)
    }

    pub fn set_deployment(
        &self,
        key: &CompositeKey,
        deployment_id: Option<String>,
    ) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let k = key.as_string();
        let agent = agents.get_mut(&k).ok_or_else(|| RegistryError::NotFound(k))?;
        agent.deployment_id = deployment_id;
        self.save(&agents)
    }

    pub fn get_agents_by_deployment(&self, deployment_id: &str) -> Vec<AgentRecord> {
        self.agents
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.deployment_id.as_deref() == Some(deployment_id))
            .cloned()
            .collect()
    }

    /// Buckets all agents by canary group; agents with no group assigned are
    /// not returned under any key (callers that need "unassigned" semantics
    /// filter `list_agents()` directly).
    pub fn get_agents_by_canary_group(&self) -> HashMap<CanaryGroup, Vec<AgentRecord>> {
        let mut buckets: HashMap<CanaryGroup, Vec<AgentRecord>> = HashMap::new();
        for agent in self.agents.lock().unwrap().values() {
            if let Some(group) = agent.canary_group {
                buckets.entry(group).or_default().push(agent.clone());
            }
        }
        buckets
    }

    pub fn get_allocated_ports(&self) -> Vec<u16> {
        self.agents.lock().unwrap().values().map(|a| a.api_port).collect()
    }

    /// Records a version transition and updates `last_work_state_at`
    /// bookkeeping. If `work_state` is true, backfills `reached_work` /
    /// `work_state_at` on the most recent transition when it wasn't already
    /// marked, mirroring the original registry's "agent reached WORK after
    /// the transition was recorded" backfill.
    pub fn update_agent_state(
        &self,
        key: &CompositeKey,
        to_version: String,
        initial_state: Option<String>,
        is_new_transition: bool,
        work_state: bool,
    ) -> Result<(), RegistryError> {
        let mut agents = self.agents.lock().unwrap();
        let k = key.as_string();
        let agent = agents.get_mut(&k).ok_or_else(|| RegistryError::NotFound(k))?;
        let now = Utc::now();

        if is_new_transition {
            let from_version = agent.version_transitions.last().map(|t| t.to_version.clone());
            agent.version_transitions.push(VersionTransition {
                from_version,
                to_version,
                timestamp: now,
                initial_state,
                reached_work: work_state,
                work_state_at: work_state.then_some(now),
            });
        } else if let Some(last) = agent.version_transitions.last_mut() {
            if work_state && !last.reached_work {
                last.reached_work = true;
                last.work_state_at = Some(now);
            }
        }

        if work_state {
            agent.last_work_state_at = Some(now);
        }
        self.save(&agents)
    }
}

fn sanitize_filename(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn new_registry() -> (Registry, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_metadata.json");
        let backups = dir.path().join("token_backups");
        (Registry::load(path, backups).unwrap(), dir)
    }

    #[test]
    fn register_and_get_round_trip() {
        let (registry, _dir) = new_registry();
        let key = CompositeKey::new("agent-1");
        registry
            .register_agent(AgentRecord::new(key.clone(), "agent-1", 8080, PathBuf::from("/opt/agents/agent-1")))
            .unwrap();
        let fetched = registry.get_agent(&key).unwrap();
        assert_eq!(fetched.name, "agent-1");
    }

    #[test]
    fn duplicate_composite_key_is_rejected() {
        let (registry, _dir) = new_registry();
        let key = CompositeKey::new("agent-1");
        registry
            .register_agent(AgentRecord::new(key.clone(), "agent-1", 8080, PathBuf::from("/opt/agents/agent-1")))
            .unwrap();
        let result = registry.register_agent(AgentRecord::new(key, "agent-1-dup", 8081, PathBuf::from("/opt/agents/agent-1")));
        assert!(matches!(result, Err(RegistryError::AlreadyRegistered(_))));
    }

    #[test]
    fn same_agent_id_distinct_occurrence_is_allowed() {
        let (registry, _dir) = new_registry();
        let key_a = CompositeKey::new("agent-1").with_occurrence("blue");
        let key_b = CompositeKey::new("agent-1").with_occurrence("green");
        registry
            .register_agent(AgentRecord::new(key_a, "agent-1-blue", 8080, PathBuf::from("/opt/agents/agent-1")))
            .unwrap();
        registry
            .register_agent(AgentRecord::new(key_b, "agent-1-green", 8081, PathBuf::from("/opt/agents/agent-1")))
            .unwrap();
        assert_eq!(registry.list_agents().len(), 2);
    }

    #[test]
    fn persists_across_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("agent_metadata.json");
        let backups = dir.path().join("token_backups");
        let key = CompositeKey::new("agent-1");
        {
            let registry = Registry::load(path.clone(), backups.clone()).unwrap();
            registry
                .register_agent(AgentRecord::new(key.clone(), "agent-1", 8080, PathBuf::from("/opt/agents/agent-1")))
                .unwrap();
        }
        let reloaded = Registry::load(path, backups).unwrap();
        assert!(reloaded.get_agent(&key).is_some());
    }

    #[test]
    fn canary_group_buckets_only_assigned_agents() {
        let (registry, _dir) = new_registry();
        let key = CompositeKey::new("agent-1");
        registry
            .register_agent(AgentRecord::new(key.clone(), "agent-1", 8080, PathBuf::from("/opt/agents/agent-1")))
            .unwrap();
        registry.set_canary_group(&key, Some(CanaryGroup::Explorer)).unwrap();
        let buckets = registry.get_agents_by_canary_group();
        assert_eq!(buckets.get(&CanaryGroup::Explorer).unwrap().len(), 1);
        assert!(buckets.get(&CanaryGroup::General).is_none());
    }

    #[test]
    fn work_state_backfills_last_transition() {
        let (registry, _dir) = new_registry();
        let key = CompositeKey::new("agent-1");
        registry
            .register_agent(AgentRecord::new(key.clone(), "agent-1", 8080, PathBuf::from("/opt/agents/agent-1")))
            .unwrap();
        registry
            .update_agent_state(&key, "1.2.3".to_string(), Some("starting".to_string()), true, false)
            .unwrap();
        registry
            .update_agent_state(&key, "1.2.3".to_string(), None, false, true)
            .unwrap();
        let agent = registry.get_agent(&key).unwrap();
        let last = agent.version_transitions.last().unwrap();
        assert!(last.reached_work);
        assert!(last.work_state_at.is_some());
    }
}
