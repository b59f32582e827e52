//! The deployment orchestrator: admits update requests, pulls and resolves
//! the referenced images itself, detects whether an update is actually
//! needed, drives a canary or immediate rollout strategy, gates canary
//! phases on agent health, recreates containers after a cooperative
//! shutdown, and persists enough state to recover after a restart.

pub mod types;

use futures::future::join_all;
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::agent_client::{AgentClientError, AgentControlClient};
use crate::audit::AuditSink;
use crate::auth::{AgentAuth, AuthError};
use crate::image::{ImageReference, ImageResolver, ImageResolverError};
use crate::nginx_sidecar::NginxSidecar;
use crate::registry::{AgentRecord, CanaryGroup, Registry, RegistryError};
use crate::runtime::{ContainerRuntime, RuntimeError};

pub use types::{AgentUpdateOutcome, DeploymentState, DeploymentStatus, PhaseResult, RollbackProposal, Strategy, UpdateNotification};

const PHASE_ORDER: [CanaryGroup; 3] = [CanaryGroup::Explorer, CanaryGroup::EarlyAdopter, CanaryGroup::General];

#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("a deployment is already in progress")]
    AlreadyInProgress,
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Auth(#[from] AuthError),
    #[error(transparent)]
    AgentClient(#[from] AgentClientError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    ImageResolver(#[from] ImageResolverError),
    #[error("failed to read deployment state: `{0}`")]
    ReadState(std::io::Error),
    #[error("failed to write deployment state: `{0}`")]
    WriteState(std::io::Error),
    #[error("failed to serialize deployment state: `{0}`")]
    Serialize(#[from] serde_json::Error),
    #[error("no rollback proposal found for deployment `{0}`")]
    NoRollbackProposal(String),
}

pub struct HealthGateConfig {
    pub wait_for_work: Duration,
    pub stability_window: Duration,
    pub poll_interval: Duration,
}

pub struct Orchestrator {
    registry: Arc<Registry>,
    auth: Arc<AgentAuth>,
    agent_client: Arc<dyn AgentControlClient>,
    runtime: Arc<dyn ContainerRuntime>,
    image_resolver: Arc<ImageResolver>,
    nginx: Arc<NginxSidecar>,
    nginx_compose_dir: PathBuf,
    audit: Arc<AuditSink>,
    state_path: PathBuf,
    rollback_dir: PathBuf,
    current: AsyncMutex<Option<DeploymentState>>,
    health_gate: HealthGateConfig,
    container_stop_timeout: Duration,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        registry: Arc<Registry>,
        auth: Arc<AgentAuth>,
        agent_client: Arc<dyn AgentControlClient>,
        runtime: Arc<dyn ContainerRuntime>,
        image_resolver: Arc<ImageResolver>,
        nginx: Arc<NginxSidecar>,
        nginx_compose_dir: PathBuf,
        audit: Arc<AuditSink>,
        state_path: PathBuf,
        rollback_dir: PathBuf,
        container_stop_timeout: Duration,
        health_gate: HealthGateConfig,
    ) -> Self {
        Self {
            registry,
            auth,
            agent_client,
            runtime,
            image_resolver,
            nginx,
            nginx_compose_dir,
            audit,
            state_path,
            rollback_dir,
            current: AsyncMutex::new(None),
            health_gate,
            container_stop_timeout,
        }
    }

    /// Loads any previously-persisted deployment state. An `in_progress`
    /// deployment is left untouched for operator inspection, never resumed.
    pub fn recover(&self) -> Result<Option<DeploymentState>, OrchestratorError> {
        if !self.state_path.exists() {
            return Ok(None);
        }
        let data = fs::read(&self.state_path).map_err(OrchestratorError::ReadState)?;
        Ok(Some(serde_json::from_slice(&data)?))
    }

    fn persist_state(&self, state: &DeploymentState) -> Result<(), OrchestratorError> {
        let serialized = serde_json::to_string_pretty(state)?;
        if let Some(parent) = self.state_path.parent() {
            fs::create_dir_all(parent).map_err(OrchestratorError::WriteState)?;
        }
        let tmp = self.state_path.with_extension("json.tmp");
        fs::write(&tmp, serialized).map_err(OrchestratorError::WriteState)?;
        fs::rename(&tmp, &self.state_path).map_err(OrchestratorError::WriteState)?;
        Ok(())
    }

    fn agents_needing_update<'a>(&self, agents: &'a [AgentRecord], target_digest: &str) -> Vec<&'a AgentRecord> {
        agents
            .iter()
            .filter(|a| crate::image::needs_update(a.current_image_digest.as_deref(), target_digest))
            .collect()
    }

    /// Pulls an image reference via the container runtime, then resolves its
    /// digest. Local `docker inspect` is authoritative right after a pull;
    /// if that fails (e.g. the runtime stub doesn't support inspect for this
    /// reference), falls back to resolving the digest directly against the
    /// remote registry manifest endpoint.
    async fn pull_and_resolve(&self, image_ref: &str) -> Result<String, String> {
        self.runtime.pull(image_ref).await.map_err(|e| e.to_string())?;
        if let Ok(digest) = self.runtime.inspect_image_digest(image_ref).await {
            return Ok(digest);
        }
        let parsed = ImageReference::parse(image_ref).map_err(|e| e.to_string())?;
        let resolver = self.image_resolver.clone();
        tokio::task::spawn_blocking(move || resolver.resolve_remote_digest(&parsed))
            .await
            .map_err(|e| e.to_string())?
            .map_err(|e| e.to_string())
    }

    fn empty_state(&self, notification: &UpdateNotification, status: DeploymentStatus, message: Option<String>) -> DeploymentState {
        DeploymentState {
            deployment_id: notification.deployment_id.clone(),
            started_at: chrono::Utc::now(),
            strategy: notification.strategy,
            status,
            message,
            phases: Vec::new(),
            agents_updated: 0,
            agents_deferred: 0,
            agents_failed: 0,
            agents_total: 0,
            target_digest: None,
            nginx_target_digest: None,
        }
    }

    fn fail_immediately(
        &self,
        notification: &UpdateNotification,
        reason: String,
        current: &mut Option<DeploymentState>,
    ) -> Result<DeploymentStatus, OrchestratorError> {
        let state = self.empty_state(notification, DeploymentStatus::Failed(reason.clone()), Some(reason.clone()));
        self.persist_state(&state)?;
        *current = Some(state);
        let _ = self.audit.audit_deployment_action(
            &notification.deployment_id,
            None,
            "deployment_failed",
            false,
            serde_json::json!({ "reason": reason }),
        );
        Ok(DeploymentStatus::Failed(reason))
    }

    /// Admits a new deployment: rejects if one is already in progress, pulls
    /// every image the notification references (agent and/or nginx) and
    /// fails the deployment immediately if any pull fails, then
    /// short-circuits to `Completed` with a "no update needed" message if no
    /// agent actually needs the resolved digest and no proxy image changed.
    pub async fn submit(&self, notification: UpdateNotification) -> Result<DeploymentStatus, OrchestratorError> {
        let mut current = self.current.lock().await;
        if let Some(state) = current.as_ref() {
            if state.status == DeploymentStatus::InProgress {
                return Err(OrchestratorError::AlreadyInProgress);
            }
        }

        let agent_target_digest = match &notification.agent_image {
            Some(image) => match self.pull_and_resolve(image).await {
                Ok(digest) => Some(digest),
                Err(e) => return self.fail_immediately(&notification, format!("agent image pull failed: {e}"), &mut current),
            },
            None => None,
        };
        let nginx_target_digest = match &notification.nginx_image {
            Some(image) => match self.pull_and_resolve(image).await {
                Ok(digest) => Some(digest),
                Err(e) => return self.fail_immediately(&notification, format!("nginx image pull failed: {e}"), &mut current),
            },
            None => None,
        };

        let all_agents = self.registry.list_agents();
        let needing_update: Vec<AgentRecord> = match &agent_target_digest {
            Some(digest) => self.agents_needing_update(&all_agents, digest).into_iter().cloned().collect(),
            None => Vec::new(),
        };

        if needing_update.is_empty() && nginx_target_digest.is_none() {
            let mut state = self.empty_state(
                &notification,
                DeploymentStatus::Completed,
                Some("No update needed - images unchanged".to_string()),
            );
            state.target_digest = agent_target_digest;
            self.persist_state(&state)?;
            *current = Some(state);
            return Ok(DeploymentStatus::Completed);
        }

        let state = DeploymentState {
            deployment_id: notification.deployment_id.clone(),
            started_at: chrono::Utc::now(),
            strategy: notification.strategy,
            status: DeploymentStatus::InProgress,
            message: None,
            phases: Vec::new(),
            agents_updated: 0,
            agents_deferred: 0,
            agents_failed: 0,
            agents_total: needing_update.len() as u32,
            target_digest: agent_target_digest,
            nginx_target_digest,
        };
        self.persist_state(&state)?;
        *current = Some(state);
        Ok(DeploymentStatus::InProgress)
    }

    /// Runs the deployment to completion (proxy redeploy, then canary phases
    /// or a single immediate wave) and persists the final status. Intended
    /// to be spawned as a background task by the caller right after `submit`
    /// returns `InProgress`.
    pub async fn run_deployment(&self, notification: UpdateNotification) -> DeploymentStatus {
        let (target_digest, nginx_target_digest) = {
            let current = self.current.lock().await;
            match current.as_ref() {
                Some(state) => (state.target_digest.clone(), state.nginx_target_digest.clone()),
                None => (None, None),
            }
        };

        if let Some(nginx_digest) = &nginx_target_digest {
            if let Err(e) = self.nginx.update(nginx_digest.clone(), self.nginx_compose_dir.clone()).await {
                return self.finalize(&notification, Err(format!("nginx update failed: {e}"))).await;
            }
        }

        let result: Result<Vec<PhaseResult>, String> = match (&notification.agent_image, &target_digest) {
            (Some(_), Some(digest)) => match notification.strategy {
                Strategy::Canary => self.run_canary_deployment(&notification, digest).await,
                Strategy::Immediate => self.run_immediate_deployment(&notification, digest).await,
            },
            _ => Ok(Vec::new()),
        };

        self.finalize(&notification, result).await
    }

    async fn finalize(&self, notification: &UpdateNotification, result: Result<Vec<PhaseResult>, String>) -> DeploymentStatus {
        let mut current = self.current.lock().await;
        let final_status = match &result {
            Ok(phases) => {
                if let Some(state) = current.as_mut() {
                    state.phases = phases.clone();
                    state.agents_updated = phases.iter().map(|p| p.agents_updated).sum();
                    state.agents_deferred = phases.iter().map(|p| p.agents_deferred).sum();
                    state.agents_failed = phases.iter().map(|p| p.agents_failed).sum();
                    state.status = DeploymentStatus::Completed;
                }
                DeploymentStatus::Completed
            }
            Err(e) => {
                if let Some(state) = current.as_mut() {
                    state.status = DeploymentStatus::Failed(e.clone());
                }
                DeploymentStatus::Failed(e.clone())
            }
        };
        if let Some(state) = current.as_ref() {
            let _ = self.persist_state(state);
        }
        let _ = self.audit.audit_deployment_action(
            &notification.deployment_id,
            None,
            "deployment_finished",
            result.is_ok(),
            serde_json::json!({ "status": format!("{:?}", final_status) }),
        );
        final_status
    }

    async fn run_immediate_deployment(&self, notification: &UpdateNotification, target_digest: &str) -> Result<Vec<PhaseResult>, String> {
        let all_agents = self.registry.list_agents();
        let targets = self.agents_needing_update(&all_agents, target_digest);
        let phase = self
            .update_agent_group(&targets, notification, CanaryGroup::General, target_digest)
            .await;
        Ok(vec![phase])
    }

    async fn run_canary_deployment(&self, notification: &UpdateNotification, target_digest: &str) -> Result<Vec<PhaseResult>, String> {
        let buckets = self.registry.get_agents_by_canary_group();
        if PHASE_ORDER.iter().all(|g| buckets.get(g).map(|v| v.is_empty()).unwrap_or(true)) {
            return Err("No agents assigned to canary groups".to_string());
        }

        let mut results = Vec::new();
        for group in PHASE_ORDER {
            let Some(agents) = buckets.get(&group) else { continue };
            let targets: Vec<&AgentRecord> = agents
                .iter()
                .filter(|a| crate::image::needs_update(a.current_image_digest.as_deref(), target_digest))
                .collect();
            if targets.is_empty() {
                continue;
            }
            let phase_result = self.update_agent_group(&targets, notification, group, target_digest).await;
            let gate_passed = phase_result.gate_passed;
            results.push(phase_result);
            if !gate_passed {
                self.propose_rollback(notification, agents)?;
                return Err(format!("canary phase {group:?} failed its health gate"));
            }
        }
        Ok(results)
    }

    async fn update_agent_group(
        &self,
        agents: &[&AgentRecord],
        notification: &UpdateNotification,
        phase: CanaryGroup,
        target_digest: &str,
    ) -> PhaseResult {
        let outcomes = join_all(agents.iter().map(|agent| self.update_single_agent(agent, notification, target_digest))).await;

        let mut updated = 0;
        let mut deferred = 0;
        let mut failed = 0;
        for outcome in &outcomes {
            match outcome {
                AgentUpdateOutcome::Notified => updated += 1,
                AgentUpdateOutcome::Deferred => deferred += 1,
                AgentUpdateOutcome::Failed(_) => failed += 1,
            }
        }

        let gate_passed = if agents.is_empty() {
            true
        } else {
            let (passed, details) = self
                .check_canary_group_health(notification.deployment_id.as_str(), agents, phase)
                .await;
            let _ = self.audit.audit_deployment_action(
                &notification.deployment_id,
                None,
                "canary_health_gate",
                passed,
                details,
            );
            passed
        };

        PhaseResult {
            phase,
            agents_updated: updated,
            agents_deferred: deferred,
            agents_failed: failed,
            gate_passed,
        }
    }

    async fn update_single_agent(&self, agent: &AgentRecord, notification: &UpdateNotification, target_digest: &str) -> AgentUpdateOutcome {
        let (header_name, header_value) = match self.auth.get_auth_headers(&agent.key) {
            Ok(h) => h,
            Err(e) => {
                let _ = self.audit.audit_deployment_action(
                    &notification.deployment_id,
                    Some(&agent.key.as_string()),
                    "shutdown_rejected",
                    false,
                    serde_json::json!({ "reason": e.to_string() }),
                );
                return AgentUpdateOutcome::Failed(format!("authentication failed: {e}"));
            }
        };
        if header_value.starts_with("service:") {
            if let Ok(token) = self.auth.token_for(&agent.key) {
                let _ = self.audit.audit_service_token_use(&agent.key.as_string(), &token, "deployment_shutdown");
            }
        }

        let reason = crate::agent_client::build_shutdown_reason(
            &notification.deployment_id,
            &notification.target_version,
            notification.changelog.as_deref(),
        );
        let _ = self.audit.audit_deployment_action(
            &notification.deployment_id,
            Some(&agent.key.as_string()),
            "shutdown_requested",
            true,
            serde_json::json!({}),
        );

        match self.agent_client.shutdown(agent.api_port, (&header_name, &header_value), &reason).await {
            Ok(crate::agent_client::ShutdownOutcome::Notified) => {
                let _ = self.audit.audit_deployment_action(
                    &notification.deployment_id,
                    Some(&agent.key.as_string()),
                    "shutdown_notified",
                    true,
                    serde_json::json!({}),
                );
                match self.recreate_agent_container(agent, target_digest, &notification.target_version).await {
                    Ok(()) => {
                        let _ = self.audit.audit_deployment_action(
                            &notification.deployment_id,
                            Some(&agent.key.as_string()),
                            "recreate_succeeded",
                            true,
                            serde_json::json!({}),
                        );
                        AgentUpdateOutcome::Notified
                    }
                    Err(e) => {
                        let _ = self.audit.audit_deployment_action(
                            &notification.deployment_id,
                            Some(&agent.key.as_string()),
                            "recreate_failed",
                            false,
                            serde_json::json!({ "error": e }),
                        );
                        AgentUpdateOutcome::Failed(e)
                    }
                }
            }
            Ok(crate::agent_client::ShutdownOutcome::Deferred) => {
                let _ = self.audit.audit_deployment_action(
                    &notification.deployment_id,
                    Some(&agent.key.as_string()),
                    "shutdown_deferred",
                    true,
                    serde_json::json!({}),
                );
                AgentUpdateOutcome::Deferred
            }
            Ok(crate::agent_client::ShutdownOutcome::Rejected(msg)) => {
                let _ = self.audit.audit_deployment_action(
                    &notification.deployment_id,
                    Some(&agent.key.as_string()),
                    "shutdown_rejected",
                    false,
                    serde_json::json!({ "reason": msg }),
                );
                AgentUpdateOutcome::Failed(msg)
            }
            Err(e) => {
                let _ = self.audit.audit_deployment_action(
                    &notification.deployment_id,
                    Some(&agent.key.as_string()),
                    "shutdown_connection_error",
                    false,
                    serde_json::json!({ "error": e.to_string() }),
                );
                AgentUpdateOutcome::Failed(e.to_string())
            }
        }
    }

    /// Waits for the agent's container to actually stop, then recreates it
    /// via `docker compose up -d --force-recreate` against its compose
    /// directory. Only attempted after a `Notified`/connection-error
    /// shutdown outcome; if the container never stops within
    /// `container_stop_timeout`, recreation is abandoned and the agent is
    /// reported failed rather than torn down while still running.
    async fn recreate_agent_container(&self, agent: &AgentRecord, target_digest: &str, target_version: &str) -> Result<(), String> {
        let deadline = Instant::now() + self.container_stop_timeout;
        loop {
            let containers = self.runtime.list_containers(&agent.name).await.map_err(|e| e.to_string())?;
            if containers.is_empty() {
                break;
            }
            if Instant::now() >= deadline {
                return Err(format!("container for agent `{}` did not stop within timeout", agent.name));
            }
            tokio::time::sleep(self.health_gate.poll_interval).await;
        }

        self.runtime.compose_up(&agent.compose_path).await.map_err(|e| e.to_string())?;
        self.registry
            .set_agent_image_digest(&agent.key, target_digest.to_string())
            .map_err(|e| e.to_string())?;
        self.registry
            .update_agent_state(&agent.key, target_version.to_string(), None, true, false)
            .map_err(|e| e.to_string())?;
        Ok(())
    }

    /// Polls each agent's health until it reaches the `WORK` cognitive state
    /// (bounded by `wait_for_work`), then watches telemetry for incidents
    /// over `stability_window`. Telemetry errors are tolerated; they do not
    /// fail the gate, since observability gaps are not the same as incidents.
    async fn check_canary_group_health(
        &self,
        _deployment_id: &str,
        agents: &[&AgentRecord],
        _phase: CanaryGroup,
    ) -> (bool, serde_json::Value) {
        let deadline = Instant::now() + self.health_gate.wait_for_work;
        let mut successful = Vec::new();

        for agent in agents {
            let (header_name, header_value) = self
                .auth
                .get_auth_headers(&agent.key)
                .unwrap_or(("Authorization".to_string(), String::new()));

            loop {
                if let Ok(response) = self.agent_client.health(agent.api_port, (&header_name, &header_value)).await {
                    if response.cognitive_state == "WORK" {
                        successful.push(agent.key.as_string());
                        break;
                    }
                }
                if Instant::now() >= deadline {
                    break;
                }
                tokio::time::sleep(self.health_gate.poll_interval).await;
            }
        }

        if successful.len() != agents.len() {
            return (
                false,
                serde_json::json!({ "reason": "not all agents reached WORK", "successful_agent": successful }),
            );
        }

        let stable_deadline = Instant::now() + self.health_gate.stability_window;
        while Instant::now() < stable_deadline {
            for agent in agents {
                let (header_name, header_value) = self
                    .auth
                    .get_auth_headers(&agent.key)
                    .unwrap_or(("Authorization".to_string(), String::new()));
                if let Ok(overview) = self
                    .agent_client
                    .telemetry_overview(agent.api_port, (&header_name, &header_value))
                    .await
                {
                    if !overview.recent_incidents.is_empty() {
                        return (
                            false,
                            serde_json::json!({ "reason": "incident detected during stability window", "agent": agent.key.as_string() }),
                        );
                    }
                }
            }
            tokio::time::sleep(self.health_gate.poll_interval).await;
        }

        (true, serde_json::json!({ "successful_agent": successful }))
    }

    /// Writes a rollback proposal populated from the agents' pre-update
    /// digests (the bucket was fetched once at deployment start, before any
    /// recreate ran) and the proxy sidecar's previous version slot.
    fn propose_rollback(&self, notification: &UpdateNotification, agents: &[AgentRecord]) -> Result<(), String> {
        let previous_agent_image = agents.iter().find_map(|a| a.current_image_digest.clone());
        let previous_nginx_image = self
            .nginx
            .history()
            .ok()
            .and_then(|h| h.previous.map(|slot| slot.image_digest));

        let proposal = RollbackProposal {
            deployment_id: notification.deployment_id.clone(),
            previous_agent_image,
            previous_nginx_image,
            affected_agents: agents.iter().map(|a| a.key.clone()).collect(),
            created_at: chrono::Utc::now(),
        };
        fs::create_dir_all(&self.rollback_dir).map_err(|e| e.to_string())?;
        let path = self.rollback_dir.join(format!("{}.json", notification.deployment_id));
        let serialized = serde_json::to_string_pretty(&proposal).map_err(|e| e.to_string())?;
        fs::write(path, serialized).map_err(|e| e.to_string())?;
        Ok(())
    }

    pub fn get_rollback_proposal(&self, deployment_id: &str) -> Result<RollbackProposal, OrchestratorError> {
        let path = self.rollback_dir.join(format!("{deployment_id}.json"));
        let data = fs::read(&path).map_err(|_| OrchestratorError::NoRollbackProposal(deployment_id.to_string()))?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Re-drives the update protocol against the proposal's previous digests:
    /// recreates the proxy container from its recorded history slot, then
    /// runs an immediate wave against the affected agents using the
    /// proposal's `previous_agent_image` digest as the target.
    pub async fn execute_rollback(&self, deployment_id: &str, nginx_slot: u8) -> Result<DeploymentStatus, OrchestratorError> {
        {
            let current = self.current.lock().await;
            if let Some(state) = current.as_ref() {
                if state.status == DeploymentStatus::InProgress {
                    return Err(OrchestratorError::AlreadyInProgress);
                }
            }
        }

        let proposal = self.get_rollback_proposal(deployment_id)?;
        let notification = UpdateNotification {
            deployment_id: format!("{deployment_id}-rollback"),
            agent_image: proposal.previous_agent_image.clone(),
            nginx_image: proposal.previous_nginx_image.clone(),
            target_version: "rollback".to_string(),
            changelog: None,
            strategy: Strategy::Immediate,
        };

        {
            let mut current = self.current.lock().await;
            let mut state = self.empty_state(
                &notification,
                DeploymentStatus::RollingBack,
                Some(format!("rolling back deployment {deployment_id}")),
            );
            state.agents_total = proposal.affected_agents.len() as u32;
            state.target_digest = proposal.previous_agent_image.clone();
            state.nginx_target_digest = proposal.previous_nginx_image.clone();
            self.persist_state(&state)?;
            *current = Some(state);
        }

        if proposal.previous_nginx_image.is_some() {
            if let Err(e) = self.nginx.rollback_to(nginx_slot).await {
                return Ok(self.finalize(&notification, Err(format!("nginx rollback failed: {e}"))).await);
            }
        }

        let agents: Vec<AgentRecord> = proposal
            .affected_agents
            .iter()
            .filter_map(|k| self.registry.get_agent(k))
            .collect();
        let refs: Vec<&AgentRecord> = agents.iter().collect();

        let result: Result<Vec<PhaseResult>, String> = if let Some(target_digest) = &proposal.previous_agent_image {
            let phase = self.update_agent_group(&refs, &notification, CanaryGroup::General, target_digest).await;
            Ok(vec![phase])
        } else {
            Ok(Vec::new())
        };

        let status = self.finalize(&notification, result).await;
        let mut current = self.current.lock().await;
        if let Some(state) = current.as_mut() {
            if matches!(state.status, DeploymentStatus::Completed) {
                state.status = DeploymentStatus::RolledBack;
            }
        }
        let final_status = current.as_ref().map(|s| s.status.clone()).unwrap_or(status);
        if let Some(state) = current.as_ref() {
            let _ = self.persist_state(state);
        }
        Ok(final_status)
    }

    pub async fn current_state(&self) -> Option<DeploymentState> {
        self.current.lock().await.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent_client::{HealthResponse, ShutdownOutcome, TelemetryOverview};
    use crate::crypto::{KeySource, TokenCrypt};
    use crate::registry::{AgentRecord, CompositeKey};
    use crate::runtime::MockContainerRuntime;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use tempfile::tempdir;

    struct FakeAgentClient {
        work_after_calls: u32,
        calls: AtomicU32,
        incidents: bool,
    }

    #[async_trait]
    impl AgentControlClient for FakeAgentClient {
        async fn health(&self, _api_port: u16, _auth_header: (&str, &str)) -> Result<HealthResponse, AgentClientError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            let state = if n >= self.work_after_calls { "WORK" } else { "WAKEUP" };
            Ok(HealthResponse { cognitive_state: state.to_string() })
        }

        async fn shutdown(&self, _api_port: u16, _auth_header: (&str, &str), _reason: &str) -> Result<ShutdownOutcome, AgentClientError> {
            Ok(ShutdownOutcome::Notified)
        }

        async fn telemetry_overview(&self, _api_port: u16, _auth_header: (&str, &str)) -> Result<TelemetryOverview, AgentClientError> {
            if self.incidents {
                Ok(TelemetryOverview { recent_incidents: vec![serde_json::json!({"severity": "critical"})] })
            } else {
                Ok(TelemetryOverview::default())
            }
        }
    }

    fn fake_runtime() -> Arc<dyn ContainerRuntime> {
        let mut mock = MockContainerRuntime::new();
        mock.expect_pull().returning(|_| Box::pin(async { Ok(()) }));
        mock.expect_inspect_image_digest()
            .returning(|_| Box::pin(async { Ok("sha256:new".to_string()) }));
        mock.expect_list_containers().returning(|_| Box::pin(async { Ok(vec![]) }));
        mock.expect_stop().returning(|_| Box::pin(async { Ok(()) }));
        mock.expect_remove().returning(|_| Box::pin(async { Ok(()) }));
        mock.expect_compose_up().returning(|_| Box::pin(async { Ok(()) }));
        Arc::new(mock)
    }

    fn test_setup(
        agent_client: Arc<dyn AgentControlClient>,
        wait_for_work: Duration,
        stability: Duration,
    ) -> (Orchestrator, tempfile::TempDir, Arc<Registry>, Arc<TokenCrypt>) {
        let dir = tempdir().unwrap();
        let registry = Arc::new(Registry::load(dir.path().join("agents.json"), dir.path().join("backups")).unwrap());
        let crypt = Arc::new(TokenCrypt::new(KeySource::Derived { secret: "s".into(), salt: "0123456789abcdef".into() }).unwrap());
        let auth = Arc::new(AgentAuth::new(10, registry.clone(), crypt.clone()));
        let audit = Arc::new(AuditSink::new(dir.path().join("audit.jsonl")));
        let runtime = fake_runtime();
        let image_resolver = Arc::new(ImageResolver::new(Duration::from_secs(5)).unwrap());
        let nginx = Arc::new(NginxSidecar::new(runtime.clone(), dir.path().join("nginx_history.json"), "gui"));
        let orchestrator = Orchestrator::new(
            registry.clone(),
            auth,
            agent_client,
            runtime,
            image_resolver,
            nginx,
            dir.path().join("nginx_compose"),
            audit,
            dir.path().join("state.json"),
            dir.path().join("rollback"),
            Duration::from_millis(5),
            HealthGateConfig { wait_for_work, stability_window: stability, poll_interval: Duration::from_millis(1) },
        );
        (orchestrator, dir, registry, crypt)
    }

    fn register_agent(registry: &Registry, crypt: &TokenCrypt, name: &str, group: CanaryGroup, port: u16) -> CompositeKey {
        let key = CompositeKey::new(name);
        let mut record = AgentRecord::new(key.clone(), name, port, PathBuf::from(format!("/opt/agents/{name}")));
        record.encrypted_token = Some(crypt.encrypt_token("tok").unwrap());
        registry.register_agent(record).unwrap();
        registry.set_canary_group(&key, Some(group)).unwrap();
        key
    }

    #[tokio::test]
    async fn submit_is_completed_when_no_agent_needs_update() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: false });
        let (orchestrator, _dir, registry, crypt) = test_setup(fake, Duration::from_millis(20), Duration::from_millis(5));
        let key = register_agent(&registry, &crypt, "agent-1", CanaryGroup::Explorer, 8080);
        registry.set_agent_image_digest(&key, "sha256:new".to_string()).unwrap();

        let notification = UpdateNotification {
            deployment_id: "dep-1".into(),
            agent_image: Some("img".into()),
            nginx_image: None,
            target_version: "1.0.0".into(),
            changelog: None,
            strategy: Strategy::Canary,
        };
        let status = orchestrator.submit(notification).await.unwrap();
        assert_eq!(status, DeploymentStatus::Completed);
    }

    #[tokio::test]
    async fn rejects_concurrent_submission() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: false });
        let (orchestrator, _dir, registry, crypt) = test_setup(fake, Duration::from_millis(20), Duration::from_millis(5));
        register_agent(&registry, &crypt, "agent-1", CanaryGroup::Explorer, 8080);
        let notification = UpdateNotification {
            deployment_id: "dep-1".into(),
            agent_image: Some("img".into()),
            nginx_image: None,
            target_version: "1.0.0".into(),
            changelog: None,
            strategy: Strategy::Canary,
        };
        let first = orchestrator.submit(notification.clone()).await.unwrap();
        assert_eq!(first, DeploymentStatus::InProgress);
        let second = orchestrator.submit(notification).await;
        assert!(matches!(second, Err(OrchestratorError::AlreadyInProgress)));
    }

    #[tokio::test]
    async fn canary_phase_gate_passes_when_agents_reach_work_without_incidents() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: false });
        let (orchestrator, _dir, registry, crypt) = test_setup(fake, Duration::from_millis(50), Duration::from_millis(10));
        register_agent(&registry, &crypt, "agent-1", CanaryGroup::Explorer, 8080);
        let notification = UpdateNotification {
            deployment_id: "dep-1".into(),
            agent_image: Some("img".into()),
            nginx_image: None,
            target_version: "1.0.0".into(),
            changelog: None,
            strategy: Strategy::Canary,
        };
        let status = orchestrator.submit(notification.clone()).await.unwrap();
        assert_eq!(status, DeploymentStatus::InProgress);
        let final_status = orchestrator.run_deployment(notification).await;
        assert_eq!(final_status, DeploymentStatus::Completed);
    }

    #[tokio::test]
    async fn canary_phase_gate_fails_and_writes_rollback_proposal_on_incident() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: true });
        let (orchestrator, _dir, registry, crypt) = test_setup(fake, Duration::from_millis(50), Duration::from_millis(10));
        register_agent(&registry, &crypt, "agent-1", CanaryGroup::Explorer, 8080);
        let notification = UpdateNotification {
            deployment_id: "dep-2".into(),
            agent_image: Some("img".into()),
            nginx_image: None,
            target_version: "1.0.0".into(),
            changelog: None,
            strategy: Strategy::Canary,
        };
        orchestrator.submit(notification.clone()).await.unwrap();
        let final_status = orchestrator.run_deployment(notification).await;
        assert!(matches!(final_status, DeploymentStatus::Failed(_)));
        assert!(orchestrator.get_rollback_proposal("dep-2").is_ok());
    }

    #[tokio::test]
    async fn canary_with_no_assigned_agents_fails_fast() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: false });
        let (orchestrator, _dir, registry, crypt) = test_setup(fake, Duration::from_millis(20), Duration::from_millis(5));
        // Register an agent but assign no canary group.
        let key = CompositeKey::new("agent-1");
        let mut record = AgentRecord::new(key.clone(), "agent-1", 8080, PathBuf::from("/opt/agents/agent-1"));
        record.encrypted_token = Some(crypt.encrypt_token("tok").unwrap());
        registry.register_agent(record).unwrap();
        let notification = UpdateNotification {
            deployment_id: "dep-3".into(),
            agent_image: Some("img".into()),
            nginx_image: None,
            target_version: "1.0.0".into(),
            changelog: None,
            strategy: Strategy::Canary,
        };
        orchestrator.submit(notification.clone()).await.unwrap();
        let final_status = orchestrator.run_deployment(notification).await;
        assert!(matches!(final_status, DeploymentStatus::Failed(_)));
    }

    #[tokio::test]
    async fn immediate_strategy_updates_all_needing_agents() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: false });
        let (orchestrator, _dir, registry, crypt) = test_setup(fake, Duration::from_millis(20), Duration::from_millis(5));
        register_agent(&registry, &crypt, "agent-1", CanaryGroup::Explorer, 8080);
        register_agent(&registry, &crypt, "agent-2", CanaryGroup::General, 8081);
        let notification = UpdateNotification {
            deployment_id: "dep-4".into(),
            agent_image: Some("img".into()),
            nginx_image: None,
            target_version: "1.0.0".into(),
            changelog: None,
            strategy: Strategy::Immediate,
        };
        orchestrator.submit(notification.clone()).await.unwrap();
        let final_status = orchestrator.run_deployment(notification).await;
        assert_eq!(final_status, DeploymentStatus::Completed);
    }

    #[tokio::test]
    async fn nginx_only_notification_bypasses_agent_machinery() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: false });
        let (orchestrator, _dir, registry, crypt) = test_setup(fake, Duration::from_millis(20), Duration::from_millis(5));
        register_agent(&registry, &crypt, "agent-1", CanaryGroup::Explorer, 8080);
        let notification = UpdateNotification {
            deployment_id: "dep-5".into(),
            agent_image: None,
            nginx_image: Some("gui-img".into()),
            target_version: "1.0.0".into(),
            changelog: None,
            strategy: Strategy::Immediate,
        };
        let status = orchestrator.submit(notification.clone()).await.unwrap();
        assert_eq!(status, DeploymentStatus::InProgress);
        let final_status = orchestrator.run_deployment(notification).await;
        assert_eq!(final_status, DeploymentStatus::Completed);
        let state = orchestrator.current_state().await.unwrap();
        assert!(state.phases.is_empty());
        assert_eq!(state.agents_updated, 0);
    }

    #[tokio::test]
    async fn recover_returns_none_without_prior_state() {
        let fake = Arc::new(FakeAgentClient { work_after_calls: 0, calls: AtomicU32::new(0), incidents: false });
        let (orchestrator, _dir, _registry, _crypt) = test_setup(fake, Duration::from_millis(10), Duration::from_millis(5));
        assert!(orchestrator.recover().unwrap().is_none());
    }
}
