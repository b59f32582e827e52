use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::registry::{CanaryGroup, CompositeKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Canary,
    Immediate,
}

/// A request to roll a new image out to the fleet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateNotification {
    pub deployment_id: String,
    pub agent_image: Option<String>,
    pub nginx_image: Option<String>,
    pub target_version: String,
    pub changelog: Option<String>,
    pub strategy: Strategy,
}

/// Full deployment lifecycle. Not every variant is reachable through every
/// code path yet (`Pending`/`Staged`/`Cancelled` are data-model placeholders
/// for an admission queue and cooperative cancellation this crate doesn't
/// drive through its own triggers) but the type can represent all of them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentStatus {
    Pending,
    Staged,
    InProgress,
    Completed,
    Failed(String),
    Rejected(String),
    RollingBack,
    RolledBack,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PhaseResult {
    pub phase: CanaryGroup,
    pub agents_updated: u32,
    pub agents_deferred: u32,
    pub agents_failed: u32,
    pub gate_passed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentState {
    pub deployment_id: String,
    pub started_at: DateTime<Utc>,
    pub strategy: Strategy,
    pub status: DeploymentStatus,
    /// Human-readable detail that doesn't fit the status variant itself, e.g.
    /// "No update needed - images unchanged" for a fast-path completion.
    pub message: Option<String>,
    pub phases: Vec<PhaseResult>,
    pub agents_updated: u32,
    pub agents_deferred: u32,
    pub agents_failed: u32,
    /// Count of agents admitted into this deployment; invariant:
    /// `agents_updated + agents_deferred + agents_failed <= agents_total`.
    pub agents_total: u32,
    /// Digest resolved for `agent_image` at admission time, carried from
    /// `submit` to `run_deployment` without re-pulling.
    pub target_digest: Option<String>,
    pub nginx_target_digest: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum AgentUpdateOutcome {
    Notified,
    Deferred,
    Failed(String),
}

/// A stored proposal describing how to roll a deployment back, keyed by the
/// deployment id that introduced the change.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollbackProposal {
    pub deployment_id: String,
    pub previous_agent_image: Option<String>,
    pub previous_nginx_image: Option<String>,
    pub affected_agents: Vec<CompositeKey>,
    pub created_at: DateTime<Utc>,
}
