//! Append-only JSON-Lines audit trail for deployment actions and service
//! token usage. Deliberately isolated from the application's `tracing`
//! output: a permission error here disables the sink rather than crashing
//! the process, since audit logging is a safety net, not a load-bearing
//! control path.

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AuditError {
    #[error("failed to serialize audit event: `{0}`")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Serialize)]
pub struct AuditEvent {
    pub timestamp: DateTime<Utc>,
    pub event_type: String,
    pub agent_id: Option<String>,
    pub deployment_id: Option<String>,
    pub success: bool,
    pub details: serde_json::Value,
    pub token_hash: Option<String>,
}

pub struct AuditSink {
    path: PathBuf,
    enabled: Mutex<bool>,
}

impl AuditSink {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path,
            enabled: Mutex::new(true),
        }
    }

    fn write_event(&self, event: &AuditEvent) -> Result<(), AuditError> {
        let mut enabled = self.enabled.lock().unwrap();
        if !*enabled {
            return Ok(());
        }
        let line = serde_json::to_string(event)?;
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .and_then(|mut f| writeln!(f, "{line}"));
        if let Err(e) = result {
            if e.kind() == std::io::ErrorKind::PermissionDenied {
                tracing::warn!("audit log at {:?} is not writable, disabling audit sink", self.path);
                *enabled = false;
            } else {
                tracing::warn!("failed to write audit event: {e}");
            }
        }
        Ok(())
    }

    pub fn audit_deployment_action(
        &self,
        deployment_id: &str,
        agent_id: Option<&str>,
        action: &str,
        success: bool,
        details: serde_json::Value,
    ) -> Result<(), AuditError> {
        self.write_event(&AuditEvent {
            timestamp: Utc::now(),
            event_type: action.to_string(),
            agent_id: agent_id.map(|s| s.to_string()),
            deployment_id: Some(deployment_id.to_string()),
            success,
            details,
            token_hash: None,
        })
    }

    pub fn audit_service_token_use(&self, agent_id: &str, token: &str, context: &str) -> Result<(), AuditError> {
        self.write_event(&AuditEvent {
            timestamp: Utc::now(),
            event_type: "service_token_use".to_string(),
            agent_id: Some(agent_id.to_string()),
            deployment_id: None,
            success: true,
            details: serde_json::json!({ "context": context }),
            token_hash: Some(hash_token(token)),
        })
    }
}

fn hash_token(token: &str) -> String {
    let digest = Sha256::digest(token.as_bytes());
    digest.iter().take(4).map(|b| format!("{b:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    #[test]
    fn writes_jsonl_entries() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = AuditSink::new(path.clone());
        sink.audit_deployment_action("dep-1", Some("agent-1"), "phase_started", true, serde_json::json!({}))
            .unwrap();
        sink.audit_deployment_action("dep-1", Some("agent-1"), "phase_completed", true, serde_json::json!({}))
            .unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 2);
    }

    #[test]
    fn token_hash_is_eight_hex_chars() {
        let hash = hash_token("super-secret-token");
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn token_use_event_never_contains_raw_token() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = AuditSink::new(path.clone());
        sink.audit_service_token_use("agent-1", "super-secret-token", "shutdown").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("super-secret-token"));
    }
}
