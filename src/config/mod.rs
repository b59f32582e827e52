//! Process configuration: secrets, paths, timeouts and thresholds.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SettingsError {
    #[error("failed to load configuration: `{0}`")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: `{0}`")]
    Invalid(String),
}

/// Raw, deserializable configuration shape. `Settings` below derives the
/// typed, validated form consumers actually use.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct RawSettings {
    state_dir: String,
    encryption_key: Option<String>,
    secret: Option<String>,
    salt: Option<String>,
    circuit_breaker_threshold: u32,
    auth_request_timeout_secs: u64,
    registry_request_timeout_secs: u64,
    shutdown_request_timeout_secs: u64,
    wait_for_work_minutes: u64,
    stability_minutes: u64,
    phase_agent_concurrency: usize,
    nginx_compose_dir: String,
    nginx_container_name: String,
    container_stop_timeout_secs: u64,
}

impl Default for RawSettings {
    fn default() -> Self {
        Self {
            state_dir: "./fleet-manager-state".to_string(),
            encryption_key: None,
            secret: None,
            salt: None,
            circuit_breaker_threshold: 10,
            auth_request_timeout_secs: 10,
            registry_request_timeout_secs: 10,
            shutdown_request_timeout_secs: 30,
            wait_for_work_minutes: 10,
            stability_minutes: 5,
            phase_agent_concurrency: 8,
            nginx_compose_dir: "./nginx".to_string(),
            nginx_container_name: "gui".to_string(),
            container_stop_timeout_secs: 60,
        }
    }
}

/// Validated, typed settings for the whole process.
#[derive(Debug, Clone)]
pub struct Settings {
    pub state_dir: PathBuf,
    pub encryption_key_b64: Option<String>,
    pub secret: Option<String>,
    pub salt: Option<String>,
    pub circuit_breaker_threshold: u32,
    pub auth_request_timeout: Duration,
    pub registry_request_timeout: Duration,
    pub shutdown_request_timeout: Duration,
    pub wait_for_work: Duration,
    pub stability_window: Duration,
    pub phase_agent_concurrency: usize,
    pub nginx_compose_dir: PathBuf,
    pub nginx_container_name: String,
    pub container_stop_timeout: Duration,
}

impl Settings {
    /// Loads settings from an optional JSON file layered under environment
    /// variables prefixed `FLEET_MANAGER_` (e.g. `FLEET_MANAGER_STATE_DIR`).
    pub fn load(config_path: Option<&std::path::Path>) -> Result<Self, SettingsError> {
        let mut builder = config::Config::builder();
        if let Some(path) = config_path {
            builder = builder.add_source(
                config::File::from(path.to_path_buf())
                    .format(config::FileFormat::Json)
                    .required(false),
            );
        }
        let raw: RawSettings = builder
            .add_source(
                config::Environment::with_prefix("FLEET_MANAGER")
                    .try_parsing(true)
                    .separator("_"),
            )
            .build()?
            .try_deserialize()
            .unwrap_or_default();

        if raw.encryption_key.is_none() && raw.secret.is_none() {
            return Err(SettingsError::Invalid(
                "one of encryption_key or secret must be configured".to_string(),
            ));
        }

        Ok(Self {
            state_dir: PathBuf::from(raw.state_dir),
            encryption_key_b64: raw.encryption_key,
            secret: raw.secret,
            salt: raw.salt,
            circuit_breaker_threshold: raw.circuit_breaker_threshold,
            auth_request_timeout: Duration::from_secs(raw.auth_request_timeout_secs),
            registry_request_timeout: Duration::from_secs(raw.registry_request_timeout_secs),
            shutdown_request_timeout: Duration::from_secs(raw.shutdown_request_timeout_secs),
            wait_for_work: Duration::from_secs(raw.wait_for_work_minutes * 60),
            stability_window: Duration::from_secs(raw.stability_minutes * 60),
            phase_agent_concurrency: raw.phase_agent_concurrency,
            nginx_compose_dir: PathBuf::from(raw.nginx_compose_dir),
            nginx_container_name: raw.nginx_container_name,
            container_stop_timeout: Duration::from_secs(raw.container_stop_timeout_secs),
        })
    }

    pub fn registry_metadata_path(&self) -> PathBuf {
        self.state_dir.join("agent_metadata.json")
    }

    pub fn deployment_state_path(&self) -> PathBuf {
        self.state_dir.join("deployment_state.json")
    }

    pub fn version_history_path(&self, kind: &str) -> PathBuf {
        self.state_dir.join(format!("version_history_{kind}.json"))
    }

    pub fn audit_log_path(&self) -> PathBuf {
        self.state_dir.join("audit.jsonl")
    }

    pub fn token_backups_dir(&self) -> PathBuf {
        self.state_dir.join("token_backups")
    }

    pub fn rollback_proposals_dir(&self) -> PathBuf {
        self.state_dir.join("rollback_proposals")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    #[serial]
    fn rejects_missing_secret_and_key() {
        // No env vars, no file: defaults alone are insufficient. Serialized
        // against other env-var-mutating tests in this module.
        std::env::remove_var("FLEET_MANAGER_SECRET");
        std::env::remove_var("FLEET_MANAGER_ENCRYPTION_KEY");
        let result = Settings::load(None);
        assert!(result.is_err());
    }

    #[test]
    #[serial]
    fn accepts_secret_from_env() {
        std::env::set_var("FLEET_MANAGER_SECRET", "unit-test-secret");
        std::env::set_var("FLEET_MANAGER_SALT", "0123456789abcdef");
        let result = Settings::load(None);
        std::env::remove_var("FLEET_MANAGER_SECRET");
        std::env::remove_var("FLEET_MANAGER_SALT");
        assert!(result.is_ok());
    }
}
