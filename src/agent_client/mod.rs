//! Authenticated HTTP client for an agent's own control-plane endpoints:
//! health/cognitive-state polling, graceful shutdown requests, and a
//! best-effort telemetry overview used by the canary health gate.

use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const TELEMETRY_CANDIDATE_PATHS: &[&str] = &[
    "/v1/telemetry/overview",
    "/v1/telemetry/unified?view=operational",
    "/v1/telemetry/llm/usage",
];

#[derive(Error, Debug)]
pub enum AgentClientError {
    #[error("failed to connect to agent at `{0}`")]
    Connect(String),
    #[error("request to agent at `{0}` timed out")]
    Timeout(String),
    #[error("agent returned unsuccessful response: {status} {body}")]
    UnsuccessfulResponse { status: u16, body: String },
    #[error("transport error: `{0}`")]
    Transport(String),
    #[error("no telemetry endpoint responded successfully")]
    TelemetryUnavailable,
}

#[derive(Debug, Deserialize)]
pub struct HealthResponse {
    pub cognitive_state: String,
}

#[derive(Debug, Deserialize, Default)]
pub struct TelemetryOverview {
    #[serde(default)]
    pub recent_incidents: Vec<serde_json::Value>,
}

pub enum ShutdownOutcome {
    Notified,
    Deferred,
    Rejected(String),
}

/// Abstracts the agent control-plane surface the orchestrator depends on, so
/// the canary health gate and update protocol can be exercised against a
/// fake in tests without a network dependency.
#[async_trait]
pub trait AgentControlClient: Send + Sync {
    async fn health(&self, api_port: u16, auth_header: (&str, &str)) -> Result<HealthResponse, AgentClientError>;
    async fn shutdown(
        &self,
        api_port: u16,
        auth_header: (&str, &str),
        reason: &str,
    ) -> Result<ShutdownOutcome, AgentClientError>;
    async fn telemetry_overview(
        &self,
        api_port: u16,
        auth_header: (&str, &str),
    ) -> Result<TelemetryOverview, AgentClientError>;
}

pub struct AgentClient {
    client: reqwest::Client,
}

impl AgentClient {
    pub fn new(timeout: Duration) -> Result<Self, AgentClientError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| AgentClientError::Transport(e.to_string()))?;
        Ok(Self { client })
    }

    fn base_url(api_port: u16) -> String {
        format!("http://localhost:{api_port}")
    }

    pub async fn health(&self, api_port: u16, auth_header: (&str, &str)) -> Result<HealthResponse, AgentClientError> {
        let url = format!("{}/v1/system/health", Self::base_url(api_port));
        let response = self
            .client
            .get(&url)
            .header(auth_header.0, auth_header.1)
            .send()
            .await
            .map_err(classify_transport_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            return Err(AgentClientError::UnsuccessfulResponse { status, body });
        }
        response.json().await.map_err(|e| AgentClientError::Transport(e.to_string()))
    }

    /// Probes `/v1/system/health` with a bare `Authorization` header value,
    /// returning whether the agent accepted the credential. Used by
    /// `AgentAuth::detect_auth_format`.
    pub async fn probe_status(&self, api_port: u16, authorization: &str) -> Result<bool, AgentClientError> {
        let url = format!("{}/v1/system/health", Self::base_url(api_port));
        let response = self
            .client
            .get(&url)
            .header("Authorization", authorization)
            .send()
            .await
            .map_err(classify_transport_error)?;
        Ok(response.status().is_success())
    }

    /// POSTs a shutdown request with a human-readable reason. HTTP 200 is
    /// `Notified`; a connect error is treated as `Notified` too (the agent
    /// may already be mid-shutdown, tearing down its listener); any other
    /// non-2xx status is `Rejected` with a truncated response body.
    pub async fn shutdown(
        &self,
        api_port: u16,
        auth_header: (&str, &str),
        reason: &str,
    ) -> Result<ShutdownOutcome, AgentClientError> {
        let url = format!("{}/v1/system/shutdown", Self::base_url(api_port));
        let body = serde_json::json!({ "reason": reason });
        let result = self
            .client
            .post(&url)
            .header(auth_header.0, auth_header.1)
            .json(&body)
            .send()
            .await;

        let response = match result {
            Ok(r) => r,
            Err(e) if e.is_connect() => return Ok(ShutdownOutcome::Notified),
            Err(e) => return Err(classify_transport_error(e)),
        };

        let status = response.status();
        if status.as_u16() == 200 {
            return Ok(ShutdownOutcome::Notified);
        }
        let text = response.text().await.unwrap_or_default();
        let truncated: String = text.chars().take(500).collect();
        if status.as_u16() == 202 {
            return Ok(ShutdownOutcome::Deferred);
        }
        Ok(ShutdownOutcome::Rejected(format!("HTTP {}: {}", status.as_u16(), truncated)))
    }

    /// Tries each candidate telemetry path in order, returning the first
    /// successful response. Telemetry errors never fail the caller outright;
    /// `TelemetryUnavailable` signals "treat as healthy, we just couldn't see".
    pub async fn telemetry_overview(
        &self,
        api_port: u16,
        auth_header: (&str, &str),
    ) -> Result<TelemetryOverview, AgentClientError> {
        for path in TELEMETRY_CANDIDATE_PATHS {
            let url = format!("{}{}", Self::base_url(api_port), path);
            let attempt = self
                .client
                .get(&url)
                .header(auth_header.0, auth_header.1)
                .send()
                .await;
            if let Ok(response) = attempt {
                if response.status().is_success() {
                    if let Ok(overview) = response.json::<TelemetryOverview>().await {
                        return Ok(overview);
                    }
                }
            }
        }
        Err(AgentClientError::TelemetryUnavailable)
    }
}

#[async_trait]
impl AgentControlClient for AgentClient {
    async fn health(&self, api_port: u16, auth_header: (&str, &str)) -> Result<HealthResponse, AgentClientError> {
        AgentClient::health(self, api_port, auth_header).await
    }

    async fn shutdown(
        &self,
        api_port: u16,
        auth_header: (&str, &str),
        reason: &str,
    ) -> Result<ShutdownOutcome, AgentClientError> {
        AgentClient::shutdown(self, api_port, auth_header, reason).await
    }

    async fn telemetry_overview(
        &self,
        api_port: u16,
        auth_header: (&str, &str),
    ) -> Result<TelemetryOverview, AgentClientError> {
        AgentClient::telemetry_overview(self, api_port, auth_header).await
    }
}

fn classify_transport_error(err: reqwest::Error) -> AgentClientError {
    let target = err.url().map(|u| u.to_string()).unwrap_or_default();
    if err.is_connect() {
        AgentClientError::Connect(target)
    } else if err.is_timeout() {
        AgentClientError::Timeout(target)
    } else {
        AgentClientError::Transport(err.to_string())
    }
}

/// Builds the shutdown reason string: names the target version (or commit
/// SHA when the version looks like one), the deployment id prefix, and an
/// optional changelog rendered as bullet points.
pub fn build_shutdown_reason(deployment_id: &str, target_version: &str, changelog: Option<&str>) -> String {
    let deployment_prefix: String = deployment_id.chars().take(8).collect();
    let version_phrase = if looks_like_commit_sha(target_version) {
        format!("commit {target_version}")
    } else {
        format!("version {target_version}")
    };
    let mut reason = format!("Deployment {deployment_prefix}: updating to {version_phrase}.");
    if let Some(changelog) = changelog {
        let bullets: String = changelog
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| format!("\n  - {}", l.trim()))
            .collect();
        if !bullets.is_empty() {
            reason.push_str(&format!(" Changes:{bullets}"));
        }
    }
    reason.push_str(" System shutdown requested for deployment rollout (API shutdown by wa-system-admin).");
    reason
}

fn looks_like_commit_sha(s: &str) -> bool {
    s.len() >= 7 && s.len() <= 40 && s.chars().all(|c| c.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::{GET, POST};
    use httpmock::MockServer;

    fn base_url_port(server: &MockServer) -> u16 {
        server.port()
    }

    #[tokio::test]
    async fn health_parses_cognitive_state() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v1/system/health");
            then.status(200).json_body(serde_json::json!({"cognitive_state": "WORK"}));
        });
        let client = AgentClient::new(Duration::from_secs(5)).unwrap();
        let response = client
            .health(base_url_port(&server), ("Authorization", "service:tok"))
            .await
            .unwrap();
        assert_eq!(response.cognitive_state, "WORK");
    }

    #[tokio::test]
    async fn shutdown_200_is_notified() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/system/shutdown");
            then.status(200);
        });
        let client = AgentClient::new(Duration::from_secs(5)).unwrap();
        let outcome = client
            .shutdown(base_url_port(&server), ("Authorization", "service:tok"), "reason")
            .await
            .unwrap();
        assert!(matches!(outcome, ShutdownOutcome::Notified));
    }

    #[tokio::test]
    async fn shutdown_non_200_is_rejected() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(POST).path("/v1/system/shutdown");
            then.status(500).body("boom");
        });
        let client = AgentClient::new(Duration::from_secs(5)).unwrap();
        let outcome = client
            .shutdown(base_url_port(&server), ("Authorization", "service:tok"), "reason")
            .await
            .unwrap();
        assert!(matches!(outcome, ShutdownOutcome::Rejected(_)));
    }

    #[test]
    fn shutdown_reason_names_version_and_deployment() {
        let reason = build_shutdown_reason("dep-0001-abcd", "1.4.0", Some("Fix bug\nImprove logs"));
        assert!(reason.contains("dep-0001-"));
        assert!(reason.contains("version 1.4.0"));
        assert!(reason.contains("- Fix bug"));
        assert!(reason.contains("wa-system-admin"));
    }

    #[test]
    fn shutdown_reason_detects_commit_sha() {
        let reason = build_shutdown_reason("dep-0002", "a1b2c3d", None);
        assert!(reason.contains("commit a1b2c3d"));
    }
}
