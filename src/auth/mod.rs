//! Credential header construction, auth-format detection and caching,
//! exponential backoff with a manual-reset circuit breaker.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use thiserror::Error;

use crate::crypto::TokenCrypt;
use crate::registry::{CompositeKey, Registry};

#[derive(Error, Debug)]
pub enum AuthError {
    #[error("agent `{0}` has no service token configured")]
    NoToken(String),
    #[error("agent `{0}` is not registered")]
    UnknownAgent(String),
    #[error("failed to decrypt token for agent `{0}`: `{1}`")]
    Decrypt(String, String),
    #[error("auth circuit breaker is open for agent `{0}`")]
    CircuitOpen(String),
    #[error("auth attempt for `{0}` is backed off until a later time")]
    BackedOff(String),
    #[error("probe failed: `{0}`")]
    Probe(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthFormat {
    /// `Authorization: service:<token>`
    ServicePrefixed,
    /// `Authorization: <token>`
    Raw,
}

impl AuthFormat {
    fn header_value(&self, token: &str) -> String {
        match self {
            AuthFormat::ServicePrefixed => format!("service:{token}"),
            AuthFormat::Raw => token.to_string(),
        }
    }
}

/// Probes an agent to learn which `AuthFormat` it accepts. Implemented by the
/// HTTP agent client; kept abstract here so backoff/circuit-breaker logic is
/// unit-testable without a network dependency.
#[async_trait]
pub trait AuthProbe: Send + Sync {
    async fn probe(&self, key: &CompositeKey, token: &str, format: AuthFormat) -> Result<bool, AuthError>;
}

#[derive(Debug, Clone, Default)]
struct BackoffState {
    failure_count: u32,
    backoff_until: Option<Instant>,
    circuit_open: bool,
}

pub struct BackoffStatus {
    pub failure_count: u32,
    pub circuit_open: bool,
    pub backed_off: bool,
}

/// Looks agents up and decrypts their service tokens directly: the registry
/// knows nothing of auth, and `AgentAuth` holds only a reference capability
/// for lookup, not ownership of agent records.
pub struct AgentAuth {
    circuit_breaker_threshold: u32,
    registry: Arc<Registry>,
    crypt: Arc<TokenCrypt>,
    state: Mutex<HashMap<String, BackoffState>>,
    format_cache: Mutex<HashMap<String, AuthFormat>>,
}

impl AgentAuth {
    pub fn new(circuit_breaker_threshold: u32, registry: Arc<Registry>, crypt: Arc<TokenCrypt>) -> Self {
        Self {
            circuit_breaker_threshold,
            registry,
            crypt,
            state: Mutex::new(HashMap::new()),
            format_cache: Mutex::new(HashMap::new()),
        }
    }

    /// Looks the agent up in the registry and decrypts its service token.
    pub fn token_for(&self, key: &CompositeKey) -> Result<String, AuthError> {
        let agent = self
            .registry
            .get_agent(key)
            .ok_or_else(|| AuthError::UnknownAgent(key.as_string()))?;
        let encrypted = agent
            .encrypted_token
            .ok_or_else(|| AuthError::NoToken(key.as_string()))?;
        self.crypt
            .decrypt_token(&encrypted)
            .map_err(|e| AuthError::Decrypt(key.as_string(), e.to_string()))
    }

    pub fn get_auth_headers(&self, key: &CompositeKey) -> Result<(String, String), AuthError> {
        let token = self.token_for(key)?;
        let format = self
            .format_cache
            .lock()
            .unwrap()
            .get(&key.as_string())
            .copied()
            .unwrap_or(AuthFormat::ServicePrefixed);
        Ok(("Authorization".to_string(), format.header_value(&token)))
    }

    /// Verifies a presented token against the expected one in constant time
    /// with respect to byte content (length differences still short-circuit,
    /// as they do in every standard constant-time comparison primitive).
    pub fn verify_token(expected: &str, presented: &str) -> bool {
        let (a, b) = (expected.as_bytes(), presented.as_bytes());
        if a.len() != b.len() {
            return false;
        }
        let diff = a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y));
        diff == 0
    }

    fn should_skip_auth_attempt(&self, key: &CompositeKey) -> Result<(), AuthError> {
        let state = self.state.lock().unwrap();
        let Some(s) = state.get(&key.as_string()) else {
            return Ok(());
        };
        if s.circuit_open {
            return Err(AuthError::CircuitOpen(key.as_string()));
        }
        if let Some(until) = s.backoff_until {
            if Instant::now() < until {
                return Err(AuthError::BackedOff(key.as_string()));
            }
        }
        Ok(())
    }

    /// Exact schedule: failure 1 -> 30s, failure 2 -> 60s, failures >= 3 ->
    /// min(60 * 2^(n-2), 900s). The circuit opens once the failure count
    /// reaches `circuit_breaker_threshold`.
    fn backoff_for(failure_count: u32) -> Duration {
        let secs: u64 = match failure_count {
            0 | 1 => 30,
            2 => 60,
            n => {
                let shift = n.saturating_sub(2).min(63);
                (60u64.saturating_mul(1u64 << shift)).min(900)
            }
        };
        Duration::from_secs(secs)
    }

    fn record_auth_failure(&self, key: &CompositeKey) {
        let mut state = self.state.lock().unwrap();
        let entry = state.entry(key.as_string()).or_default();
        entry.failure_count += 1;
        entry.backoff_until = Some(Instant::now() + Self::backoff_for(entry.failure_count));
        if entry.failure_count >= self.circuit_breaker_threshold {
            entry.circuit_open = true;
        }
    }

    fn record_auth_success(&self, key: &CompositeKey) {
        self.state.lock().unwrap().remove(&key.as_string());
    }

    /// Manual reset: clears backoff/circuit state and the cached auth format.
    pub fn reset_circuit_breaker(&self, key: &CompositeKey) {
        self.state.lock().unwrap().remove(&key.as_string());
        self.format_cache.lock().unwrap().remove(&key.as_string());
    }

    pub fn get_backoff_status(&self, key: &CompositeKey) -> BackoffStatus {
        let state = self.state.lock().unwrap();
        match state.get(&key.as_string()) {
            Some(s) => BackoffStatus {
                failure_count: s.failure_count,
                circuit_open: s.circuit_open,
                backed_off: s.backoff_until.is_some_and(|u| Instant::now() < u),
            },
            None => BackoffStatus {
                failure_count: 0,
                circuit_open: false,
                backed_off: false,
            },
        }
    }

    /// Probes `ServicePrefixed` then `Raw`, caching whichever succeeds first.
    /// Honors backoff/circuit-breaker state before attempting.
    pub async fn detect_auth_format(
        &self,
        key: &CompositeKey,
        token: &str,
        probe: &dyn AuthProbe,
    ) -> Result<AuthFormat, AuthError> {
        self.should_skip_auth_attempt(key)?;
        for format in [AuthFormat::ServicePrefixed, AuthFormat::Raw] {
            match probe.probe(key, token, format).await {
                Ok(true) => {
                    self.format_cache.lock().unwrap().insert(key.as_string(), format);
                    self.record_auth_success(key);
                    return Ok(format);
                }
                Ok(false) => continue,
                Err(e) => {
                    self.record_auth_failure(key);
                    return Err(e);
                }
            }
        }
        self.record_auth_failure(key);
        Err(AuthError::Probe(format!(
            "no accepted auth format for agent `{}`",
            key.as_string()
        )))
    }
}
