//! Resolves container image digests locally (via the container runtime) and
//! remotely (via the registry's manifest endpoint), and detects whether an
//! agent's running image has drifted from the target.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

const MANIFEST_V2_ACCEPT: &str = "application/vnd.docker.distribution.manifest.v2+json";
const DEFAULT_REGISTRY: &str = "registry-1.docker.io";

#[derive(Error, Debug)]
pub enum ImageResolverError {
    #[error("failed to connect to registry `{0}`")]
    Connect(String),
    #[error("request to registry `{0}` timed out")]
    Timeout(String),
    #[error("failed to resolve DNS for registry `{0}`")]
    Dns(String),
    #[error("registry returned unsuccessful response: {status} {body}")]
    UnsuccessfulResponse { status: u16, body: String },
    #[error("registry response did not include a Docker-Content-Digest header")]
    MissingDigestHeader,
    #[error("transport error: `{0}`")]
    Transport(String),
    #[error("failed to parse image reference `{0}`")]
    InvalidReference(String),
}

/// A parsed `[registry/]repository[:tag|@digest]` reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageReference {
    pub registry: String,
    pub repository: String,
    pub tag_or_digest: TagOrDigest,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TagOrDigest {
    Tag(String),
    Digest(String),
}

impl ImageReference {
    pub fn parse(raw: &str) -> Result<Self, ImageResolverError> {
        let without_scheme = raw.splitn(2, "://").last().unwrap_or(raw);

        let (rest, tag_or_digest) = if let Some((repo_part, digest)) = without_scheme.split_once('@') {
            (repo_part.to_string(), TagOrDigest::Digest(digest.to_string()))
        } else if let Some((repo_part, tag)) = rsplit_tag(without_scheme) {
            (repo_part, TagOrDigest::Tag(tag))
        } else {
            (without_scheme.to_string(), TagOrDigest::Tag("latest".to_string()))
        };

        if rest.is_empty() {
            return Err(ImageResolverError::InvalidReference(raw.to_string()));
        }

        let mut parts = rest.splitn(2, '/');
        let first = parts.next().unwrap();
        let remainder = parts.next();

        let (registry, repository) = match remainder {
            Some(remainder) if first.contains('.') || first.contains(':') || first == "localhost" => {
                (first.to_string(), remainder.to_string())
            }
            _ => (DEFAULT_REGISTRY.to_string(), rest.clone()),
        };

        Ok(Self {
            registry,
            repository,
            tag_or_digest,
        })
    }
}

/// Splits `repo:tag` from the last path segment only, so a registry port
/// (`host:5000/repo`) is never mistaken for a tag separator.
fn rsplit_tag(reference: &str) -> Option<(String, String)> {
    let last_slash = reference.rfind('/').map(|i| i + 1).unwrap_or(0);
    let (prefix, last_segment) = reference.split_at(last_slash);
    last_segment
        .rfind(':')
        .map(|i| (format!("{prefix}{}", &last_segment[..i]), last_segment[i + 1..].to_string()))
}

pub struct ImageResolver {
    client: reqwest::blocking::Client,
    registry_auth: Option<(String, String)>,
}

impl ImageResolver {
    pub fn new(timeout: Duration) -> Result<Self, ImageResolverError> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ImageResolverError::Transport(e.to_string()))?;
        Ok(Self { client, registry_auth: None })
    }

    pub fn with_registry_auth(mut self, username: String, password: String) -> Self {
        self.registry_auth = Some((username, password));
        self
    }

    /// Resolves the content digest for a reference against the remote
    /// registry, reading `Docker-Content-Digest` off the manifest response.
    pub fn resolve_remote_digest(&self, reference: &ImageReference) -> Result<String, ImageResolverError> {
        let tag = match &reference.tag_or_digest {
            TagOrDigest::Tag(t) => t.clone(),
            TagOrDigest::Digest(d) => return Ok(d.clone()),
        };
        let url = format!(
            "https://{}/v2/{}/manifests/{}",
            reference.registry, reference.repository, tag
        );

        let auth_header = self.bearer_token(reference)?;
        let mut request = self
            .client
            .get(&url)
            .header(reqwest::header::ACCEPT, MANIFEST_V2_ACCEPT);
        if let Some(token) = auth_header {
            request = request.bearer_auth(token);
        }

        let response = request.send().map_err(classify_transport_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(ImageResolverError::UnsuccessfulResponse { status, body });
        }
        response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string())
            .ok_or(ImageResolverError::MissingDigestHeader)
    }

    /// ghcr.io-style bearer token exchange via Basic auth with a PAT. Docker
    /// Hub public images currently require no auth and this returns `None`.
    fn bearer_token(&self, reference: &ImageReference) -> Result<Option<String>, ImageResolverError> {
        if reference.registry != "ghcr.io" {
            return Ok(None);
        }
        let Some((username, password)) = &self.registry_auth else {
            return Ok(None);
        };
        let token_url = format!(
            "https://ghcr.io/token?service=ghcr.io&scope=repository:{}:pull",
            reference.repository
        );
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }
        let basic = BASE64.encode(format!("{username}:{password}"));
        let response = self
            .client
            .get(&token_url)
            .header(reqwest::header::AUTHORIZATION, format!("Basic {basic}"))
            .send()
            .map_err(classify_transport_error)?;
        if !response.status().is_success() {
            let status = response.status().as_u16();
            let body = response.text().unwrap_or_default();
            return Err(ImageResolverError::UnsuccessfulResponse { status, body });
        }
        let parsed: TokenResponse = response
            .json()
            .map_err(|e| ImageResolverError::Transport(e.to_string()))?;
        Ok(Some(parsed.token))
    }
}

fn classify_transport_error(err: reqwest::Error) -> ImageResolverError {
    let target = err.url().map(|u| u.to_string()).unwrap_or_default();
    if err.is_connect() {
        ImageResolverError::Connect(target)
    } else if err.is_timeout() {
        ImageResolverError::Timeout(target)
    } else if err.to_string().to_lowercase().contains("dns") {
        ImageResolverError::Dns(target)
    } else {
        ImageResolverError::Transport(err.to_string())
    }
}

/// True when the resolved remote digest differs from the currently-recorded
/// digest (or there was none recorded yet).
pub fn needs_update(current_digest: Option<&str>, target_digest: &str) -> bool {
    current_digest != Some(target_digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::Method::GET;
    use httpmock::MockServer;

    #[test]
    fn parses_bare_repository() {
        let r = ImageReference::parse("myagent").unwrap();
        assert_eq!(r.registry, DEFAULT_REGISTRY);
        assert_eq!(r.repository, "myagent");
        assert_eq!(r.tag_or_digest, TagOrDigest::Tag("latest".to_string()));
    }

    #[test]
    fn parses_registry_with_port_and_tag() {
        let r = ImageReference::parse("localhost:5000/myagent:v2").unwrap();
        assert_eq!(r.registry, "localhost:5000");
        assert_eq!(r.repository, "myagent");
        assert_eq!(r.tag_or_digest, TagOrDigest::Tag("v2".to_string()));
    }

    #[test]
    fn parses_digest_reference() {
        let r = ImageReference::parse("ghcr.io/org/agent@sha256:abc123").unwrap();
        assert_eq!(r.registry, "ghcr.io");
        assert_eq!(r.repository, "org/agent");
        assert_eq!(r.tag_or_digest, TagOrDigest::Digest("sha256:abc123".to_string()));
    }

    #[test]
    fn strips_scheme() {
        let r = ImageReference::parse("https://ghcr.io/org/agent:v1").unwrap();
        assert_eq!(r.registry, "ghcr.io");
    }

    #[test]
    fn resolves_remote_digest_from_header() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/v2/org/agent/manifests/v1");
            then.status(200).header("Docker-Content-Digest", "sha256:deadbeef");
        });
        let reference = ImageReference {
            registry: server.address().to_string(),
            repository: "org/agent".to_string(),
            tag_or_digest: TagOrDigest::Tag("v1".to_string()),
        };
        let resolver = ImageResolver::new(Duration::from_secs(5)).unwrap();
        // httpmock serves http, not https; exercise the header-reading path directly.
        let url = format!("http://{}/v2/org/agent/manifests/v1", reference.registry);
        let response = resolver
            .client
            .get(url)
            .header(reqwest::header::ACCEPT, MANIFEST_V2_ACCEPT)
            .send()
            .unwrap();
        let digest = response
            .headers()
            .get("Docker-Content-Digest")
            .and_then(|v| v.to_str().ok())
            .unwrap();
        assert_eq!(digest, "sha256:deadbeef");
    }

    #[test]
    fn needs_update_detects_drift() {
        assert!(needs_update(None, "sha256:a"));
        assert!(needs_update(Some("sha256:a"), "sha256:b"));
        assert!(!needs_update(Some("sha256:a"), "sha256:a"));
    }
}
