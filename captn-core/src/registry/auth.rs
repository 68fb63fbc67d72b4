//! Registry credentials and token acquisition.
//!
//! Credentials resolve repository-specific first, then registry-wide, then
//! anonymous. Bearer challenges from generic v2 registries are answered
//! transparently.

use std::collections::BTreeMap;
use std::path::Path;

use base64::Engine;
use serde::Deserialize;
use tracing::debug;

use crate::config::RegistryAuthConfig;
use crate::errors::{ConfigError, RegistryError};

/// One credential entry: either username/password or a pre-issued token.
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Credentials {
    pub username: Option<String>,
    pub password: Option<String>,
    pub token: Option<String>,
}

impl Credentials {
    /// `Basic` header value, when username and password (or token in the
    /// password slot) are present.
    pub fn basic_header(&self) -> Option<String> {
        let username = self.username.as_deref()?;
        let secret = self.password.as_deref().or(self.token.as_deref())?;
        let encoded =
            base64::engine::general_purpose::STANDARD.encode(format!("{username}:{secret}"));
        Some(format!("Basic {encoded}"))
    }

    /// `Bearer` header value from a pre-issued token.
    pub fn bearer_header(&self) -> Option<String> {
        self.token.as_ref().map(|t| format!("Bearer {t}"))
    }
}

#[derive(Debug, Deserialize, Default)]
struct CredentialsFile {
    #[serde(default)]
    registries: BTreeMap<String, Credentials>,
    #[serde(default)]
    repositories: BTreeMap<String, Credentials>,
}

/// Credential store loaded from the configured JSON file.
#[derive(Debug, Default)]
pub struct CredentialStore {
    registries: BTreeMap<String, Credentials>,
    repositories: BTreeMap<String, Credentials>,
}

impl CredentialStore {
    /// Load the store; disabled auth yields an empty (anonymous) store.
    pub fn load(cfg: &RegistryAuthConfig) -> Result<CredentialStore, ConfigError> {
        if !cfg.enabled {
            return Ok(CredentialStore::default());
        }
        if !cfg.credentials_file.exists() {
            debug!(path = %cfg.credentials_file.display(), "credentials file not found, using anonymous access");
            return Ok(CredentialStore::default());
        }
        Self::load_file(&cfg.credentials_file)
    }

    fn load_file(path: &Path) -> Result<CredentialStore, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|e| ConfigError::CredentialsInvalid {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let parsed: CredentialsFile =
            serde_json::from_str(&text).map_err(|e| ConfigError::CredentialsInvalid {
                path: path.display().to_string(),
                reason: e.to_string(),
            })?;
        Ok(CredentialStore {
            registries: parsed.registries,
            repositories: parsed.repositories,
        })
    }

    /// Resolve credentials: repository-specific, then registry-wide (exact
    /// host, then domain-suffix match), then anonymous.
    pub fn lookup(&self, registry: &str, repository: &str) -> Option<&Credentials> {
        if let Some(creds) = self.repositories.get(repository) {
            return Some(creds);
        }

        let wanted = host_of(registry);
        for (key, creds) in &self.registries {
            let key_host = host_of(key);
            if key_host == wanted || domains_match(&key_host, &wanted) {
                return Some(creds);
            }
        }
        None
    }
}

/// Reduce a registry URL or bare host to its host part.
fn host_of(registry: &str) -> String {
    let stripped = registry
        .strip_prefix("https://")
        .or_else(|| registry.strip_prefix("http://"))
        .unwrap_or(registry);
    stripped
        .split('/')
        .next()
        .unwrap_or(stripped)
        .to_string()
}

/// Whether one host is a domain suffix of the other.
fn domains_match(a: &str, b: &str) -> bool {
    let a_parts: Vec<&str> = a.split('.').collect();
    let b_parts: Vec<&str> = b.split('.').collect();
    let n = a_parts.len().min(b_parts.len());
    n > 0 && a_parts[a_parts.len() - n..] == b_parts[b_parts.len() - n..]
}

/// A parsed `WWW-Authenticate: Bearer ...` challenge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerChallenge {
    pub realm: String,
    pub service: Option<String>,
    pub scope: Option<String>,
}

/// Parse a bearer challenge header value.
pub fn parse_bearer_challenge(header: &str) -> Option<BearerChallenge> {
    let rest = header.trim().strip_prefix("Bearer ")?;
    let mut realm = None;
    let mut service = None;
    let mut scope = None;
    for part in rest.split(',') {
        let (key, value) = part.trim().split_once('=')?;
        let value = value.trim_matches('"').to_string();
        match key.trim() {
            "realm" => realm = Some(value),
            "service" => service = Some(value),
            "scope" => scope = Some(value),
            _ => {}
        }
    }
    Some(BearerChallenge {
        realm: realm?,
        service,
        scope,
    })
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Option<String>,
    access_token: Option<String>,
}

/// Exchange a bearer challenge for a token, using basic credentials when
/// available.
pub(crate) async fn token_for_challenge(
    http: &reqwest::Client,
    challenge: &BearerChallenge,
    fallback_scope: &str,
    creds: Option<&Credentials>,
) -> Result<String, RegistryError> {
    let mut request = http.get(&challenge.realm);
    if let Some(service) = &challenge.service {
        request = request.query(&[("service", service.as_str())]);
    }
    let scope = challenge.scope.as_deref().unwrap_or(fallback_scope);
    request = request.query(&[("scope", scope)]);
    if let Some(basic) = creds.and_then(Credentials::basic_header) {
        request = request.header(reqwest::header::AUTHORIZATION, basic);
    }

    let response = request
        .send()
        .await
        .map_err(|e| RegistryError::Unreachable(e.to_string()))?;
    if response.status() == reqwest::StatusCode::UNAUTHORIZED
        || response.status() == reqwest::StatusCode::FORBIDDEN
    {
        return Err(RegistryError::AuthFailed(format!(
            "token endpoint rejected the request ({})",
            response.status()
        )));
    }
    let parsed: TokenResponse = response
        .json()
        .await
        .map_err(|e| RegistryError::Protocol(e.to_string()))?;
    parsed
        .token
        .or(parsed.access_token)
        .ok_or_else(|| RegistryError::AuthFailed("no token in response".to_string()))
}
