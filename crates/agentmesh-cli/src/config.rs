//! `agentmesh.toml` loading.
//!
//! Every section is optional; missing values fall back to the defaults
//! below. The token secret may come from `AGENTMESH_TOKEN_SECRET` instead of
//! the file, and the environment wins when both are set.

use agentmesh_core::subject;
use agentmesh_gateway::GatewayConfig;
use agentmesh_protocol::ProtocolConfig;
use agentmesh_security::{
    InMemoryKeyDirectory, KeyRecord, KeyStatus, SignatureVerifier, SubjectAuthorizer,
    TenantPermissions,
};
use anyhow::Context;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

pub const TOKEN_SECRET_ENV: &str = "AGENTMESH_TOKEN_SECRET";

#[derive(Debug, Default, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthSection,
    #[serde(default)]
    pub gateway: GatewaySection,
    #[serde(default)]
    pub authorization: AuthorizationSection,
    #[serde(default)]
    pub protocol: ProtocolSection,
    #[serde(default)]
    pub keys: Vec<KeyEntry>,
}

#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthSection {
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl_secs: u64,
    #[serde(default)]
    pub token_secret: Option<String>,
    #[serde(default = "default_token_ttl")]
    pub token_ttl_secs: u64,
    #[serde(default = "default_rps")]
    pub max_requests_per_second: f64,
    #[serde(default = "default_burst")]
    pub max_burst: f64,
}

impl Default for AuthSection {
    fn default() -> Self {
        Self {
            challenge_ttl_secs: default_challenge_ttl(),
            token_secret: None,
            token_ttl_secs: default_token_ttl(),
            max_requests_per_second: default_rps(),
            max_burst: default_burst(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct GatewaySection {
    #[serde(default = "default_subject_root")]
    pub subject_root: String,
    #[serde(default = "default_global_prefixes")]
    pub global_prefixes: Vec<String>,
    #[serde(default = "default_channel_segments")]
    pub channel_segments: Vec<String>,
    #[serde(default = "default_presence_timeout")]
    pub presence_timeout_secs: u64,
    #[serde(default = "default_presence_sweep")]
    pub presence_sweep_secs: u64,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            subject_root: default_subject_root(),
            global_prefixes: default_global_prefixes(),
            channel_segments: default_channel_segments(),
            presence_timeout_secs: default_presence_timeout(),
            presence_sweep_secs: default_presence_sweep(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct AuthorizationSection {
    #[serde(default = "default_roots")]
    pub default_roots: Vec<String>,
    #[serde(default)]
    pub tenants: Vec<TenantPermissions>,
}

impl Default for AuthorizationSection {
    fn default() -> Self {
        Self {
            default_roots: default_roots(),
            tenants: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ProtocolSection {
    #[serde(default = "default_discovery_timeout")]
    pub discovery_timeout_ms: u64,
    #[serde(default = "default_max_results")]
    pub max_discovery_results: usize,
}

impl Default for ProtocolSection {
    fn default() -> Self {
        Self {
            discovery_timeout_ms: default_discovery_timeout(),
            max_discovery_results: default_max_results(),
        }
    }
}

/// One `[[keys]]` entry seeding the key directory.
#[derive(Debug, Deserialize)]
pub struct KeyEntry {
    pub tenant_id: String,
    pub key_id: String,
    /// PEM file, relative to the config file's directory.
    #[serde(default)]
    pub public_key_path: Option<PathBuf>,
    /// Inline PEM.
    #[serde(default)]
    pub public_key: Option<String>,
    #[serde(default)]
    pub owner_agent_id: Option<String>,
    #[serde(default = "default_true")]
    pub active: bool,
    #[serde(default)]
    pub revoked: bool,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}
fn default_port() -> u16 {
    8080
}
fn default_challenge_ttl() -> u64 {
    300
}
fn default_token_ttl() -> u64 {
    3600
}
fn default_rps() -> f64 {
    10.0
}
fn default_burst() -> f64 {
    50.0
}
fn default_subject_root() -> String {
    "tenant".to_string()
}
fn default_global_prefixes() -> Vec<String> {
    vec!["presence.".to_string()]
}
fn default_channel_segments() -> Vec<String> {
    vec!["channels".to_string(), "broadcast".to_string()]
}
fn default_presence_timeout() -> u64 {
    90
}
fn default_presence_sweep() -> u64 {
    15
}
fn default_roots() -> Vec<String> {
    vec!["tenant".to_string(), "agents".to_string()]
}
fn default_discovery_timeout() -> u64 {
    2000
}
fn default_max_results() -> usize {
    256
}
fn default_true() -> bool {
    true
}

impl MeshConfig {
    /// Read and parse `path`. A missing file yields the defaults.
    pub async fn load(path: &Path) -> anyhow::Result<Self> {
        match tokio::fs::read_to_string(path).await {
            Ok(raw) => Self::parse(&raw)
                .with_context(|| format!("Failed to parse config file '{}'", path.display())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "Config file not found, using defaults");
                Ok(Self::default())
            }
            Err(e) => Err(anyhow::anyhow!(
                "Failed to read config file '{}': {e}",
                path.display()
            )),
        }
    }

    pub fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    /// `AGENTMESH_TOKEN_SECRET` if set, else `[auth].token_secret`.
    pub fn token_secret(&self) -> Option<String> {
        std::env::var(TOKEN_SECRET_ENV)
            .ok()
            .filter(|s| !s.is_empty())
            .or_else(|| self.auth.token_secret.clone())
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            subject_root: self.gateway.subject_root.clone(),
            global_prefixes: self.gateway.global_prefixes.clone(),
            channel_segments: self.gateway.channel_segments.clone(),
            presence_timeout: Duration::from_secs(self.gateway.presence_timeout_secs),
            presence_sweep: Duration::from_secs(self.gateway.presence_sweep_secs.max(1)),
            max_burst: self.auth.max_burst,
            max_requests_per_second: self.auth.max_requests_per_second,
            ..GatewayConfig::default()
        }
    }

    pub fn protocol_config(&self) -> ProtocolConfig {
        ProtocolConfig {
            discovery_timeout: Duration::from_millis(self.protocol.discovery_timeout_ms),
            max_discovery_results: self.protocol.max_discovery_results,
        }
    }

    /// Authorizer with the configured default roots and explicit tenants.
    pub fn build_authorizer(&self) -> anyhow::Result<SubjectAuthorizer> {
        let authorizer =
            SubjectAuthorizer::with_default_roots(self.authorization.default_roots.clone());
        for tenant in &self.authorization.tenants {
            authorizer
                .register(tenant.clone())
                .context("Invalid [[authorization.tenants]] entry")?;
        }
        Ok(authorizer)
    }

    /// Load every `[[keys]]` entry into `directory`. Relative key paths are
    /// resolved against `base_dir`.
    pub async fn seed_keys(
        &self,
        directory: &InMemoryKeyDirectory,
        base_dir: &Path,
    ) -> anyhow::Result<usize> {
        for entry in &self.keys {
            subject::validate_identifier("tenant_id", &entry.tenant_id)
                .with_context(|| format!("Invalid [[keys]] entry '{}'", entry.key_id))?;
            if let Some(owner) = &entry.owner_agent_id {
                subject::validate_identifier("owner_agent_id", owner)
                    .with_context(|| format!("Invalid [[keys]] entry '{}'", entry.key_id))?;
            }
            let pem = match (&entry.public_key, &entry.public_key_path) {
                (Some(inline), _) => inline.clone(),
                (None, Some(path)) => {
                    let path = base_dir.join(path);
                    tokio::fs::read_to_string(&path).await.with_context(|| {
                        format!("Failed to read public key '{}'", path.display())
                    })?
                }
                (None, None) => anyhow::bail!(
                    "Key '{}' for tenant '{}' has neither public_key nor public_key_path",
                    entry.key_id,
                    entry.tenant_id
                ),
            };
            SignatureVerifier::parse_public_key(&pem).with_context(|| {
                format!(
                    "Key '{}' for tenant '{}' is not a valid RSA public key",
                    entry.key_id, entry.tenant_id
                )
            })?;

            let mut record = KeyRecord::new(&entry.tenant_id, &entry.key_id, pem);
            if let Some(owner) = &entry.owner_agent_id {
                record = record.owned_by(owner);
            }
            record.status = if entry.active {
                KeyStatus::Active
            } else {
                KeyStatus::Inactive
            };
            record.revoked = entry.revoked;
            directory.register(record).await;
        }
        info!(count = self.keys.len(), "Keys loaded");
        Ok(self.keys.len())
    }
}
