use agentmesh_core::{MeshError, MeshResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum KeyStatus {
    #[default]
    Active,
    Inactive,
}

/// A registered public key. Owned by the key directory; the authenticator
/// only reads it and stamps `last_used_at`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct KeyRecord {
    pub tenant_id: String,
    pub key_id: String,
    /// PEM-encoded RSA public key (SPKI or PKCS#1).
    pub public_key: String,
    #[serde(default)]
    pub owner_agent_id: Option<String>,
    #[serde(default)]
    pub status: KeyStatus,
    #[serde(default)]
    pub revoked: bool,
    #[serde(default)]
    pub last_used_at: Option<DateTime<Utc>>,
}

impl KeyRecord {
    pub fn new(
        tenant_id: impl Into<String>,
        key_id: impl Into<String>,
        public_key: impl Into<String>,
    ) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            key_id: key_id.into(),
            public_key: public_key.into(),
            owner_agent_id: None,
            status: KeyStatus::Active,
            revoked: false,
            last_used_at: None,
        }
    }

    /// Bind this key to a single agent.
    pub fn owned_by(mut self, agent_id: impl Into<String>) -> Self {
        self.owner_agent_id = Some(agent_id.into());
        self
    }

    /// Usable for authentication: active and not revoked.
    pub fn is_usable(&self) -> bool {
        self.status == KeyStatus::Active && !self.revoked
    }

    /// Whether `agent_id` may authenticate with this key.
    pub fn permits_agent(&self, agent_id: &str) -> bool {
        self.owner_agent_id
            .as_deref()
            .map_or(true, |owner| owner == agent_id)
    }
}

/// External directory of tenant public keys.
#[async_trait]
pub trait KeyDirectory: Send + Sync {
    async fn get(&self, tenant_id: &str, key_id: &str) -> MeshResult<Option<KeyRecord>>;
    async fn touch_last_used(&self, tenant_id: &str, key_id: &str, at: DateTime<Utc>)
        -> MeshResult<()>;
}

/// In-process key directory, seeded from configuration or tests.
#[derive(Default)]
pub struct InMemoryKeyDirectory {
    keys: RwLock<HashMap<(String, String), KeyRecord>>,
}

impl InMemoryKeyDirectory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn register(&self, record: KeyRecord) {
        info!(tenant_id = %record.tenant_id, key_id = %record.key_id, "Key registered");
        let key = (record.tenant_id.clone(), record.key_id.clone());
        self.keys.write().await.insert(key, record);
    }

    pub async fn revoke(&self, tenant_id: &str, key_id: &str) -> MeshResult<()> {
        self.update(tenant_id, key_id, |r| r.revoked = true).await
    }

    pub async fn set_status(&self, tenant_id: &str, key_id: &str, status: KeyStatus) -> MeshResult<()> {
        self.update(tenant_id, key_id, |r| r.status = status).await
    }

    pub async fn count(&self) -> usize {
        self.keys.read().await.len()
    }

    async fn update<F>(&self, tenant_id: &str, key_id: &str, f: F) -> MeshResult<()>
    where
        F: FnOnce(&mut KeyRecord),
    {
        let mut keys = self.keys.write().await;
        let record = keys
            .get_mut(&(tenant_id.to_string(), key_id.to_string()))
            .ok_or_else(|| MeshError::Store(format!("Unknown key '{key_id}' for tenant '{tenant_id}'")))?;
        f(record);
        Ok(())
    }
}

#[async_trait]
impl KeyDirectory for InMemoryKeyDirectory {
    async fn get(&self, tenant_id: &str, key_id: &str) -> MeshResult<Option<KeyRecord>> {
        let keys = self.keys.read().await;
        Ok(keys.get(&(tenant_id.to_string(), key_id.to_string())).cloned())
    }

    async fn touch_last_used(
        &self,
        tenant_id: &str,
        key_id: &str,
        at: DateTime<Utc>,
    ) -> MeshResult<()> {
        self.update(tenant_id, key_id, |r| r.last_used_at = Some(at)).await
    }
}
