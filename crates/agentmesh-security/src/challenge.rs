use agentmesh_core::{MeshError, MeshResult};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::debug;

/// Number of random bytes in a challenge token (hex-encoded to twice as many chars).
pub const CHALLENGE_BYTES: usize = 32;

/// A short-lived challenge a client must sign to prove key possession.
///
/// Serializes to the persisted record layout: ISO-8601 timestamps plus an
/// integer `expires_at_epoch` that stores with native TTL support can use.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Challenge {
    pub tenant_id: String,
    pub challenge: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expires_at_epoch: i64,
}

impl Challenge {
    /// Create a fresh challenge with a random token, valid for `ttl`.
    pub fn generate(tenant_id: &str, agent_id: Option<&str>, ttl: Duration) -> MeshResult<Self> {
        let mut bytes = [0u8; CHALLENGE_BYTES];
        getrandom::getrandom(&mut bytes)
            .map_err(|e| MeshError::Store(format!("Failed to generate challenge: {e}")))?;

        let created_at = Utc::now();
        let expires_at = created_at + ttl;
        Ok(Self {
            tenant_id: tenant_id.to_string(),
            challenge: hex::encode(bytes),
            agent_id: agent_id.map(str::to_string),
            created_at,
            expires_at,
            expires_at_epoch: expires_at.timestamp(),
        })
    }

    /// A challenge is expired once `now` is strictly past `expires_at`.
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }

    /// The part of the record handed back to the caller.
    pub fn descriptor(&self) -> ChallengeDescriptor {
        ChallengeDescriptor {
            challenge: self.challenge.clone(),
            expires_at: self.expires_at,
        }
    }
}

/// What a caller receives when asking for a challenge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChallengeDescriptor {
    pub challenge: String,
    pub expires_at: DateTime<Utc>,
}

/// Key-value store for challenges, keyed by `(tenant_id, challenge)`.
///
/// Implementations must treat expired records as absent.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    async fn put(&self, challenge: &Challenge) -> MeshResult<()>;
    async fn get(&self, tenant_id: &str, challenge: &str) -> MeshResult<Option<Challenge>>;
    /// Remove a record. Returns `true` if this call removed it.
    async fn delete(&self, tenant_id: &str, challenge: &str) -> MeshResult<bool>;
    /// Drop every record expired at `now`. Returns how many were dropped.
    async fn purge_expired(&self, now: DateTime<Utc>) -> MeshResult<usize>;
}

/// In-process challenge store with expiry on read and a periodic sweep.
#[derive(Default)]
pub struct InMemoryChallengeStore {
    records: RwLock<HashMap<(String, String), Challenge>>,
}

impl InMemoryChallengeStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// Spawn a background task that purges expired challenges every `every`.
    pub fn spawn_sweeper(self: &Arc<Self>, every: std::time::Duration) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                if let Ok(purged) = store.purge_expired(Utc::now()).await {
                    if purged > 0 {
                        debug!(purged, "Expired challenges purged");
                    }
                }
            }
        })
    }
}

#[async_trait]
impl ChallengeStore for InMemoryChallengeStore {
    async fn put(&self, challenge: &Challenge) -> MeshResult<()> {
        let key = (challenge.tenant_id.clone(), challenge.challenge.clone());
        self.records.write().await.insert(key, challenge.clone());
        Ok(())
    }

    async fn get(&self, tenant_id: &str, challenge: &str) -> MeshResult<Option<Challenge>> {
        let records = self.records.read().await;
        let key = (tenant_id.to_string(), challenge.to_string());
        Ok(records
            .get(&key)
            .filter(|c| !c.is_expired_at(Utc::now()))
            .cloned())
    }

    async fn delete(&self, tenant_id: &str, challenge: &str) -> MeshResult<bool> {
        let key = (tenant_id.to_string(), challenge.to_string());
        Ok(self.records.write().await.remove(&key).is_some())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> MeshResult<usize> {
        let mut records = self.records.write().await;
        let before = records.len();
        records.retain(|_, c| !c.is_expired_at(now));
        Ok(before - records.len())
    }
}
