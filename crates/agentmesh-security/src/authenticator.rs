use crate::challenge::{Challenge, ChallengeDescriptor, ChallengeStore};
use crate::keys::KeyDirectory;
use crate::signature::SignatureVerifier;
use agentmesh_core::{subject, MeshError, MeshResult};
use chrono::{Duration, Utc};
use std::sync::Arc;
use tracing::{info, warn};

/// Default lifetime of an issued challenge.
pub const DEFAULT_CHALLENGE_TTL_SECS: i64 = 300;

/// Issues one-time challenges and verifies signed responses against the key
/// directory.
///
/// Verification never surfaces an error: every failure (unknown or expired
/// challenge, tenant or agent mismatch, unusable key, bad signature, store
/// failure) is logged and reported as `false`.
pub struct ChallengeAuthenticator {
    challenges: Arc<dyn ChallengeStore>,
    keys: Arc<dyn KeyDirectory>,
    ttl: Duration,
}

impl ChallengeAuthenticator {
    pub fn new(challenges: Arc<dyn ChallengeStore>, keys: Arc<dyn KeyDirectory>) -> Self {
        Self {
            challenges,
            keys,
            ttl: Duration::seconds(DEFAULT_CHALLENGE_TTL_SECS),
        }
    }

    /// Override the challenge lifetime.
    pub fn with_ttl(mut self, ttl: std::time::Duration) -> Self {
        self.ttl = Duration::from_std(ttl).unwrap_or(self.ttl);
        self
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Generate and persist a fresh challenge for `tenant_id`, optionally bound
    /// to `agent_id`.
    pub async fn issue_challenge(
        &self,
        tenant_id: &str,
        agent_id: Option<&str>,
    ) -> MeshResult<ChallengeDescriptor> {
        subject::validate_identifier("tenant_id", tenant_id)?;
        if let Some(agent_id) = agent_id {
            subject::validate_identifier("agent_id", agent_id)?;
        }
        let challenge = Challenge::generate(tenant_id, agent_id, self.ttl)?;
        self.challenges.put(&challenge).await?;
        info!(
            tenant_id = %tenant_id,
            agent_id = agent_id.unwrap_or("-"),
            expires_at = %challenge.expires_at,
            "Challenge issued"
        );
        Ok(challenge.descriptor())
    }

    /// Check a signed challenge. On success the challenge is consumed and the
    /// key's last-used time is stamped.
    pub async fn verify(
        &self,
        tenant_id: &str,
        key_id: &str,
        challenge: &str,
        signature_b64: &str,
        agent_id: Option<&str>,
    ) -> bool {
        match self
            .try_verify(tenant_id, key_id, challenge, signature_b64, agent_id)
            .await
        {
            Ok(()) => {
                info!(tenant_id = %tenant_id, key_id = %key_id, "Challenge verified");
                true
            }
            Err(e) => {
                warn!(
                    tenant_id = %tenant_id,
                    key_id = %key_id,
                    agent_id = agent_id.unwrap_or("-"),
                    error = %e,
                    "Challenge verification failed"
                );
                false
            }
        }
    }

    async fn try_verify(
        &self,
        tenant_id: &str,
        key_id: &str,
        challenge: &str,
        signature_b64: &str,
        agent_id: Option<&str>,
    ) -> MeshResult<()> {
        subject::validate_identifier("tenant_id", tenant_id)?;
        if let Some(agent_id) = agent_id {
            subject::validate_identifier("agent_id", agent_id)?;
        }
        let record = self
            .challenges
            .get(tenant_id, challenge)
            .await?
            .ok_or_else(|| fail("unknown or expired challenge"))?;

        if record.is_expired_at(Utc::now()) {
            return Err(fail("challenge expired"));
        }
        if record.tenant_id != tenant_id {
            return Err(fail("challenge tenant mismatch"));
        }
        if let Some(bound) = record.agent_id.as_deref() {
            if agent_id != Some(bound) {
                return Err(fail("challenge issued for a different agent"));
            }
        }

        let key = self
            .keys
            .get(tenant_id, key_id)
            .await?
            .ok_or_else(|| fail("unknown key"))?;
        if key.tenant_id != tenant_id {
            return Err(fail("key tenant mismatch"));
        }
        if !key.is_usable() {
            return Err(fail("key revoked or inactive"));
        }
        if let Some(agent) = agent_id {
            if !key.permits_agent(agent) {
                return Err(fail("key bound to a different agent"));
            }
        }

        SignatureVerifier::verify(&key.public_key, challenge, signature_b64)?;

        // Consumed only after the signature checks out, so a failed attempt
        // can be retried until expiry. Losing the delete race means another
        // caller already used this challenge.
        if !self.challenges.delete(tenant_id, challenge).await? {
            return Err(fail("challenge already used"));
        }

        if let Err(e) = self.keys.touch_last_used(tenant_id, key_id, Utc::now()).await {
            warn!(tenant_id = %tenant_id, key_id = %key_id, error = %e, "Failed to stamp key last-used");
        }
        Ok(())
    }
}

fn fail(reason: &str) -> MeshError {
    MeshError::AuthenticationFailed(reason.to_string())
}
