use agentmesh_core::{subject, MeshError, MeshResult};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Who a bearer token was minted for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    /// Minted by challenge verification; `sub` is the key id.
    Agent,
    /// A dashboard user; `sub` is the user id.
    User,
}

/// Claims carried by an agentmesh bearer token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenClaims {
    /// Subject: a key id for agents, a user id for dashboards.
    pub sub: String,
    pub kind: TokenKind,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub iat: i64,
    pub exp: i64,
}

/// Mints and validates short-lived HS256 bearer tokens.
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    ttl: Duration,
}

impl TokenIssuer {
    pub fn new(secret: &[u8], ttl: Duration) -> MeshResult<Self> {
        if secret.len() < 16 {
            return Err(MeshError::Config(
                "Token secret must be at least 16 bytes".into(),
            ));
        }
        Ok(Self {
            encoding: EncodingKey::from_secret(secret),
            decoding: DecodingKey::from_secret(secret),
            ttl,
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Token for a verified key, as returned by challenge verification.
    pub fn issue_agent(
        &self,
        key_id: &str,
        tenant_id: &str,
        agent_id: Option<&str>,
    ) -> MeshResult<String> {
        self.issue(TokenKind::Agent, key_id, tenant_id, agent_id)
    }

    /// Token for a dashboard user.
    pub fn issue_user(&self, user_id: &str, tenant_id: &str) -> MeshResult<String> {
        self.issue(TokenKind::User, user_id, tenant_id, None)
    }

    fn issue(
        &self,
        kind: TokenKind,
        sub: &str,
        tenant_id: &str,
        agent_id: Option<&str>,
    ) -> MeshResult<String> {
        subject::validate_identifier("tenant_id", tenant_id)?;
        let now = Utc::now().timestamp();
        let claims = TokenClaims {
            sub: sub.to_string(),
            kind,
            tenant_id: tenant_id.to_string(),
            agent_id: agent_id.map(str::to_string),
            iat: now,
            exp: now + self.ttl.as_secs() as i64,
        };
        encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
            .map_err(|e| MeshError::Token(format!("Failed to sign token: {e}")))
    }

    pub fn validate(&self, token: &str) -> MeshResult<TokenClaims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;
        decode::<TokenClaims>(token, &self.decoding, &validation)
            .map(|data| data.claims)
            .map_err(|e| MeshError::Token(e.to_string()))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SECRET: &[u8] = b"test-secret-0123456789abcdef";

    #[test]
    fn test_issue_and_validate() {
        let issuer = TokenIssuer::new(SECRET, Duration::from_secs(60)).unwrap();
        let token = issuer.issue_agent("key-1", "T1", Some("A1")).unwrap();
        let claims = issuer.validate(&token).unwrap();
        assert_eq!(claims.sub, "key-1");
        assert_eq!(claims.kind, TokenKind::Agent);
        assert_eq!(claims.tenant_id, "T1");
        assert_eq!(claims.agent_id.as_deref(), Some("A1"));
        assert_eq!(claims.exp - claims.iat, 60);
    }

    #[test]
    fn test_wrong_secret_rejected() {
        let issuer = TokenIssuer::new(SECRET, Duration::from_secs(60)).unwrap();
        let other = TokenIssuer::new(b"another-secret-0123456789", Duration::from_secs(60)).unwrap();
        let token = issuer.issue_user("u1", "T1").unwrap();
        assert!(other.validate(&token).is_err());
    }

    #[test]
    fn test_expired_rejected() {
        let issuer = TokenIssuer::new(SECRET, Duration::from_secs(0)).unwrap();
        let token = issuer.issue_user("u1", "T1").unwrap();
        std::thread::sleep(Duration::from_millis(1100));
        assert!(matches!(issuer.validate(&token), Err(MeshError::Token(_))));
    }

    #[test]
    fn test_user_token_kind() {
        let issuer = TokenIssuer::new(SECRET, Duration::from_secs(60)).unwrap();
        let claims = issuer.validate(&issuer.issue_user("u1", "T1").unwrap()).unwrap();
        assert_eq!(claims.kind, TokenKind::User);
        assert_eq!(claims.agent_id, None);
        assert!(matches!(
            issuer.issue_user("u1", "T1.x"),
            Err(MeshError::InvalidIdentifier(_))
        ));
    }

    #[test]
    fn test_short_secret_rejected() {
        assert!(TokenIssuer::new(b"short", Duration::from_secs(60)).is_err());
    }

    #[test]
    fn test_garbage_rejected() {
        let issuer = TokenIssuer::new(SECRET, Duration::from_secs(60)).unwrap();
        assert!(issuer.validate("not.a.token").is_err());
    }
}
