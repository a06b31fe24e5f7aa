use crate::server::AppState;
use agentmesh_core::MeshError;
use agentmesh_security::{ChallengeDescriptor, TokenClaims};
use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Extension, Json,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, info};

/// Body of both challenge endpoints.
#[derive(Debug, Default, Deserialize)]
pub struct ChallengeRequest {
    #[serde(default)]
    pub agent_id: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ChallengeResponse {
    pub challenge: String,
    pub expires_at: DateTime<Utc>,
    pub tenant_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyRequest {
    pub tenant_id: String,
    pub key_id: String,
    pub challenge: String,
    /// Base64 signature over the challenge.
    pub response: String,
    #[serde(default)]
    pub agent_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
}

/// A [`MeshError`] rendered as an HTTP response.
pub struct ApiError(pub MeshError);

impl From<MeshError> for ApiError {
    fn from(e: MeshError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match &self.0 {
            MeshError::AuthenticationFailed(_) | MeshError::Token(_) => {
                (StatusCode::UNAUTHORIZED, self.0.to_string())
            }
            MeshError::AuthorizationDenied { .. } => (StatusCode::FORBIDDEN, self.0.to_string()),
            MeshError::MessageDecode(_) | MeshError::InvalidIdentifier(_) => {
                (StatusCode::BAD_REQUEST, self.0.to_string())
            }
            other => {
                error!(error = %other, "Auth endpoint failed");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal error".to_string())
            }
        };
        (status, Json(serde_json::json!({ "error": message }))).into_response()
    }
}

fn challenge_response(
    descriptor: ChallengeDescriptor,
    tenant_id: String,
    agent_id: Option<String>,
) -> Json<ChallengeResponse> {
    Json(ChallengeResponse {
        challenge: descriptor.challenge,
        expires_at: descriptor.expires_at,
        tenant_id,
        agent_id,
    })
}

/// `POST /auth/challenge` for callers holding a bearer token. The tenant
/// defaults to the token's and may not differ from it.
pub async fn issue_challenge(
    State(state): State<Arc<AppState>>,
    Extension(claims): Extension<TokenClaims>,
    Json(body): Json<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let tenant_id = body.tenant_id.unwrap_or_else(|| claims.tenant_id.clone());
    if tenant_id != claims.tenant_id {
        return Err(MeshError::AuthenticationFailed(
            "Token does not belong to the requested tenant".into(),
        )
        .into());
    }
    let agent_id = body.agent_id.or(claims.agent_id);
    let descriptor = state
        .authenticator
        .issue_challenge(&tenant_id, agent_id.as_deref())
        .await?;
    Ok(challenge_response(descriptor, tenant_id, agent_id))
}

/// `POST /auth/agent/challenge`, unauthenticated; the tenant comes from the
/// body.
pub async fn issue_agent_challenge(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ChallengeRequest>,
) -> Result<Json<ChallengeResponse>, ApiError> {
    let tenant_id = body
        .tenant_id
        .filter(|t| !t.trim().is_empty())
        .ok_or_else(|| MeshError::MessageDecode("tenant_id is required".into()))?;
    let descriptor = state
        .authenticator
        .issue_challenge(&tenant_id, body.agent_id.as_deref())
        .await?;
    Ok(challenge_response(descriptor, tenant_id, body.agent_id))
}

/// `POST /auth/verify`: check a signed challenge and mint a bearer token
/// for `sub = key_id`.
pub async fn verify(
    State(state): State<Arc<AppState>>,
    Json(body): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, ApiError> {
    let valid = state
        .authenticator
        .verify(
            &body.tenant_id,
            &body.key_id,
            &body.challenge,
            &body.response,
            body.agent_id.as_deref(),
        )
        .await;

    if !valid {
        return Ok(Json(VerifyResponse {
            valid: false,
            message: "Invalid or expired challenge".into(),
            token: None,
        }));
    }

    let token = state
        .tokens
        .issue_agent(&body.key_id, &body.tenant_id, body.agent_id.as_deref())?;
    info!(tenant_id = %body.tenant_id, key_id = %body.key_id, "Bearer token issued");
    Ok(Json(VerifyResponse {
        valid: true,
        message: "Challenge verified".into(),
        token: Some(token),
    }))
}
