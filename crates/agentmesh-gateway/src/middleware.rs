use agentmesh_security::{RateLimiter, TokenIssuer};
use axum::{
    extract::{Request, State},
    http::{HeaderMap, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::sync::Arc;
use tracing::warn;

/// Shared middleware state.
#[derive(Clone)]
pub struct MiddlewareState {
    pub rate_limiter: Arc<RateLimiter>,
    pub tokens: Arc<TokenIssuer>,
}

/// Pull the token out of an `Authorization: Bearer <token>` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Bearer auth: the token must validate; its claims are handed to the
/// handler as a request extension.
pub async fn bearer_auth_middleware(
    State(state): State<Arc<MiddlewareState>>,
    headers: HeaderMap,
    mut request: Request,
    next: Next,
) -> Response {
    let Some(token) = bearer_token(&headers) else {
        warn!("Rejected request: missing bearer token");
        return (StatusCode::UNAUTHORIZED, "Bearer token required").into_response();
    };

    match state.tokens.validate(token) {
        Ok(claims) => {
            request.extensions_mut().insert(claims);
            next.run(request).await
        }
        Err(e) => {
            warn!(error = %e, "Rejected request: invalid bearer token");
            (StatusCode::UNAUTHORIZED, "Invalid bearer token").into_response()
        }
    }
}

/// Who a rate-limit bucket belongs to: the first forwarded address when a
/// proxy supplies one, otherwise one shared bucket.
pub fn caller_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .or_else(|| headers.get("x-real-ip").and_then(|v| v.to_str().ok()))
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

/// Token-bucket rate limiting per caller.
pub async fn rate_limit_middleware(
    State(state): State<Arc<MiddlewareState>>,
    headers: HeaderMap,
    request: Request,
    next: Next,
) -> Response {
    let caller = caller_key(&headers);
    if !state.rate_limiter.check(&caller).await {
        warn!(caller = %caller, "Rate limited request");
        return (StatusCode::TOO_MANY_REQUESTS, "Rate limit exceeded").into_response();
    }

    next.run(request).await
}
