//! Authentication and authorization primitives for agentmesh.
//!
//! Agents prove possession of a registered RSA key by signing a one-time
//! challenge; dashboards and HTTP callers present bearer tokens; every broker
//! subject a tenant touches is checked against that tenant's allow-list.
//!
//! # Main types
//!
//! - [`ChallengeAuthenticator`] — Issues challenges and verifies signed responses.
//! - [`ChallengeStore`] / [`InMemoryChallengeStore`] — Short-lived challenge records.
//! - [`KeyDirectory`] / [`InMemoryKeyDirectory`] — Registered public keys per tenant.
//! - [`SignatureVerifier`] — RSASSA-PKCS1-v1.5 / SHA-256 signature checks.
//! - [`SubjectAuthorizer`] — Per-tenant publish/subscribe allow-lists.
//! - [`TokenIssuer`] — Short-lived HS256 bearer tokens.
//! - [`RateLimiter`] — Token-bucket rate limiter keyed by caller.

/// Challenge-response authenticator.
pub mod authenticator;
/// Tenant subject authorization.
pub mod authorizer;
/// Challenge records and their store.
pub mod challenge;
/// Public key directory.
pub mod keys;
/// Token-bucket rate limiting.
pub mod rate_limit;
/// RSA signature verification.
pub mod signature;
/// Bearer token issuing and validation.
pub mod token;

pub use authenticator::ChallengeAuthenticator;
pub use authorizer::{SubjectAuthorizer, TenantPermissions};
pub use challenge::{Challenge, ChallengeDescriptor, ChallengeStore, InMemoryChallengeStore};
pub use keys::{InMemoryKeyDirectory, KeyDirectory, KeyRecord, KeyStatus};
pub use rate_limit::RateLimiter;
pub use signature::SignatureVerifier;
pub use token::{TokenClaims, TokenIssuer, TokenKind};
