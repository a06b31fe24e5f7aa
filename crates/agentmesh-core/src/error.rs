use serde::{Deserialize, Serialize};
use std::fmt;

/// A broker operation gated by subject authorization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Send a message on a subject.
    Publish,
    /// Register interest in a subject pattern.
    Subscribe,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Action::Publish => f.write_str("publish"),
            Action::Subscribe => f.write_str("subscribe"),
        }
    }
}

/// Top-level error type for agentmesh.
///
/// Each variant corresponds to one failure class the gateway distinguishes
/// when deciding whether to close a socket, answer with an `error` frame, or
/// just log.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    /// Identity could not be proven (bad signature, unknown challenge, revoked key).
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The tenant may not perform `action` on `subject`.
    #[error("Not authorized to {action} on subject '{subject}' for tenant '{tenant_id}'")]
    AuthorizationDenied {
        /// Tenant that made the request.
        tenant_id: String,
        /// Requested subject or subject pattern.
        subject: String,
        /// Requested operation.
        action: Action,
    },

    /// A tenant or agent id that cannot be used as a single subject token.
    #[error("Invalid identifier: {0}")]
    InvalidIdentifier(String),

    /// A client payload could not be decoded.
    #[error("Invalid message: {0}")]
    MessageDecode(String),

    /// The peer closed the connection.
    #[error("Connection closed")]
    ConnectionClosed,

    /// The connection failed unexpectedly.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The publish/subscribe service rejected or failed an operation.
    #[error("Broker error: {0}")]
    Broker(String),

    /// A backing store (challenges, keys) failed.
    #[error("Store error: {0}")]
    Store(String),

    /// A bearer token could not be issued or validated.
    #[error("Token error: {0}")]
    Token(String),

    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl MeshError {
    /// Shorthand for an [`MeshError::AuthorizationDenied`].
    pub fn denied(tenant_id: impl Into<String>, subject: impl Into<String>, action: Action) -> Self {
        MeshError::AuthorizationDenied {
            tenant_id: tenant_id.into(),
            subject: subject.into(),
            action,
        }
    }

    /// Whether this error is the expected end of a connection rather than a fault.
    pub fn is_expected_close(&self) -> bool {
        matches!(self, MeshError::ConnectionClosed)
    }
}

/// A convenience `Result` alias using [`MeshError`].
pub type MeshResult<T> = Result<T, MeshError>;
