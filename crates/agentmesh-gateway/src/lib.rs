//! Socket and HTTP front end of agentmesh.
//!
//! Agents connect with a signed challenge, dashboards with a bearer token.
//! The [`ConnectionManager`] bridges every accepted socket onto the broker
//! under its tenant's namespace, and [`PresenceTracker`] keeps agent status.

/// Challenge and verification HTTP endpoints.
pub mod auth;
/// Gateway settings and subject namespacing.
pub mod config;
/// Session registry and broker bridging.
pub mod connection;
/// Bearer auth and rate limiting.
pub mod middleware;
/// Agent online/offline tracking.
pub mod presence;
/// Client frame decoding and dispatch.
pub mod router;
/// Router assembly and socket handling.
pub mod server;
/// Live socket sessions.
pub mod session;

pub use config::GatewayConfig;
pub use connection::ConnectionManager;
pub use presence::PresenceTracker;
pub use router::{ClientMessage, MessageRouter, ServerMessage};
pub use server::{AppState, GatewayServer, POLICY_VIOLATION_CLOSE};
pub use session::{Session, SessionKind};
