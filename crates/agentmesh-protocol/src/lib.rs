//! Structured agent-to-agent messaging over the broker.
//!
//! - [`AgentMessage`] is the envelope, with deterministic subject derivation.
//! - [`AgentProtocol`] sends envelopes, announces status and runs
//!   fixed-window capability discovery.
//! - [`DiscoveryResponder`] answers discovery queries for one agent.

/// Send, announce and discover.
pub mod client;
/// The envelope and its subject rules.
pub mod envelope;
/// Discovery replies.
pub mod responder;

pub use client::{
    discovery_reply_subject, discovery_request_subject, headers, status_subject, AgentProtocol,
    AgentStatus, Announcement, DiscoveryQuery, ProtocolConfig,
};
pub use envelope::{
    AgentMessage, Identity, MessageContext, MessageType, Payload, Routing, StreamMetadata,
    AGENT_ROOT,
};
pub use responder::DiscoveryResponder;
