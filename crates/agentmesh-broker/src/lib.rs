//! The publish/subscribe service the gateway bridges sessions onto.
//!
//! The gateway only relies on [`MessageBroker`]: publish to a concrete
//! subject, subscribe to a pattern, cancel a subscription. [`InMemoryBroker`]
//! is the in-process implementation used by the binary and the tests.

/// Broker trait and message types.
pub mod broker;
/// In-process broker.
pub mod memory;

pub use broker::{BrokerMessage, Headers, MessageBroker, Subscription, SubscriptionId};
pub use memory::InMemoryBroker;
