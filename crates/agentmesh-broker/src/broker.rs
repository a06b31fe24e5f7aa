use agentmesh_core::MeshResult;
use async_trait::async_trait;
use std::collections::BTreeMap;
use tokio::sync::mpsc;

/// Out-of-band headers attached to a published message.
pub type Headers = BTreeMap<String, String>;

/// Identifies one registration with the broker.
pub type SubscriptionId = u64;

/// A message as delivered by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerMessage {
    /// The concrete subject it was published on.
    pub subject: String,
    pub headers: Headers,
    pub payload: Vec<u8>,
}

impl BrokerMessage {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).map(String::as_str)
    }
}

/// An active registration. Deliveries arrive on `receiver` in the order the
/// broker routed them; cancel with [`MessageBroker::unsubscribe`].
#[derive(Debug)]
pub struct Subscription {
    pub id: SubscriptionId,
    /// The subject pattern that was registered.
    pub subject: String,
    pub receiver: mpsc::UnboundedReceiver<BrokerMessage>,
}

/// A hierarchical publish/subscribe service.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Publish `payload` on a concrete (wildcard-free) subject.
    async fn publish(&self, subject: &str, headers: Headers, payload: Vec<u8>) -> MeshResult<()>;

    /// Register interest in a subject pattern.
    async fn subscribe(&self, subject: &str) -> MeshResult<Subscription>;

    /// Cancel a registration. Unknown ids are not an error.
    async fn unsubscribe(&self, id: SubscriptionId) -> MeshResult<()>;
}
