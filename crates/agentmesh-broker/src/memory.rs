use crate::broker::{BrokerMessage, Headers, MessageBroker, Subscription, SubscriptionId};
use agentmesh_core::subject;
use agentmesh_core::{MeshError, MeshResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, trace};

struct Route {
    pattern: String,
    tx: mpsc::UnboundedSender<BrokerMessage>,
}

/// In-process broker routing with the shared subject matcher.
///
/// One long-lived instance is shared by every session; publishes and
/// subscriptions are independent operations against it.
pub struct InMemoryBroker {
    routes: RwLock<HashMap<SubscriptionId, Route>>,
    next_id: AtomicU64,
}

impl InMemoryBroker {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Number of live registrations.
    pub async fn subscription_count(&self) -> usize {
        self.routes.read().await.len()
    }

    /// Number of live registrations whose pattern is exactly `pattern`.
    pub async fn subscribers_of(&self, pattern: &str) -> usize {
        self.routes
            .read()
            .await
            .values()
            .filter(|r| r.pattern == pattern)
            .count()
    }
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }
}

#[async_trait]
impl MessageBroker for InMemoryBroker {
    async fn publish(&self, subject: &str, headers: Headers, payload: Vec<u8>) -> MeshResult<()> {
        if !subject::is_valid(subject) || subject::has_wildcard(subject) {
            return Err(MeshError::Broker(format!(
                "Cannot publish to '{subject}': not a concrete subject"
            )));
        }

        let message = BrokerMessage {
            subject: subject.to_string(),
            headers,
            payload,
        };

        let mut stale = Vec::new();
        {
            let routes = self.routes.read().await;
            for (id, route) in routes.iter() {
                if subject::matches(&route.pattern, subject) {
                    trace!(subscription = id, subject = %subject, "Routing message");
                    if route.tx.send(message.clone()).is_err() {
                        stale.push(*id);
                    }
                }
            }
        }

        if !stale.is_empty() {
            let mut routes = self.routes.write().await;
            for id in stale {
                routes.remove(&id);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> MeshResult<Subscription> {
        if !subject::is_valid(pattern) {
            return Err(MeshError::Broker(format!("Invalid subject pattern '{pattern}'")));
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, receiver) = mpsc::unbounded_channel();
        self.routes.write().await.insert(
            id,
            Route {
                pattern: pattern.to_string(),
                tx,
            },
        );
        debug!(subscription = id, subject = %pattern, "Subscribed");
        Ok(Subscription {
            id,
            subject: pattern.to_string(),
            receiver,
        })
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> MeshResult<()> {
        if self.routes.write().await.remove(&id).is_some() {
            debug!(subscription = id, "Unsubscribed");
        }
        Ok(())
    }
}
