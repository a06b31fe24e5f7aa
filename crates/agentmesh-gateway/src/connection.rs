use crate::config::GatewayConfig;
use crate::presence::PresenceTracker;
use crate::router::ServerMessage;
use crate::session::{Session, SessionKey, SessionKind, SessionSubscription};
use agentmesh_broker::{BrokerMessage, Headers, MessageBroker};
use agentmesh_core::subject;
use agentmesh_core::{Action, MeshError, MeshResult};
use agentmesh_protocol::{headers, AgentStatus};
use agentmesh_security::SubjectAuthorizer;
use chrono::Utc;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Owns every live session and bridges them to the broker.
///
/// Sessions are keyed by `(tenant_id, session_id)` and only reachable
/// through the accessors here. Each subscription a session makes is a
/// broker registration plus a forwarder task writing `message` frames to
/// that session's socket.
pub struct ConnectionManager {
    sessions: RwLock<HashMap<SessionKey, Arc<Session>>>,
    broker: Arc<dyn MessageBroker>,
    authorizer: Arc<SubjectAuthorizer>,
    presence: Arc<PresenceTracker>,
    config: Arc<GatewayConfig>,
}

impl ConnectionManager {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        authorizer: Arc<SubjectAuthorizer>,
        presence: Arc<PresenceTracker>,
        config: GatewayConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            broker,
            authorizer,
            presence,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn presence(&self) -> &Arc<PresenceTracker> {
        &self.presence
    }

    /// Add an accepted session. Agents are marked online.
    pub async fn register(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        self.sessions
            .write()
            .await
            .insert(session.key(), Arc::clone(&session));

        if let SessionKind::Agent {
            agent_id,
            capabilities,
        } = &session.kind
        {
            self.presence
                .mark_online(&session.tenant_id, agent_id, capabilities)
                .await;
        }
        info!(
            session_id = %session.id,
            tenant_id = %session.tenant_id,
            principal = %session.principal(),
            dashboard = session.is_dashboard(),
            "Session registered"
        );
        session
    }

    pub async fn get(&self, tenant_id: &str, session_id: Uuid) -> Option<Arc<Session>> {
        self.sessions
            .read()
            .await
            .get(&(tenant_id.to_string(), session_id))
            .cloned()
    }

    pub async fn is_registered(&self, key: &SessionKey) -> bool {
        self.sessions.read().await.contains_key(key)
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn tenant_session_count(&self, tenant_id: &str) -> usize {
        self.sessions
            .read()
            .await
            .keys()
            .filter(|(t, _)| t == tenant_id)
            .count()
    }

    /// Status of an agent as seen by presence tracking.
    pub async fn agent_status(&self, tenant_id: &str, agent_id: &str) -> Option<AgentStatus> {
        self.presence.status(tenant_id, agent_id).await
    }

    async fn dashboards_of(&self, tenant_id: &str) -> Vec<Arc<Session>> {
        self.sessions
            .read()
            .await
            .values()
            .filter(|s| s.tenant_id == tenant_id && s.is_dashboard())
            .cloned()
            .collect()
    }

    /// Subscribe `session` to `requested`, placed in its tenant namespace.
    /// Returns the effective subject.
    pub async fn subscribe(&self, session: &Arc<Session>, requested: &str) -> MeshResult<String> {
        let subject = self.config.resolve_subject(&session.tenant_id, requested);
        self.authorizer
            .validate(&session.tenant_id, &subject, Action::Subscribe)?;

        if session.is_subscribed(&subject).await {
            return Ok(subject);
        }

        let mut subscription = self.broker.subscribe(&subject).await?;
        let tx = session.sender();
        let dedupe_channels = session.is_dashboard();
        let config = Arc::clone(&self.config);
        let tenant_id = session.tenant_id.clone();
        let session_id = session.id;
        let forwarder = tokio::spawn(async move {
            while let Some(delivery) = subscription.receiver.recv().await {
                // Local channel publishes already reached this dashboard via fanout.
                if dedupe_channels
                    && delivery.header(headers::ORIGIN) == Some(config.instance_id.as_str())
                    && config.is_channel_subject(&tenant_id, &delivery.subject)
                {
                    continue;
                }
                let frame = match message_frame(&delivery) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(session_id = %session_id, subject = %delivery.subject, error = %e, "Dropping undeliverable message");
                        continue;
                    }
                };
                if tx.send(frame).is_err() {
                    break;
                }
            }
        });

        let id = subscription.id;
        session
            .add_subscription(SessionSubscription {
                subject: subject.clone(),
                id,
                forwarder,
            })
            .await;

        // Lost a race with teardown: nothing else will cancel this one.
        if !self.is_registered(&session.key()).await {
            if let Some(orphan) = session.take_subscription(&subject).await {
                self.cancel(orphan).await;
            }
            return Err(MeshError::ConnectionClosed);
        }

        debug!(session_id = %session.id, subject = %subject, subscription = id, "Subscribed");
        Ok(subject)
    }

    /// Dashboard variant of [`subscribe`](Self::subscribe): only channel and
    /// broadcast subjects of the dashboard's tenant. Anything else yields
    /// `Ok(None)` and is only logged.
    pub async fn subscribe_dashboard(
        &self,
        session: &Arc<Session>,
        topic: &str,
    ) -> MeshResult<Option<String>> {
        let subject = self.config.resolve_subject(&session.tenant_id, topic);
        if !self.config.is_channel_subject(&session.tenant_id, &subject) {
            warn!(
                session_id = %session.id,
                tenant_id = %session.tenant_id,
                topic = %topic,
                "Ignoring dashboard subscription outside channel namespace"
            );
            return Ok(None);
        }
        self.subscribe(session, &subject).await.map(Some)
    }

    /// Cancel the session's own subscription to `requested`. Returns the
    /// effective subject, or `None` if the session held no such subscription.
    /// The forwarder stops even if the broker fails to drop the registration.
    pub async fn unsubscribe(
        &self,
        session: &Arc<Session>,
        requested: &str,
    ) -> MeshResult<Option<String>> {
        let subject = self.config.resolve_subject(&session.tenant_id, requested);
        match session.take_subscription(&subject).await {
            Some(subscription) => {
                self.cancel(subscription).await;
                debug!(session_id = %session.id, subject = %subject, "Unsubscribed");
                Ok(Some(subject))
            }
            None => Ok(None),
        }
    }

    /// Publish `data` from `session` on `requested`.
    ///
    /// `agent_id` (or `user_id` for dashboards), `tenant_id` and `timestamp`
    /// are added to `data` when missing. Channel subjects are also fanned
    /// out to every dashboard of the tenant on this instance.
    pub async fn publish(
        &self,
        session: &Arc<Session>,
        requested: &str,
        data: Value,
    ) -> MeshResult<String> {
        let subject = self.config.resolve_subject(&session.tenant_id, requested);
        if subject::has_wildcard(&subject) {
            return Err(MeshError::MessageDecode(format!(
                "Cannot publish to wildcard subject '{subject}'"
            )));
        }
        self.authorizer
            .validate(&session.tenant_id, &subject, Action::Publish)?;

        let data = inject_metadata(session, data)?;
        let payload = serde_json::to_vec(&data)?;

        let mut meta = Headers::new();
        meta.insert(headers::TENANT.into(), session.tenant_id.clone());
        meta.insert(headers::SOURCE.into(), session.principal().to_string());
        meta.insert(headers::ORIGIN.into(), self.config.instance_id.clone());
        self.broker.publish(&subject, meta, payload).await?;
        debug!(session_id = %session.id, subject = %subject, "Published");

        if self.config.is_channel_subject(&session.tenant_id, &subject) {
            self.fanout_to_dashboards(&session.tenant_id, &subject, data)
                .await?;
        }
        Ok(subject)
    }

    async fn fanout_to_dashboards(&self, tenant_id: &str, subject: &str, data: Value) -> MeshResult<()> {
        let dashboards = self.dashboards_of(tenant_id).await;
        if dashboards.is_empty() {
            return Ok(());
        }
        let frame = ServerMessage::Message {
            subject: subject.to_string(),
            data,
            timestamp: Utc::now().to_rfc3339(),
        }
        .to_text()?;
        for dashboard in &dashboards {
            if !dashboard.send(frame.clone()) {
                debug!(session_id = %dashboard.id, "Dashboard gone before fanout");
            }
        }
        debug!(tenant_id = %tenant_id, subject = %subject, dashboards = dashboards.len(), "Fanned out to dashboards");
        Ok(())
    }

    /// Record liveness for an agent session.
    pub async fn touch(&self, session: &Session) {
        if let Some(agent_id) = session.agent_id() {
            self.presence.touch(&session.tenant_id, agent_id).await;
        }
    }

    /// Remove a session and cancel everything it owns.
    ///
    /// Only the first call for a session does anything; later calls return
    /// `false`. Cancellation failures are logged and never stop the rest of
    /// the cleanup.
    pub async fn teardown(&self, tenant_id: &str, session_id: Uuid) -> bool {
        let Some(session) = self
            .sessions
            .write()
            .await
            .remove(&(tenant_id.to_string(), session_id))
        else {
            return false;
        };

        let subscriptions = session.drain_subscriptions().await;
        let cancelled = subscriptions.len();
        for subscription in subscriptions {
            self.cancel(subscription).await;
        }
        if let Some(agent_id) = session.agent_id() {
            self.presence.mark_offline(tenant_id, agent_id).await;
        }
        info!(
            session_id = %session_id,
            tenant_id = %tenant_id,
            principal = %session.principal(),
            subscriptions = cancelled,
            "Session closed"
        );
        true
    }

    async fn cancel(&self, subscription: SessionSubscription) {
        if let Err(e) = self.broker.unsubscribe(subscription.id).await {
            warn!(
                subject = %subscription.subject,
                subscription = subscription.id,
                error = %e,
                "Failed to cancel subscription"
            );
        }
        subscription.forwarder.abort();
    }
}

fn message_frame(delivery: &BrokerMessage) -> MeshResult<String> {
    let data = serde_json::from_slice::<Value>(&delivery.payload)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&delivery.payload).into_owned()));
    ServerMessage::Message {
        subject: delivery.subject.clone(),
        data,
        timestamp: Utc::now().to_rfc3339(),
    }
    .to_text()
}

fn inject_metadata(session: &Session, data: Value) -> MeshResult<Value> {
    let mut fields = match data {
        Value::Object(fields) => fields,
        Value::Null => Map::new(),
        _ => {
            return Err(MeshError::MessageDecode(
                "Publish data must be a JSON object".into(),
            ))
        }
    };
    let principal_key = if session.is_dashboard() { "user_id" } else { "agent_id" };
    fields
        .entry(principal_key)
        .or_insert_with(|| Value::String(session.principal().to_string()));
    fields
        .entry("tenant_id")
        .or_insert_with(|| Value::String(session.tenant_id.clone()));
    fields
        .entry("timestamp")
        .or_insert_with(|| Value::String(Utc::now().to_rfc3339()));
    Ok(Value::Object(fields))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use agentmesh_broker::InMemoryBroker;
    use tokio::sync::mpsc;

    struct Harness {
        manager: Arc<ConnectionManager>,
        broker: Arc<InMemoryBroker>,
    }

    fn harness() -> Harness {
        let broker = InMemoryBroker::new();
        let presence = PresenceTracker::new(std::time::Duration::from_secs(60), None);
        let manager = ConnectionManager::new(
            broker.clone(),
            Arc::new(SubjectAuthorizer::new()),
            presence,
            GatewayConfig::default(),
        );
        Harness { manager, broker }
    }

    async fn agent(h: &Harness, tenant: &str, agent_id: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let kind = SessionKind::Agent {
            agent_id: agent_id.into(),
            capabilities: vec![],
        };
        (h.manager.register(Session::new(tenant, kind, tx)).await, rx)
    }

    async fn dashboard(h: &Harness, tenant: &str) -> (Arc<Session>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let kind = SessionKind::Dashboard { user_id: "u1".into() };
        (h.manager.register(Session::new(tenant, kind, tx)).await, rx)
    }

    fn frame(raw: &str) -> Value {
        serde_json::from_str(raw).unwrap()
    }

    #[tokio::test]
    async fn test_publish_injects_missing_metadata_only() {
        let h = harness();
        let (a1, mut rx) = agent(&h, "T1", "A1").await;
        h.manager.subscribe(&a1, "orders").await.unwrap();

        h.manager.publish(&a1, "orders", serde_json::json!({})).await.unwrap();
        let msg = frame(&rx.recv().await.unwrap());
        assert_eq!(msg["type"], "message");
        assert_eq!(msg["subject"], "tenant.T1.orders");
        assert_eq!(msg["data"]["agent_id"], "A1");
        assert_eq!(msg["data"]["tenant_id"], "T1");
        assert!(msg["data"]["timestamp"].is_string());

        h.manager
            .publish(&a1, "orders", serde_json::json!({"timestamp": "X", "agent_id": "me"}))
            .await
            .unwrap();
        let msg = frame(&rx.recv().await.unwrap());
        assert_eq!(msg["data"]["timestamp"], "X");
        assert_eq!(msg["data"]["agent_id"], "me");
    }

    #[tokio::test]
    async fn test_publish_rejects_scalars_and_wildcards() {
        let h = harness();
        let (a1, _rx) = agent(&h, "T1", "A1").await;
        let err = h.manager.publish(&a1, "orders", serde_json::json!(5)).await.unwrap_err();
        assert!(matches!(err, MeshError::MessageDecode(_)));
        let err = h.manager.publish(&a1, "orders.*", serde_json::json!({})).await.unwrap_err();
        assert!(matches!(err, MeshError::MessageDecode(_)));
    }

    #[tokio::test]
    async fn test_cross_tenant_subscribe_denied() {
        let h = harness();
        let (a1, _rx) = agent(&h, "T1", "A1").await;
        // Global prefix skips namespacing but is still authorized.
        let err = h.manager.subscribe(&a1, "presence.>").await.unwrap_err();
        assert!(matches!(err, MeshError::AuthorizationDenied { .. }));
        assert_eq!(h.broker.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_unsubscribe_only_touches_own_subscriptions() {
        let h = harness();
        let (a1, _rx1) = agent(&h, "T1", "A1").await;
        let (a2, _rx2) = agent(&h, "T1", "A2").await;
        h.manager.subscribe(&a1, "orders").await.unwrap();
        h.manager.subscribe(&a2, "orders").await.unwrap();

        assert_eq!(h.manager.unsubscribe(&a1, "orders").await.unwrap().as_deref(), Some("tenant.T1.orders"));
        assert_eq!(h.manager.unsubscribe(&a1, "orders").await.unwrap(), None);
        assert!(a2.is_subscribed("tenant.T1.orders").await);
        assert_eq!(h.broker.subscription_count().await, 1);
    }

    /// Delegates to an in-memory broker but never manages to unsubscribe.
    struct StickyBroker {
        inner: Arc<InMemoryBroker>,
    }

    #[async_trait::async_trait]
    impl MessageBroker for StickyBroker {
        async fn publish(&self, subject: &str, headers: Headers, payload: Vec<u8>) -> MeshResult<()> {
            self.inner.publish(subject, headers, payload).await
        }

        async fn subscribe(&self, subject: &str) -> MeshResult<agentmesh_broker::Subscription> {
            self.inner.subscribe(subject).await
        }

        async fn unsubscribe(&self, _id: agentmesh_broker::SubscriptionId) -> MeshResult<()> {
            Err(MeshError::Broker("unsubscribe unavailable".into()))
        }
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_forwarding_when_broker_fails() {
        let inner = InMemoryBroker::new();
        let manager = ConnectionManager::new(
            Arc::new(StickyBroker { inner: inner.clone() }),
            Arc::new(SubjectAuthorizer::new()),
            PresenceTracker::new(std::time::Duration::from_secs(60), None),
            GatewayConfig::default(),
        );
        let (tx, mut rx) = mpsc::unbounded_channel();
        let kind = SessionKind::Agent {
            agent_id: "A1".into(),
            capabilities: vec![],
        };
        let a1 = manager.register(Session::new("T1", kind, tx)).await;
        manager.subscribe(&a1, "orders").await.unwrap();

        let removed = manager.unsubscribe(&a1, "orders").await.unwrap();
        assert_eq!(removed.as_deref(), Some("tenant.T1.orders"));
        assert!(!a1.is_subscribed("tenant.T1.orders").await);

        inner
            .publish("tenant.T1.orders", Headers::new(), b"{}".to_vec())
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_duplicate_subscribe_registers_once() {
        let h = harness();
        let (a1, _rx) = agent(&h, "T1", "A1").await;
        h.manager.subscribe(&a1, "orders").await.unwrap();
        h.manager.subscribe(&a1, "tenant.T1.orders").await.unwrap();
        assert_eq!(h.broker.subscription_count().await, 1);
    }

    #[tokio::test]
    async fn test_teardown_is_complete_and_runs_once() {
        let h = harness();
        let (a1, _rx) = agent(&h, "T1", "A1").await;
        h.manager.subscribe(&a1, "a").await.unwrap();
        h.manager.subscribe(&a1, "b.>").await.unwrap();
        assert_eq!(h.broker.subscription_count().await, 2);

        assert!(h.manager.teardown("T1", a1.id).await);
        assert!(!h.manager.teardown("T1", a1.id).await);
        assert_eq!(h.broker.subscription_count().await, 0);
        assert_eq!(h.manager.session_count().await, 0);
        assert_eq!(h.manager.agent_status("T1", "A1").await, Some(AgentStatus::Offline));
    }

    #[tokio::test]
    async fn test_subscribe_after_teardown_leaves_nothing_behind() {
        let h = harness();
        let (a1, _rx) = agent(&h, "T1", "A1").await;
        h.manager.teardown("T1", a1.id).await;
        let err = h.manager.subscribe(&a1, "late").await.unwrap_err();
        assert!(matches!(err, MeshError::ConnectionClosed));
        assert_eq!(h.broker.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_channel_publish_fans_out_once_per_dashboard() {
        let h = harness();
        let (a1, _rx) = agent(&h, "T1", "A1").await;
        let (d1, mut drx) = dashboard(&h, "T1").await;
        let (_other, mut orx) = dashboard(&h, "T2").await;
        // Subscribed as well: must not see the local publish twice.
        h.manager.subscribe_dashboard(&d1, "channels.general").await.unwrap();

        h.manager
            .publish(&a1, "channels.general", serde_json::json!({"text": "hi"}))
            .await
            .unwrap();
        let msg = frame(&drx.recv().await.unwrap());
        assert_eq!(msg["subject"], "tenant.T1.channels.general");
        assert_eq!(msg["data"]["text"], "hi");

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert!(drx.try_recv().is_err());
        assert!(orx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_dashboard_receives_remote_channel_publishes() {
        let h = harness();
        let (d1, mut drx) = dashboard(&h, "T1").await;
        h.manager.subscribe_dashboard(&d1, "broadcast").await.unwrap();

        let mut meta = Headers::new();
        meta.insert(headers::ORIGIN.into(), "another-instance".into());
        h.broker
            .publish("tenant.T1.broadcast", meta, br#"{"n":1}"#.to_vec())
            .await
            .unwrap();
        let msg = frame(&drx.recv().await.unwrap());
        assert_eq!(msg["data"]["n"], 1);
    }

    #[tokio::test]
    async fn test_dashboard_subscribe_outside_channels_ignored() {
        let h = harness();
        let (d1, _rx) = dashboard(&h, "T1").await;
        assert_eq!(h.manager.subscribe_dashboard(&d1, "orders").await.unwrap(), None);
        assert_eq!(
            h.manager.subscribe_dashboard(&d1, "tenant.T2.channels.x").await.unwrap(),
            None
        );
        assert_eq!(h.broker.subscription_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_json_payload_forwarded_as_string() {
        let h = harness();
        let (a1, mut rx) = agent(&h, "T1", "A1").await;
        h.manager.subscribe(&a1, "raw").await.unwrap();
        h.broker
            .publish("tenant.T1.raw", Headers::new(), b"plain text".to_vec())
            .await
            .unwrap();
        let msg = frame(&rx.recv().await.unwrap());
        assert_eq!(msg["data"], "plain text");
    }
}
