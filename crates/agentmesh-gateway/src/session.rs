use agentmesh_broker::SubscriptionId;
use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Registry key of a live session.
pub type SessionKey = (String, Uuid);

/// Who is on the other end of a socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionKind {
    Agent {
        agent_id: String,
        capabilities: Vec<String>,
    },
    Dashboard {
        user_id: String,
    },
}

/// A broker registration owned by one session.
#[derive(Debug)]
pub struct SessionSubscription {
    /// The effective (namespaced) subject.
    pub subject: String,
    pub id: SubscriptionId,
    /// Forwards broker deliveries to the session's socket.
    pub forwarder: JoinHandle<()>,
}

/// One live socket session.
///
/// Outbound frames go through `tx`; the socket's send task drains it.
#[derive(Debug)]
pub struct Session {
    pub id: Uuid,
    pub tenant_id: String,
    pub kind: SessionKind,
    pub connected_at: DateTime<Utc>,
    tx: mpsc::UnboundedSender<String>,
    subscriptions: Mutex<Vec<SessionSubscription>>,
}

impl Session {
    pub fn new(tenant_id: impl Into<String>, kind: SessionKind, tx: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tenant_id: tenant_id.into(),
            kind,
            connected_at: Utc::now(),
            tx,
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    pub fn key(&self) -> SessionKey {
        (self.tenant_id.clone(), self.id)
    }

    pub fn agent_id(&self) -> Option<&str> {
        match &self.kind {
            SessionKind::Agent { agent_id, .. } => Some(agent_id),
            SessionKind::Dashboard { .. } => None,
        }
    }

    pub fn is_dashboard(&self) -> bool {
        matches!(self.kind, SessionKind::Dashboard { .. })
    }

    /// The id stamped into published data: agent id or dashboard user id.
    pub fn principal(&self) -> &str {
        match &self.kind {
            SessionKind::Agent { agent_id, .. } => agent_id,
            SessionKind::Dashboard { user_id } => user_id,
        }
    }

    /// Queue a text frame. Returns `false` once the socket is gone.
    pub fn send(&self, frame: String) -> bool {
        self.tx.send(frame).is_ok()
    }

    pub(crate) fn sender(&self) -> mpsc::UnboundedSender<String> {
        self.tx.clone()
    }

    pub async fn is_subscribed(&self, subject: &str) -> bool {
        self.subscriptions
            .lock()
            .await
            .iter()
            .any(|s| s.subject == subject)
    }

    pub async fn subscribed_subjects(&self) -> Vec<String> {
        self.subscriptions
            .lock()
            .await
            .iter()
            .map(|s| s.subject.clone())
            .collect()
    }

    pub(crate) async fn add_subscription(&self, subscription: SessionSubscription) {
        self.subscriptions.lock().await.push(subscription);
    }

    /// Remove this session's registration for `subject`, if any.
    pub(crate) async fn take_subscription(&self, subject: &str) -> Option<SessionSubscription> {
        let mut subs = self.subscriptions.lock().await;
        let index = subs.iter().position(|s| s.subject == subject)?;
        Some(subs.remove(index))
    }

    pub(crate) async fn drain_subscriptions(&self) -> Vec<SessionSubscription> {
        std::mem::take(&mut *self.subscriptions.lock().await)
    }
}
