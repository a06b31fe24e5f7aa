use agentmesh_protocol::{AgentProtocol, AgentStatus};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Presence of one agent within a tenant.
#[derive(Debug, Clone)]
pub struct PresenceEntry {
    pub status: AgentStatus,
    pub capabilities: Vec<String>,
    pub last_seen: Instant,
    /// Live sockets for this agent.
    pub sessions: usize,
}

type PresenceKey = (String, String);

/// The single source of agent status: `online` until the agent disconnects
/// or stays silent past `timeout`, then `offline`.
///
/// Every transition is announced on the tenant status subject when a
/// protocol handle is attached.
pub struct PresenceTracker {
    entries: RwLock<HashMap<PresenceKey, PresenceEntry>>,
    timeout: Duration,
    protocol: Option<Arc<AgentProtocol>>,
}

impl PresenceTracker {
    pub fn new(timeout: Duration, protocol: Option<Arc<AgentProtocol>>) -> Arc<Self> {
        Arc::new(Self {
            entries: RwLock::new(HashMap::new()),
            timeout,
            protocol,
        })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// An agent socket was accepted.
    pub async fn mark_online(&self, tenant_id: &str, agent_id: &str, capabilities: &[String]) {
        let transitioned = {
            let mut entries = self.entries.write().await;
            let entry = entries
                .entry((tenant_id.to_string(), agent_id.to_string()))
                .or_insert_with(|| PresenceEntry {
                    status: AgentStatus::Offline,
                    capabilities: Vec::new(),
                    last_seen: Instant::now(),
                    sessions: 0,
                });
            entry.sessions += 1;
            entry.last_seen = Instant::now();
            entry.capabilities = capabilities.to_vec();
            let was = entry.status;
            entry.status = AgentStatus::Online;
            was != AgentStatus::Online
        };
        if transitioned {
            self.announce(tenant_id, agent_id, capabilities, AgentStatus::Online)
                .await;
        }
    }

    /// The agent showed signs of life. Revives an agent the sweep timed out.
    pub async fn touch(&self, tenant_id: &str, agent_id: &str) {
        let revived = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&(tenant_id.to_string(), agent_id.to_string()))
            else {
                return;
            };
            entry.last_seen = Instant::now();
            if entry.status == AgentStatus::Offline && entry.sessions > 0 {
                entry.status = AgentStatus::Online;
                Some(entry.capabilities.clone())
            } else {
                None
            }
        };
        if let Some(capabilities) = revived {
            self.announce(tenant_id, agent_id, &capabilities, AgentStatus::Online)
                .await;
        }
    }

    /// One of the agent's sockets closed. The agent goes offline with its
    /// last socket.
    pub async fn mark_offline(&self, tenant_id: &str, agent_id: &str) {
        let transitioned = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&(tenant_id.to_string(), agent_id.to_string()))
            else {
                return;
            };
            entry.sessions = entry.sessions.saturating_sub(1);
            if entry.sessions > 0 || entry.status == AgentStatus::Offline {
                None
            } else {
                entry.status = AgentStatus::Offline;
                Some(entry.capabilities.clone())
            }
        };
        if let Some(capabilities) = transitioned {
            self.announce(tenant_id, agent_id, &capabilities, AgentStatus::Offline)
                .await;
        }
    }

    pub async fn status(&self, tenant_id: &str, agent_id: &str) -> Option<AgentStatus> {
        self.entries
            .read()
            .await
            .get(&(tenant_id.to_string(), agent_id.to_string()))
            .map(|e| e.status)
    }

    /// Online agents of a tenant.
    pub async fn online(&self, tenant_id: &str) -> Vec<String> {
        self.entries
            .read()
            .await
            .iter()
            .filter(|((t, _), e)| t == tenant_id && e.status == AgentStatus::Online)
            .map(|((_, a), _)| a.clone())
            .collect()
    }

    /// Move every agent silent for longer than the timeout to offline.
    /// Returns the `(tenant_id, agent_id)` pairs that transitioned.
    pub async fn sweep(&self, now: Instant) -> Vec<(String, String)> {
        let expired: Vec<(PresenceKey, Vec<String>)> = {
            let mut entries = self.entries.write().await;
            entries
                .iter_mut()
                .filter(|(_, e)| {
                    e.status == AgentStatus::Online
                        && now.saturating_duration_since(e.last_seen) > self.timeout
                })
                .map(|(key, e)| {
                    e.status = AgentStatus::Offline;
                    (key.clone(), e.capabilities.clone())
                })
                .collect()
        };

        for ((tenant_id, agent_id), capabilities) in &expired {
            info!(tenant_id = %tenant_id, agent_id = %agent_id, "Agent presence timed out");
            self.announce(tenant_id, agent_id, capabilities, AgentStatus::Offline)
                .await;
        }

        // Forget agents with no sockets left.
        self.entries
            .write()
            .await
            .retain(|_, e| e.sessions > 0 || e.status == AgentStatus::Online);

        expired.into_iter().map(|(key, _)| key).collect()
    }

    /// Run [`sweep`](Self::sweep) every `every`.
    pub fn spawn_monitor(self: &Arc<Self>, every: Duration) -> JoinHandle<()> {
        let tracker = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let expired = tracker.sweep(Instant::now()).await;
                if !expired.is_empty() {
                    debug!(count = expired.len(), "Presence sweep transitioned agents offline");
                }
            }
        })
    }

    async fn announce(
        &self,
        tenant_id: &str,
        agent_id: &str,
        capabilities: &[String],
        status: AgentStatus,
    ) {
        let Some(protocol) = &self.protocol else {
            return;
        };
        if let Err(e) = protocol
            .announce(tenant_id, agent_id, capabilities, status)
            .await
        {
            warn!(
                tenant_id = %tenant_id,
                agent_id = %agent_id,
                status = %status,
                error = %e,
                "Failed to announce presence"
            );
        }
    }
}
