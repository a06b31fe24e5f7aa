use crate::envelope::{AgentMessage, Identity, MessageType, AGENT_ROOT};
use agentmesh_broker::{Headers, MessageBroker};
use agentmesh_core::subject;
use agentmesh_core::{Action, MeshResult};
use agentmesh_security::SubjectAuthorizer;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Out-of-band header names attached to every envelope sent.
pub mod headers {
    pub const TENANT: &str = "agentmesh-tenant";
    pub const MESSAGE_TYPE: &str = "agentmesh-type";
    pub const SOURCE: &str = "agentmesh-source";
    pub const CORRELATION: &str = "agentmesh-correlation";
    /// Set by the gateway on socket publishes; carries its instance id.
    pub const ORIGIN: &str = "agentmesh-origin";
}

pub const DEFAULT_DISCOVERY_TIMEOUT_MS: u64 = 2000;
pub const DEFAULT_MAX_DISCOVERY_RESULTS: usize = 256;

/// `agents.<tenant>.status`
pub fn status_subject(tenant_id: &str) -> String {
    subject::scoped(AGENT_ROOT, tenant_id, &["status"])
}

/// `agents.<tenant>.discovery.request`
pub fn discovery_request_subject(tenant_id: &str) -> String {
    subject::scoped(AGENT_ROOT, tenant_id, &["discovery", "request"])
}

/// `agents.<tenant>.discovery.reply.<discovery_id>`
pub fn discovery_reply_subject(tenant_id: &str, discovery_id: &str) -> String {
    subject::scoped(AGENT_ROOT, tenant_id, &["discovery", "reply", discovery_id])
}

/// Externally visible agent status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AgentStatus {
    Online,
    Busy,
    Offline,
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AgentStatus::Online => write!(f, "online"),
            AgentStatus::Busy => write!(f, "busy"),
            AgentStatus::Offline => write!(f, "offline"),
        }
    }
}

/// Content of status events and discovery replies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub status: AgentStatus,
}

/// Content of a discovery query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryQuery {
    pub discovery_id: String,
    pub required_capabilities: Vec<String>,
}

/// Knobs for [`AgentProtocol`].
#[derive(Debug, Clone)]
pub struct ProtocolConfig {
    pub discovery_timeout: Duration,
    /// Replies beyond this count are dropped during one discovery window.
    pub max_discovery_results: usize,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            discovery_timeout: Duration::from_millis(DEFAULT_DISCOVERY_TIMEOUT_MS),
            max_discovery_results: DEFAULT_MAX_DISCOVERY_RESULTS,
        }
    }
}

/// The capabilities an envelope advertises: those in an [`Announcement`]
/// body when present, otherwise the source identity's.
pub fn advertised_capabilities(envelope: &AgentMessage) -> Vec<String> {
    serde_json::from_value::<Announcement>(envelope.payload.content.clone())
        .map(|a| a.capabilities)
        .unwrap_or_else(|_| envelope.source.capabilities.clone())
}

/// `true` if `offered` contains every entry of `required`.
pub fn is_superset(offered: &[String], required: &[String]) -> bool {
    let offered: HashSet<&str> = offered.iter().map(String::as_str).collect();
    required.iter().all(|c| offered.contains(c.as_str()))
}

/// Sends envelopes through the broker and runs announcement and discovery
/// exchanges on top of it. Every publish is authorized for the envelope's
/// tenant first.
pub struct AgentProtocol {
    broker: Arc<dyn MessageBroker>,
    authorizer: Arc<SubjectAuthorizer>,
    config: ProtocolConfig,
}

impl AgentProtocol {
    pub fn new(broker: Arc<dyn MessageBroker>, authorizer: Arc<SubjectAuthorizer>) -> Self {
        Self::with_config(broker, authorizer, ProtocolConfig::default())
    }

    pub fn with_config(
        broker: Arc<dyn MessageBroker>,
        authorizer: Arc<SubjectAuthorizer>,
        config: ProtocolConfig,
    ) -> Self {
        Self {
            broker,
            authorizer,
            config,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    pub fn broker(&self) -> &Arc<dyn MessageBroker> {
        &self.broker
    }

    pub fn authorizer(&self) -> &Arc<SubjectAuthorizer> {
        &self.authorizer
    }

    /// Publish `envelope` on `subject`, or on its derived subject when `None`.
    /// Returns the subject used.
    pub async fn send(&self, envelope: &AgentMessage, subject: Option<&str>) -> MeshResult<String> {
        let subject = subject
            .map(str::to_string)
            .unwrap_or_else(|| envelope.to_subject());
        self.authorizer
            .validate(envelope.tenant_id(), &subject, Action::Publish)?;

        let mut meta = Headers::new();
        meta.insert(headers::TENANT.into(), envelope.tenant_id().to_string());
        meta.insert(
            headers::MESSAGE_TYPE.into(),
            envelope.message_type.as_str().to_string(),
        );
        meta.insert(headers::SOURCE.into(), envelope.source.id.clone());
        if let Some(correlation) = &envelope.correlation_id {
            meta.insert(headers::CORRELATION.into(), correlation.clone());
        }

        self.broker
            .publish(&subject, meta, envelope.to_bytes()?)
            .await?;
        debug!(
            subject = %subject,
            message_id = %envelope.id,
            message_type = envelope.message_type.as_str(),
            "Agent message sent"
        );
        Ok(subject)
    }

    /// Answer `original` with a `result` envelope, published on its
    /// `reply_to` when set.
    pub async fn respond(
        &self,
        original: &AgentMessage,
        responder: Identity,
        content: serde_json::Value,
        success: bool,
    ) -> MeshResult<String> {
        let response = original.create_response(responder, content, success);
        let subject = original.response_subject(&response);
        self.send(&response, Some(&subject)).await
    }

    /// Publish an `event` describing an agent's capabilities and status on
    /// the tenant status subject.
    pub async fn announce(
        &self,
        tenant_id: &str,
        agent_id: &str,
        capabilities: &[String],
        status: AgentStatus,
    ) -> MeshResult<()> {
        let envelope = status_event(tenant_id, agent_id, capabilities, status)?;
        self.send(&envelope, Some(&status_subject(tenant_id))).await?;
        info!(tenant_id = %tenant_id, agent_id = %agent_id, status = %status, "Agent status announced");
        Ok(())
    }

    /// Ask every responder in the tenant for agents offering all of
    /// `required_capabilities`.
    ///
    /// Always waits the whole `timeout` (the configured default when `None`);
    /// an empty list is a normal outcome.
    pub async fn discover(
        &self,
        tenant_id: &str,
        required_capabilities: &[String],
        timeout: Option<Duration>,
    ) -> MeshResult<Vec<AgentMessage>> {
        let timeout = timeout.unwrap_or(self.config.discovery_timeout);
        let discovery_id = Uuid::new_v4().to_string();
        let reply_subject = discovery_reply_subject(tenant_id, &discovery_id);
        self.authorizer
            .validate(tenant_id, &reply_subject, Action::Subscribe)?;

        let deadline = Instant::now() + timeout;
        let mut subscription = self.broker.subscribe(&reply_subject).await?;

        let query = AgentMessage::new(
            MessageType::Query,
            Identity::service(format!("discovery-{discovery_id}"), tenant_id),
            serde_json::to_value(DiscoveryQuery {
                discovery_id: discovery_id.clone(),
                required_capabilities: required_capabilities.to_vec(),
            })?,
        )
        .with_capabilities(required_capabilities.to_vec())
        .with_reply_to(reply_subject.clone())
        .with_timeout(timeout.as_millis() as u64);

        if let Err(e) = self
            .send(&query, Some(&discovery_request_subject(tenant_id)))
            .await
        {
            self.cancel(subscription.id).await;
            return Err(e);
        }

        // Only distinct, matching responders count toward the cap, so stray
        // or repeated replies cannot crowd out a real one.
        let mut matching: Vec<AgentMessage> = Vec::new();
        let mut seen: HashSet<String> = HashSet::new();
        let (mut rejected, mut duplicates, mut dropped) = (0usize, 0usize, 0usize);
        let mut open = true;
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(deadline) => break,
                delivery = subscription.receiver.recv(), if open => {
                    let Some(delivery) = delivery else {
                        // Broker side gone; keep the window, nothing more will arrive.
                        open = false;
                        continue;
                    };
                    let reply = match AgentMessage::from_bytes(&delivery.payload) {
                        Ok(reply) => reply,
                        Err(e) => {
                            warn!(subject = %delivery.subject, error = %e, "Discarding undecodable discovery reply");
                            continue;
                        }
                    };
                    if reply.message_type != MessageType::Result
                        || reply.correlation_id.as_deref() != Some(query.id.as_str())
                    {
                        continue;
                    }
                    if !is_superset(&advertised_capabilities(&reply), required_capabilities) {
                        rejected += 1;
                        continue;
                    }
                    if seen.contains(&reply.source.id) {
                        duplicates += 1;
                        continue;
                    }
                    if matching.len() >= self.config.max_discovery_results {
                        dropped += 1;
                        continue;
                    }
                    seen.insert(reply.source.id.clone());
                    matching.push(reply);
                }
            }
        }
        self.cancel(subscription.id).await;

        info!(
            tenant_id = %tenant_id,
            discovery_id = %discovery_id,
            matched = matching.len(),
            rejected,
            duplicates,
            dropped,
            "Discovery window closed"
        );
        Ok(matching)
    }

    async fn cancel(&self, id: agentmesh_broker::SubscriptionId) {
        if let Err(e) = self.broker.unsubscribe(id).await {
            warn!(subscription = id, error = %e, "Failed to cancel discovery subscription");
        }
    }
}

fn status_event(
    tenant_id: &str,
    agent_id: &str,
    capabilities: &[String],
    status: AgentStatus,
) -> MeshResult<AgentMessage> {
    let content = serde_json::to_value(Announcement {
        agent_id: agent_id.to_string(),
        capabilities: capabilities.to_vec(),
        status,
    })?;
    Ok(AgentMessage::new(
        MessageType::Event,
        Identity::agent(agent_id, tenant_id, capabilities.to_vec()),
        content,
    ))
}
