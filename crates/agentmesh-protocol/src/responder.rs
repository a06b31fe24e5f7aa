use crate::client::{
    discovery_request_subject, is_superset, AgentProtocol, AgentStatus, Announcement,
    DiscoveryQuery,
};
use crate::envelope::{AgentMessage, Identity, MessageType};
use agentmesh_broker::SubscriptionId;
use agentmesh_core::{Action, MeshResult};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Answers discovery queries on behalf of one agent.
///
/// Holds a single subscription on the tenant's discovery-request subject and
/// replies to a query only when the agent offers every requested capability.
pub struct DiscoveryResponder {
    protocol: Arc<AgentProtocol>,
    subscription_id: SubscriptionId,
    handle: JoinHandle<()>,
}

impl DiscoveryResponder {
    pub async fn spawn(
        protocol: Arc<AgentProtocol>,
        tenant_id: &str,
        agent_id: &str,
        capabilities: Vec<String>,
    ) -> MeshResult<Self> {
        let subject = discovery_request_subject(tenant_id);
        protocol
            .authorizer()
            .validate(tenant_id, &subject, Action::Subscribe)?;
        let mut subscription = protocol.broker().subscribe(&subject).await?;
        let subscription_id = subscription.id;

        let identity = Identity::agent(agent_id, tenant_id, capabilities);
        let task_protocol = protocol.clone();
        let handle = tokio::spawn(async move {
            while let Some(delivery) = subscription.receiver.recv().await {
                let query = match AgentMessage::from_bytes(&delivery.payload) {
                    Ok(query) => query,
                    Err(e) => {
                        warn!(agent_id = %identity.id, error = %e, "Ignoring malformed discovery request");
                        continue;
                    }
                };
                if let Err(e) = answer(&task_protocol, &identity, &query).await {
                    warn!(
                        agent_id = %identity.id,
                        query_id = %query.id,
                        error = %e,
                        "Failed to answer discovery request"
                    );
                }
            }
            debug!(agent_id = %identity.id, "Discovery responder stopped");
        });

        info!(tenant_id = %tenant_id, agent_id = %agent_id, "Discovery responder started");
        Ok(Self {
            protocol,
            subscription_id,
            handle,
        })
    }

    /// Cancel the subscription and stop answering.
    pub async fn stop(self) {
        if let Err(e) = self.protocol.broker().unsubscribe(self.subscription_id).await {
            warn!(subscription = self.subscription_id, error = %e, "Failed to cancel discovery responder");
        }
        self.handle.abort();
    }
}

async fn answer(
    protocol: &AgentProtocol,
    identity: &Identity,
    query: &AgentMessage,
) -> MeshResult<()> {
    if query.message_type != MessageType::Query {
        return Ok(());
    }
    let Some(reply_to) = query.reply_to.as_deref() else {
        return Ok(());
    };
    let required = serde_json::from_value::<DiscoveryQuery>(query.payload.content.clone())
        .map(|q| q.required_capabilities)
        .unwrap_or_else(|_| query.routing.capabilities.clone());
    if !is_superset(&identity.capabilities, &required) {
        return Ok(());
    }

    let content = serde_json::to_value(Announcement {
        agent_id: identity.id.clone(),
        capabilities: identity.capabilities.clone(),
        status: AgentStatus::Online,
    })?;
    let response = query.create_response(identity.clone(), content, true);
    protocol.send(&response, Some(reply_to)).await?;
    debug!(agent_id = %identity.id, query_id = %query.id, "Discovery request answered");
    Ok(())
}
