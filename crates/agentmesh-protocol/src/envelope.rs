use agentmesh_core::subject;
use agentmesh_core::{MeshError, MeshResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

/// Root of the agent-protocol subject namespace.
pub const AGENT_ROOT: &str = "agents";
/// Envelope schema version.
pub const PROTOCOL_VERSION: &str = "1.0";
/// Priority given to envelopes that don't set one.
pub const DEFAULT_PRIORITY: u8 = 5;
/// Highest allowed priority.
pub const MAX_PRIORITY: u8 = 9;

const GENERAL: &str = "general";

/// Kind of agent message; decides the subject it routes on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    Task,
    Result,
    Event,
    Query,
    Stream,
    Command,
    Heartbeat,
    Negotiation,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Task => "task",
            MessageType::Result => "result",
            MessageType::Event => "event",
            MessageType::Query => "query",
            MessageType::Stream => "stream",
            MessageType::Command => "command",
            MessageType::Heartbeat => "heartbeat",
            MessageType::Negotiation => "negotiation",
        }
    }
}

/// Who sent an envelope.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Identity {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub tenant_id: String,
    #[serde(default)]
    pub capabilities: Vec<String>,
}

impl Identity {
    pub fn agent(id: impl Into<String>, tenant_id: impl Into<String>, capabilities: Vec<String>) -> Self {
        Self {
            id: id.into(),
            kind: "agent".to_string(),
            tenant_id: tenant_id.into(),
            capabilities,
        }
    }

    pub fn service(id: impl Into<String>, tenant_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            kind: "service".to_string(),
            tenant_id: tenant_id.into(),
            capabilities: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MessageContext {
    pub conversation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_message_id: Option<String>,
    #[serde(default)]
    pub history: Vec<serde_json::Value>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl MessageContext {
    fn fresh() -> Self {
        Self {
            conversation_id: Uuid::new_v4().to_string(),
            parent_message_id: None,
            history: Vec::new(),
            metadata: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    pub content: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Routing {
    /// 0 to 9; larger wire values are clamped to 9.
    #[serde(default = "default_priority", deserialize_with = "clamped_priority")]
    pub priority: u8,
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default)]
    pub exclusions: Vec<String>,
    /// Milliseconds the sender is willing to wait for an answer.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_group: Option<String>,
}

fn default_priority() -> u8 {
    DEFAULT_PRIORITY
}

fn clamped_priority<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    Ok(u8::deserialize(deserializer)?.min(MAX_PRIORITY))
}

impl Default for Routing {
    fn default() -> Self {
        Self {
            priority: DEFAULT_PRIORITY,
            capabilities: Vec::new(),
            exclusions: Vec::new(),
            timeout: None,
            queue_group: None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamMetadata {
    pub sequence_number: u64,
    pub is_first: bool,
    pub is_final: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_expected: Option<u64>,
}

/// The structured inter-agent message.
///
/// Built once through [`AgentMessage::new`] and the consuming `with_*`
/// methods; a reply is a new envelope from [`AgentMessage::create_response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentMessage {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
    #[serde(rename = "type")]
    pub message_type: MessageType,
    pub source: Identity,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub context: MessageContext,
    pub payload: Payload,
    #[serde(default)]
    pub routing: Routing,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stream_metadata: Option<StreamMetadata>,
}

impl AgentMessage {
    pub fn new(message_type: MessageType, source: Identity, content: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            version: PROTOCOL_VERSION.to_string(),
            message_type,
            source,
            target: None,
            reply_to: None,
            correlation_id: None,
            context: MessageContext::fresh(),
            payload: Payload {
                content,
                model: None,
                parameters: None,
                constraints: None,
            },
            routing: Routing::default(),
            stream_metadata: None,
        }
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.target = Some(target.into());
        self
    }

    pub fn with_reply_to(mut self, subject: impl Into<String>) -> Self {
        self.reply_to = Some(subject.into());
        self
    }

    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    pub fn with_capabilities(mut self, capabilities: Vec<String>) -> Self {
        self.routing.capabilities = capabilities;
        self
    }

    pub fn with_exclusions(mut self, exclusions: Vec<String>) -> Self {
        self.routing.exclusions = exclusions;
        self
    }

    /// Priority is clamped to `0..=9`.
    pub fn with_priority(mut self, priority: u8) -> Self {
        self.routing.priority = priority.min(MAX_PRIORITY);
        self
    }

    pub fn with_timeout(mut self, timeout_ms: u64) -> Self {
        self.routing.timeout = Some(timeout_ms);
        self
    }

    pub fn with_queue_group(mut self, group: impl Into<String>) -> Self {
        self.routing.queue_group = Some(group.into());
        self
    }

    pub fn with_context(mut self, context: MessageContext) -> Self {
        self.context = context;
        self
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.payload.model = Some(model.into());
        self
    }

    pub fn with_parameters(mut self, parameters: serde_json::Value) -> Self {
        self.payload.parameters = Some(parameters);
        self
    }

    pub fn with_constraints(mut self, constraints: serde_json::Value) -> Self {
        self.payload.constraints = Some(constraints);
        self
    }

    /// Mark as one chunk of a stream.
    pub fn with_stream(mut self, sequence_number: u64, is_final: bool, total_expected: Option<u64>) -> Self {
        self.stream_metadata = Some(StreamMetadata {
            sequence_number,
            is_first: sequence_number == 0,
            is_final,
            total_expected,
        });
        self
    }

    pub fn tenant_id(&self) -> &str {
        &self.source.tenant_id
    }

    /// The subject this envelope routes on, rooted at `agents.<tenant>`.
    pub fn to_subject(&self) -> String {
        let tenant = self.tenant_id();
        let first_capability = self
            .routing
            .capabilities
            .first()
            .map(String::as_str)
            .unwrap_or(GENERAL);
        let correlation = self.correlation_id.as_deref().unwrap_or(&self.id);

        match self.message_type {
            MessageType::Task => subject::scoped(AGENT_ROOT, tenant, &["tasks", first_capability]),
            MessageType::Result => subject::scoped(AGENT_ROOT, tenant, &["results", &self.source.id]),
            MessageType::Stream => subject::scoped(AGENT_ROOT, tenant, &["streams", correlation]),
            MessageType::Event => subject::scoped(AGENT_ROOT, tenant, &["events", &self.source.id]),
            MessageType::Query => subject::scoped(AGENT_ROOT, tenant, &["queries", first_capability]),
            MessageType::Command => {
                let target = self.target.as_deref().unwrap_or(&self.source.id);
                subject::scoped(AGENT_ROOT, tenant, &["commands", target])
            }
            MessageType::Heartbeat => subject::scoped(AGENT_ROOT, tenant, &["heartbeat", &self.source.id]),
            MessageType::Negotiation => subject::scoped(AGENT_ROOT, tenant, &["negotiation", correlation]),
        }
    }

    /// Build the `result` envelope answering this one.
    ///
    /// The response correlates to `self.id`, keeps the conversation context
    /// and priority, and targets the original sender.
    pub fn create_response(
        &self,
        responder: Identity,
        content: serde_json::Value,
        success: bool,
    ) -> AgentMessage {
        let mut response = AgentMessage::new(MessageType::Result, responder, content)
            .with_correlation_id(self.id.clone())
            .with_context(self.context.clone())
            .with_priority(self.routing.priority)
            .with_parameters(serde_json::json!({ "success": success }))
            .with_target(self.source.id.clone());
        response.context.parent_message_id = Some(self.id.clone());
        response
    }

    /// Where a response to this envelope should be published.
    pub fn response_subject(&self, response: &AgentMessage) -> String {
        self.reply_to
            .clone()
            .unwrap_or_else(|| response.to_subject())
    }

    /// Whether the response reported success.
    pub fn is_success(&self) -> bool {
        self.payload
            .parameters
            .as_ref()
            .and_then(|p| p.get("success"))
            .and_then(serde_json::Value::as_bool)
            .unwrap_or(true)
    }

    pub fn to_bytes(&self) -> MeshResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> MeshResult<Self> {
        serde_json::from_slice(bytes)
            .map_err(|e| MeshError::MessageDecode(format!("Invalid agent message: {e}")))
    }
}
