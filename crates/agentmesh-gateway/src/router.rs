use crate::connection::ConnectionManager;
use crate::session::Session;
use agentmesh_core::{MeshError, MeshResult};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

const KNOWN_TYPES: &[&str] = &["subscribe", "unsubscribe", "publish", "ping"];

/// A frame a client sends over its socket.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Subscribe {
        #[serde(alias = "topic")]
        subject: String,
    },
    Unsubscribe {
        #[serde(alias = "topic")]
        subject: String,
    },
    Publish {
        #[serde(alias = "topic")]
        subject: String,
        #[serde(default)]
        data: Value,
        #[serde(default)]
        id: Option<Value>,
    },
    Ping,
}

/// A frame the gateway sends to a client.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage {
    Connected {
        tenant_id: String,
    },
    Subscribed {
        subject: String,
    },
    Unsubscribed {
        subject: String,
    },
    Message {
        subject: String,
        data: Value,
        timestamp: String,
    },
    Ack {
        id: Value,
        status: &'static str,
    },
    Pong {
        timestamp: String,
    },
    Error {
        error: String,
    },
}

impl ServerMessage {
    pub fn error(error: impl Into<String>) -> Self {
        ServerMessage::Error {
            error: error.into(),
        }
    }

    pub fn to_text(&self) -> MeshResult<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Decode one client frame. `Ok(None)` for a well-formed frame of a type
/// the gateway doesn't handle.
pub fn parse_client_message(text: &str) -> MeshResult<Option<ClientMessage>> {
    let value: Value = serde_json::from_str(text)
        .map_err(|e| MeshError::MessageDecode(format!("Invalid JSON: {e}")))?;
    let Some(kind) = value.get("type").and_then(Value::as_str) else {
        return Err(MeshError::MessageDecode(
            "Missing message type".into(),
        ));
    };
    if !KNOWN_TYPES.contains(&kind) {
        warn!(message_type = %kind, "Ignoring unknown message type");
        return Ok(None);
    }
    serde_json::from_value(value)
        .map(Some)
        .map_err(|e| MeshError::MessageDecode(e.to_string()))
}

/// Applies client frames to the connection manager and answers on the
/// session's socket.
pub struct MessageRouter {
    connections: Arc<ConnectionManager>,
}

impl MessageRouter {
    pub fn new(connections: Arc<ConnectionManager>) -> Self {
        Self { connections }
    }

    /// Handle one text frame. Errors are reported to the client as `error`
    /// frames; the socket stays open.
    pub async fn handle_text(&self, session: &Arc<Session>, text: &str) {
        let reply = match parse_client_message(text) {
            Ok(Some(message)) => self.dispatch(session, message).await,
            Ok(None) => Ok(None),
            Err(e) => {
                warn!(session_id = %session.id, error = %e, "Malformed client message");
                Err(e)
            }
        };

        let reply = match reply {
            Ok(Some(reply)) => reply,
            Ok(None) => return,
            Err(e) => ServerMessage::error(client_error(&e)),
        };
        match reply.to_text() {
            Ok(frame) => {
                session.send(frame);
            }
            Err(e) => warn!(session_id = %session.id, error = %e, "Failed to encode reply"),
        }
    }

    async fn dispatch(
        &self,
        session: &Arc<Session>,
        message: ClientMessage,
    ) -> MeshResult<Option<ServerMessage>> {
        match message {
            ClientMessage::Subscribe { subject } => {
                if session.is_dashboard() {
                    Ok(self
                        .connections
                        .subscribe_dashboard(session, &subject)
                        .await?
                        .map(|subject| ServerMessage::Subscribed { subject }))
                } else {
                    let subject = self.connections.subscribe(session, &subject).await?;
                    Ok(Some(ServerMessage::Subscribed { subject }))
                }
            }
            ClientMessage::Unsubscribe { subject } => {
                match self.connections.unsubscribe(session, &subject).await? {
                    Some(subject) => Ok(Some(ServerMessage::Unsubscribed { subject })),
                    None => Ok(Some(ServerMessage::error(format!(
                        "Not subscribed to '{subject}'"
                    )))),
                }
            }
            ClientMessage::Publish { subject, data, id } => {
                self.connections.publish(session, &subject, data).await?;
                Ok(id.map(|id| ServerMessage::Ack {
                    id,
                    status: "published",
                }))
            }
            ClientMessage::Ping => {
                self.connections.touch(session).await;
                debug!(session_id = %session.id, "Ping");
                Ok(Some(ServerMessage::Pong {
                    timestamp: Utc::now().to_rfc3339(),
                }))
            }
        }
    }
}

/// What a client is told about a failure; internal detail stays in logs.
fn client_error(error: &MeshError) -> String {
    match error {
        MeshError::AuthorizationDenied { .. } | MeshError::MessageDecode(_) => error.to_string(),
        MeshError::ConnectionClosed => "Session closed".to_string(),
        other => {
            warn!(error = %other, "Request failed");
            "Request failed".to_string()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_messages() {
        let msg = parse_client_message(r#"{"type":"subscribe","subject":"orders"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { subject } if subject == "orders"));

        let msg = parse_client_message(r#"{"type":"subscribe","topic":"channels.x"}"#)
            .unwrap()
            .unwrap();
        assert!(matches!(msg, ClientMessage::Subscribe { subject } if subject == "channels.x"));

        let msg = parse_client_message(r#"{"type":"publish","subject":"s","id":7}"#)
            .unwrap()
            .unwrap();
        match msg {
            ClientMessage::Publish { data, id, .. } => {
                assert!(data.is_null());
                assert_eq!(id, Some(serde_json::json!(7)));
            }
            other => panic!("unexpected {other:?}"),
        }

        assert!(matches!(
            parse_client_message(r#"{"type":"ping"}"#).unwrap(),
            Some(ClientMessage::Ping)
        ));
    }

    #[test]
    fn test_unknown_type_is_ignored() {
        assert!(parse_client_message(r#"{"type":"dance"}"#).unwrap().is_none());
    }

    #[test]
    fn test_malformed_frames_are_errors() {
        for raw in ["not json", r#"{"subject":"x"}"#, r#"{"type":"subscribe"}"#, "[1,2]"] {
            let err = parse_client_message(raw).unwrap_err();
            assert!(matches!(err, MeshError::MessageDecode(_)), "{raw}");
        }
    }

    #[test]
    fn test_server_frames() {
        let ack = ServerMessage::Ack {
            id: serde_json::json!("m1"),
            status: "published",
        };
        let value: Value = serde_json::from_str(&ack.to_text().unwrap()).unwrap();
        assert_eq!(value, serde_json::json!({"type": "ack", "id": "m1", "status": "published"}));

        let err: Value =
            serde_json::from_str(&ServerMessage::error("nope").to_text().unwrap()).unwrap();
        assert_eq!(err, serde_json::json!({"type": "error", "error": "nope"}));
    }

    #[test]
    fn test_client_error_hides_internals() {
        assert_eq!(client_error(&MeshError::Broker("socket reset".into())), "Request failed");
        let denied = MeshError::denied("T1", "tenant.T2.x", agentmesh_core::Action::Publish);
        assert!(client_error(&denied).contains("tenant.T2.x"));
    }
}
