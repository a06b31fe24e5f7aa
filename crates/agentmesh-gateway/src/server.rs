use crate::auth;
use crate::config::GatewayConfig;
use crate::connection::ConnectionManager;
use crate::middleware::{bearer_auth_middleware, rate_limit_middleware, MiddlewareState};
use crate::presence::PresenceTracker;
use crate::router::{MessageRouter, ServerMessage};
use crate::session::{Session, SessionKind};
use agentmesh_broker::MessageBroker;
use agentmesh_core::MeshError;
use agentmesh_protocol::{AgentProtocol, ProtocolConfig};
use agentmesh_security::{
    ChallengeAuthenticator, RateLimiter, SubjectAuthorizer, TokenIssuer, TokenKind,
};
use axum::{
    extract::{
        ws::{CloseFrame, Message, Utf8Bytes, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    middleware as axum_mw,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Close code sent when a socket fails authentication.
pub const POLICY_VIOLATION_CLOSE: u16 = 4001;

/// Shared application state.
pub struct AppState {
    pub connections: Arc<ConnectionManager>,
    pub router: Arc<MessageRouter>,
    pub protocol: Arc<AgentProtocol>,
    pub authenticator: Arc<ChallengeAuthenticator>,
    pub tokens: Arc<TokenIssuer>,
    pub rate_limiter: Arc<RateLimiter>,
}

impl AppState {
    /// Wire the gateway components around one shared broker handle.
    pub fn new(
        config: GatewayConfig,
        broker: Arc<dyn MessageBroker>,
        authorizer: Arc<SubjectAuthorizer>,
        authenticator: Arc<ChallengeAuthenticator>,
        tokens: Arc<TokenIssuer>,
        protocol_config: ProtocolConfig,
    ) -> Arc<Self> {
        let protocol = Arc::new(AgentProtocol::with_config(
            broker.clone(),
            authorizer.clone(),
            protocol_config,
        ));
        let presence = PresenceTracker::new(config.presence_timeout, Some(protocol.clone()));
        let rate_limiter = Arc::new(RateLimiter::new(
            config.max_burst,
            config.max_requests_per_second,
        ));
        let connections = ConnectionManager::new(broker, authorizer, presence, config);
        let router = Arc::new(MessageRouter::new(connections.clone()));

        Arc::new(Self {
            connections,
            router,
            protocol,
            authenticator,
            tokens,
            rate_limiter,
        })
    }
}

/// The main gateway server.
pub struct GatewayServer;

impl GatewayServer {
    pub fn build(state: Arc<AppState>) -> Router {
        let mw_state = Arc::new(MiddlewareState {
            rate_limiter: state.rate_limiter.clone(),
            tokens: state.tokens.clone(),
        });

        let protected = Router::new()
            .route("/auth/challenge", post(auth::issue_challenge))
            .route_layer(axum_mw::from_fn_with_state(
                mw_state.clone(),
                bearer_auth_middleware,
            ));
        let limited = Router::new()
            .route("/auth/agent/challenge", post(auth::issue_agent_challenge))
            .route_layer(axum_mw::from_fn_with_state(mw_state, rate_limit_middleware));

        Router::new()
            .route("/ws/agent/{agent_id}", get(agent_ws_handler))
            .route("/ws/dashboard", get(dashboard_ws_handler))
            .route("/auth/verify", post(auth::verify))
            .route("/health", get(health_handler))
            .merge(protected)
            .merge(limited)
            .with_state(state)
    }

    /// Start the recurring presence sweep and rate-limiter cleanup.
    pub fn spawn_background(state: &Arc<AppState>) -> Vec<JoinHandle<()>> {
        let sweep_every = state.connections.config().presence_sweep;
        let presence = state.connections.presence().spawn_monitor(sweep_every);

        let limiter = state.rate_limiter.clone();
        let cleanup = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            loop {
                ticker.tick().await;
                let removed = limiter.cleanup(Duration::from_secs(600)).await;
                if removed > 0 {
                    debug!(removed, "Idle rate-limit buckets dropped");
                }
            }
        });
        vec![presence, cleanup]
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "agentmesh",
        "sessions": state.connections.session_count().await,
    }))
}

/// Query string of the agent socket endpoint. All fields are optional so a
/// missing one fails authentication with a close code rather than a 400.
#[derive(Debug, Default, Deserialize)]
pub struct AgentConnectParams {
    #[serde(default)]
    pub challenge: Option<String>,
    #[serde(default)]
    pub signature: Option<String>,
    #[serde(default)]
    pub tenant_id: Option<String>,
    /// Defaults to the agent id.
    #[serde(default)]
    pub key_id: Option<String>,
    /// Comma-separated capabilities advertised in presence announcements.
    #[serde(default)]
    pub capabilities: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DashboardConnectParams {
    #[serde(default)]
    pub token: Option<String>,
}

async fn agent_ws_handler(
    ws: WebSocketUpgrade,
    Path(agent_id): Path<String>,
    Query(params): Query<AgentConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_agent_socket(socket, state, agent_id, params))
}

async fn handle_agent_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    agent_id: String,
    params: AgentConnectParams,
) {
    let (Some(challenge), Some(signature), Some(tenant_id)) =
        (params.challenge, params.signature, params.tenant_id)
    else {
        warn!(agent_id = %agent_id, "Agent socket missing credentials");
        reject(socket).await;
        return;
    };
    let key_id = params.key_id.unwrap_or_else(|| agent_id.clone());

    let verified = state
        .authenticator
        .verify(&tenant_id, &key_id, &challenge, &signature, Some(&agent_id))
        .await;
    if !verified {
        reject(socket).await;
        return;
    }

    let capabilities = params
        .capabilities
        .map(|raw| {
            raw.split(',')
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let kind = SessionKind::Agent {
        agent_id,
        capabilities,
    };
    run_session(socket, state, tenant_id, kind, None).await;
}

async fn dashboard_ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<DashboardConnectParams>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_dashboard_socket(socket, state, params))
}

async fn handle_dashboard_socket(
    socket: WebSocket,
    state: Arc<AppState>,
    params: DashboardConnectParams,
) {
    let claims = match params.token.as_deref().map(|t| state.tokens.validate(t)) {
        Some(Ok(claims)) if claims.kind == TokenKind::User => claims,
        Some(Ok(claims)) => {
            warn!(sub = %claims.sub, tenant_id = %claims.tenant_id, "Agent token presented to dashboard socket");
            reject(socket).await;
            return;
        }
        Some(Err(e)) => {
            warn!(error = %e, "Dashboard token rejected");
            reject(socket).await;
            return;
        }
        None => {
            warn!("Dashboard socket missing token");
            reject(socket).await;
            return;
        }
    };

    let welcome = ServerMessage::Connected {
        tenant_id: claims.tenant_id.clone(),
    };
    let kind = SessionKind::Dashboard {
        user_id: claims.sub,
    };
    run_session(socket, state, claims.tenant_id, kind, Some(welcome)).await;
}

/// Close a socket that failed authentication without saying why.
async fn reject(mut socket: WebSocket) {
    let frame = CloseFrame {
        code: POLICY_VIOLATION_CLOSE,
        reason: Utf8Bytes::from_static("Authentication failed"),
    };
    if let Err(e) = socket.send(Message::Close(Some(frame))).await {
        debug!(error = %e, "Failed to send close frame");
    }
}

async fn run_session(
    socket: WebSocket,
    state: Arc<AppState>,
    tenant_id: String,
    kind: SessionKind,
    welcome: Option<ServerMessage>,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    // Channel for sending frames back to the WebSocket
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let session = state
        .connections
        .register(Session::new(tenant_id.clone(), kind, tx))
        .await;
    let session_id = session.id;
    info!(session_id = %session_id, tenant_id = %tenant_id, "WebSocket connected");

    if let Some(welcome) = welcome {
        match welcome.to_text() {
            Ok(frame) => {
                session.send(frame);
            }
            Err(e) => warn!(session_id = %session_id, error = %e, "Failed to encode welcome"),
        }
    }

    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_sender.send(Message::Text(frame.into())).await.is_err() {
                break;
            }
        }
    });

    let router = state.router.clone();
    let reader = session.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(frame) = ws_receiver.next().await {
            match frame {
                Ok(Message::Text(text)) => router.handle_text(&reader, text.as_str()).await,
                Ok(Message::Binary(_)) => {
                    if let Ok(frame) = ServerMessage::error("Binary frames are not supported").to_text() {
                        reader.send(frame);
                    }
                }
                Ok(Message::Close(_)) => return Err(MeshError::ConnectionClosed),
                Ok(_) => {}
                Err(e) => return Err(MeshError::Connection(e.to_string())),
            }
        }
        Ok(())
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        result = &mut recv_task => {
            send_task.abort();
            match result {
                Ok(Err(e)) if e.is_expected_close() => {}
                Ok(Err(e)) => warn!(session_id = %session_id, tenant_id = %tenant_id, error = %e, "WebSocket error"),
                Ok(Ok(())) => {}
                Err(e) if e.is_panic() => error!(session_id = %session_id, "Session reader panicked"),
                Err(_) => {}
            }
        }
    }

    state.connections.teardown(&tenant_id, session_id).await;
    info!(session_id = %session_id, tenant_id = %tenant_id, "WebSocket disconnected");
}
