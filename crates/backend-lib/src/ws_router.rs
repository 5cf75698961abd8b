// ============================
// crowdpulse-backend-lib/src/ws_router.rs
// ============================
//! HTTP router and WebSocket connection handling.
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    middleware::from_fn_with_state,
    response::IntoResponse,
    routing::get,
    Extension, Json, Router,
};
use crowdpulse_common::{ClientMessage, Role, ServerMessage, SessionStatus};
use futures_util::{FutureExt, SinkExt, StreamExt};
use metrics::{counter, gauge};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::mpsc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{debug, error, info, warn};

use crate::error::AppError;
use crate::metrics::{WS_ACTIVE, WS_CONNECTION};
use crate::middleware::{rate_limit, ClientIp};
use crate::session::ConnectionHandle;
use crate::validation::sanitize_display_name;
use crate::websocket::WebSocketHandler;
use crate::AppState;

/// Query-time identity of a connection
#[derive(Debug, Default, Deserialize)]
pub struct ConnectParams {
    #[serde(default)]
    pub role: Option<Role>,
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
}

/// Public view of a session, used by the join page
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionSummary {
    pub session_id: String,
    pub code: String,
    pub title: Option<String>,
    pub status: SessionStatus,
    pub participant_count: usize,
    pub presenter_connected: bool,
    pub has_active_activity: bool,
}

/// Create the application router
pub fn create_router(state: Arc<AppState>) -> Router {
    let ws_routes = Router::new()
        .route("/ws", get(ws_handler))
        .route_layer(from_fn_with_state(state.clone(), rate_limit));

    Router::new()
        .merge(ws_routes)
        .route("/health", get(health))
        .route("/api/sessions/{code}", get(session_summary))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn health(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "sessions": state.registry.len(),
    }))
}

async fn session_summary(
    State(state): State<Arc<AppState>>,
    Path(code): Path<String>,
) -> Result<Json<SessionSummary>, AppError> {
    let handle = state
        .registry
        .get_by_code(&code)
        .ok_or(AppError::SessionNotFound)?;
    let snapshot = handle.snapshot().await?;

    Ok(Json(SessionSummary {
        session_id: snapshot.id,
        code: snapshot.code,
        title: snapshot.title,
        status: snapshot.status,
        participant_count: snapshot.participant_count,
        presenter_connected: snapshot.presenter_id.is_some(),
        has_active_activity: snapshot.active_activity.is_some(),
    }))
}

/// Handler for WebSocket connections
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Query(params): Query<ConnectParams>,
    Extension(ClientIp(ip)): Extension<ClientIp>,
) -> impl IntoResponse {
    counter!(WS_CONNECTION).increment(1);

    let role = params.role.unwrap_or_default();
    let name = sanitize_display_name(params.name.as_deref());

    // Upgrade the connection to a WebSocket
    ws.on_upgrade(move |socket| async move {
        let (tx, rx) = mpsc::channel(state.settings.outbound_buffer);
        let connection = ConnectionHandle::new(role, name, ip, tx.clone());
        let handler = WebSocketHandler::new(state, connection);
        handle_connection(socket, handler, tx, rx, params.code).await;
    })
}

/// Run one command, turning errors and panics into a reply
async fn dispatch(handler: &mut WebSocketHandler, msg: ClientMessage) -> Option<ServerMessage> {
    let command = msg.command_name();
    let result = AssertUnwindSafe(handler.handle_message(msg))
        .catch_unwind()
        .await
        .unwrap_or_else(|_| {
            error!(command, "command handler panicked");
            Err(AppError::Internal(format!("{command} failed")))
        });

    match result {
        Ok(reply) => reply,
        Err(e) => {
            debug!(connection_id = %handler.connection_id(), command, "command rejected: {}", e);
            Some(handler.error_message(&e))
        },
    }
}

async fn handle_connection(
    socket: WebSocket,
    mut handler: WebSocketHandler,
    tx: mpsc::Sender<ServerMessage>,
    mut rx: mpsc::Receiver<ServerMessage>,
    code: Option<String>,
) {
    let (mut sink, mut stream) = socket.split();
    gauge!(WS_ACTIVE).increment(1.0);

    let connection_id = handler.connection_id().to_string();
    info!(%connection_id, role = handler.role().as_str(), ip = ?handler.remote_addr(), "connection opened");

    // Forward queued ServerMessages to the WebSocket
    let send_task = tokio::spawn(async move {
        while let Some(server_msg) = rx.recv().await {
            let json = match serde_json::to_string(&server_msg) {
                Ok(json) => json,
                Err(e) => {
                    warn!("failed to serialize server message: {}", e);
                    continue;
                },
            };
            if sink.send(Message::Text(json.into())).await.is_err() {
                break;
            }
        }
    });

    let _ = tx
        .send(ServerMessage::Connected {
            connection_id: connection_id.clone(),
            role: handler.role(),
        })
        .await;

    if let Some(code) = code.filter(|code| !code.trim().is_empty()) {
        let reply = match handler.auto_join(&code).await {
            Ok(reply) => reply,
            Err(e) => handler.error_message(&e),
        };
        let _ = tx.send(reply).await;
    }

    // Process incoming WebSocket messages
    while let Some(Ok(message)) = stream.next().await {
        let reply = match message {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(text.as_str()) {
                Ok(client_msg) => dispatch(&mut handler, client_msg).await,
                Err(e) => Some(handler.error_message(&AppError::InvalidInput(e.to_string()))),
            },
            Message::Close(_) => break,
            _ => None,
        };

        if let Some(reply) = reply {
            if tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    // Cleanup: leave the session when the connection drops
    handler.disconnect().await;
    gauge!(WS_ACTIVE).decrement(1.0);
    info!(%connection_id, "connection closed");

    send_task.abort();
}
