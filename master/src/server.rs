//! The coordinator's axum surface.
//!
//! - `GET /ws`: slave WebSocket endpoint; the token travels as `?token=`
//!   or in the `Authorization` header and is validated before the upgrade
//! - `GET /health`: liveness probe
//! - `POST /api/token?name=`: find-or-create a node and mint its token

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use xfleet_auth::{Claims, TokenAuthority};
use xfleet_protocol::{AuthPayload, Frame, MessageType};
use xfleet_store::{NodeStatus, Store};

use crate::hub::{Hub, Session};
use crate::sync::SyncEngine;

/// A frame must be read within this window or the connection is torn down.
/// Every inbound frame (including transport pings/pongs) resets it.
const READ_DEADLINE: Duration = Duration::from_secs(60);
/// Per-message write budget.
const WRITE_DEADLINE: Duration = Duration::from_secs(10);
/// Transport-level keepalive period, below the read deadline on both sides.
const PING_PERIOD: Duration = Duration::from_secs(54);

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Store>,
    pub hub: Arc<Hub>,
    pub sync: Arc<SyncEngine>,
    pub auth: Arc<TokenAuthority>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/token", post(generate_token))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Debug, Deserialize)]
struct TokenQuery {
    name: Option<String>,
}

#[derive(Debug, Serialize)]
struct TokenResponse {
    token: String,
    slave_id: i64,
    slave_name: String,
}

async fn generate_token(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> Result<Json<TokenResponse>, (StatusCode, String)> {
    let Some(name) = query.name.filter(|n| !n.is_empty()) else {
        return Err((StatusCode::BAD_REQUEST, "missing name parameter".into()));
    };

    let node = match state
        .store
        .find_node_by_name(&name)
        .map_err(internal_error)?
    {
        Some(node) => node,
        None => {
            let node = state.store.create_node(&name).map_err(internal_error)?;
            info!(node_id = node.id, name = %node.name, "node created");
            node
        }
    };

    let token = state
        .auth
        .generate(node.id, &node.name)
        .map_err(internal_error)?;
    info!(node_id = node.id, name = %node.name, "token issued");
    Ok(Json(TokenResponse {
        token,
        slave_id: node.id,
        slave_name: node.name,
    }))
}

fn internal_error(err: impl std::fmt::Display) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, err.to_string())
}

#[derive(Debug, Deserialize)]
struct WsQuery {
    token: Option<String>,
}

/// Token check happens here, before the upgrade: a bad token is refused
/// with 401 and no state changes.
async fn ws_handler(
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let token = query.token.or_else(|| {
        headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
    });
    let Some(token) = token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    let claims = match state.auth.validate(&token) {
        Ok(claims) => claims,
        Err(err) => {
            warn!(%err, "websocket handshake refused");
            return (StatusCode::UNAUTHORIZED, format!("token rejected: {err}")).into_response();
        }
    };

    info!(
        node_id = claims.slave_id,
        node_name = %claims.slave_name,
        "node connecting"
    );
    ws.on_upgrade(move |socket| handle_socket(state, socket, claims))
}

async fn handle_socket(state: AppState, socket: WebSocket, claims: Claims) {
    let node_id = claims.slave_id;
    if let Err(err) = state.store.update_node_status(node_id, NodeStatus::Online) {
        warn!(node_id, %err, "failed to mark node online");
    }

    let (session, send_queue) = Session::new(node_id);
    state.hub.register(session.clone()).await;

    let _ = session.send(Frame::with_payload(
        MessageType::Auth,
        &AuthPayload::success("authenticated"),
    ));

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_loop(sink, send_queue));
    read_loop(stream, session.clone(), state.clone()).await;

    state.hub.unregister(session.id()).await;
    writer.abort();
    info!(node_id, session_id = %session.id(), "connection closed");
}

/// Sole producer of outbound socket frames for this connection: drains the
/// session's send queue and owns the keepalive timer.
async fn write_loop(
    mut sink: SplitSink<WebSocket, Message>,
    mut send_queue: mpsc::Receiver<Frame>,
) {
    let mut keepalive = tokio::time::interval(PING_PERIOD);
    keepalive.tick().await; // the first tick completes immediately
    loop {
        tokio::select! {
            frame = send_queue.recv() => {
                let Some(frame) = frame else {
                    let _ = sink.send(Message::Close(None)).await;
                    return;
                };
                let write = sink.send(Message::Text(frame.to_json()));
                match tokio::time::timeout(WRITE_DEADLINE, write).await {
                    Ok(Ok(())) => {}
                    Ok(Err(err)) => {
                        debug!(%err, "websocket write failed");
                        return;
                    }
                    Err(_) => {
                        warn!("websocket write deadline exceeded");
                        return;
                    }
                }
            }
            _ = keepalive.tick() => {
                let write = sink.send(Message::Ping(Vec::new()));
                if tokio::time::timeout(WRITE_DEADLINE, write).await.is_err() {
                    warn!("keepalive write deadline exceeded");
                    return;
                }
            }
        }
    }
}

async fn read_loop(mut stream: SplitStream<WebSocket>, session: Session, state: AppState) {
    loop {
        let next = tokio::time::timeout(READ_DEADLINE, stream.next()).await;
        let message = match next {
            Err(_) => {
                warn!(node_id = session.node_id(), "read deadline exceeded");
                return;
            }
            Ok(None) => return,
            Ok(Some(Err(err))) => {
                debug!(node_id = session.node_id(), %err, "websocket read failed");
                return;
            }
            Ok(Some(Ok(message))) => message,
        };

        match message {
            Message::Text(text) => {
                session.touch();
                match Frame::parse(&text) {
                    Ok(frame) => state.sync.handle_frame(&session, frame).await,
                    // drop the offending frame, keep the session
                    Err(err) => warn!(node_id = session.node_id(), %err, "unparseable frame"),
                }
            }
            Message::Ping(_) | Message::Pong(_) => session.touch(),
            Message::Close(_) => return,
            Message::Binary(_) => {
                debug!(node_id = session.node_id(), "ignoring binary frame");
            }
        }
    }
}
