//! WebSocket streaming surface
//!
//! `GET /v1/ws/party/{party_id}?token=...` upgrades into a session channel
//! attachment: the server pushes `{event, data, seq}` frames and answers
//! `{"type":"ping"}` with a `pong` frame.

use crate::channel::manager::SessionChannelManager;
use crate::error::MatchmakingError;
use crate::types::PartyId;
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use serde::Deserialize;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// WebSocket close codes mirrored from the HTTP error kinds
const CLOSE_UNAUTHENTICATED: u16 = 4001;
const CLOSE_FORBIDDEN: u16 = 4003;
const CLOSE_NOT_FOUND: u16 = 4004;

#[derive(Debug, Deserialize)]
struct WsAuth {
    token: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ClientMessage {
    #[serde(rename = "type")]
    kind: String,
}

/// Build the streaming router.
pub fn router(manager: Arc<SessionChannelManager>) -> Router {
    Router::new()
        .route("/v1/ws/party/:party_id", get(ws_handler))
        .with_state(manager)
}

/// Serve the streaming surface until the shutdown signal fires.
pub async fn serve(
    manager: Arc<SessionChannelManager>,
    addr: SocketAddr,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<()> {
    let app = router(manager);
    let listener = TcpListener::bind(addr)
        .await
        .context("failed to bind streaming listener")?;

    info!("Streaming surface listening on ws://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
            info!("Streaming surface shutdown signal received");
        })
        .await
        .context("streaming server failed")
}

async fn ws_handler(
    State(manager): State<Arc<SessionChannelManager>>,
    Path(party_id): Path<PartyId>,
    Query(auth): Query<WsAuth>,
    ws: WebSocketUpgrade,
) -> Response {
    let Some(token) = auth.token else {
        return (StatusCode::UNAUTHORIZED, "missing token").into_response();
    };

    ws.on_upgrade(move |socket| handle_socket(manager, socket, party_id, token))
}

/// Per-connection task: attach, pump frames both ways, detach.
async fn handle_socket(
    manager: Arc<SessionChannelManager>,
    mut socket: WebSocket,
    party_id: PartyId,
    token: String,
) {
    let mut handle = match manager.attach(party_id, &token).await {
        Ok(handle) => handle,
        Err(e) => {
            let (code, reason) = close_frame_for(&e);
            debug!("Rejecting ws attach to party {}: {}", party_id, e);
            let _ = socket
                .send(Message::Close(Some(CloseFrame {
                    code,
                    reason: reason.into(),
                })))
                .await;
            return;
        }
    };

    loop {
        tokio::select! {
            maybe_frame = handle.rx.recv() => {
                match maybe_frame {
                    Some(frame) => {
                        let Ok(json) = serde_json::to_string(&frame) else {
                            continue;
                        };
                        if socket.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                    // Manager dropped us (backpressure, idle sweep, or
                    // channel destruction)
                    None => {
                        let _ = socket
                            .send(Message::Close(Some(CloseFrame {
                                code: 1001,
                                reason: "channel closed".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
            maybe_msg = socket.recv() => {
                match maybe_msg {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(message) if message.kind == "ping" => {
                                manager.record_ping(party_id);
                                manager.pong(party_id, handle.client_id);
                            }
                            Ok(message) => {
                                manager.send_error(
                                    party_id,
                                    handle.client_id,
                                    "bad_request",
                                    &format!("unsupported message type: {}", message.kind),
                                );
                            }
                            Err(e) => {
                                warn!("Invalid client frame on party {}: {}", party_id, e);
                                manager.send_error(
                                    party_id,
                                    handle.client_id,
                                    "bad_request",
                                    "frames must be JSON objects with a type field",
                                );
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(_)) => break,
                    _ => continue,
                }
            }
        }
    }

    manager.detach(party_id, handle.client_id);
    debug!("Connection to party {} closed", party_id);
}

fn close_frame_for(error: &anyhow::Error) -> (u16, &'static str) {
    match error.downcast_ref::<MatchmakingError>() {
        Some(MatchmakingError::Unauthenticated { .. }) => {
            (CLOSE_UNAUTHENTICATED, "invalid or expired token")
        }
        Some(MatchmakingError::Forbidden { .. }) => {
            (CLOSE_FORBIDDEN, "not a member of this party")
        }
        Some(MatchmakingError::NotFound { .. }) => (CLOSE_NOT_FOUND, "party not found"),
        _ => (1011, "internal error"),
    }
}
