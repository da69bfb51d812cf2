//! WebSocket connection handling
//!
//! One task per connection. RPC responses are written inline; subscription
//! pushes arrive over a per-connection channel and are interleaved with them.

use crate::auth::ResolvedAuth;
use crate::rpc::{self, ConnectionContext};
use crate::service::MachineService;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use nodeplane_core::{EventMessage, IncomingMessage, RpcResponse};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const PUSH_BUFFER: usize = 256;

/// Shared state for WebSocket connections.
pub struct WsState {
    pub auth: ResolvedAuth,
    pub service: Arc<MachineService>,
    pub started_at: std::time::Instant,
}

fn encode<T: Serialize>(message: &T) -> Option<String> {
    match serde_json::to_string(message) {
        Ok(json) => Some(json),
        Err(e) => {
            warn!("failed to encode outgoing message: {}", e);
            None
        }
    }
}

pub async fn handle_connection(socket: WebSocket, state: Arc<WsState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (push_tx, mut push_rx) = mpsc::channel::<EventMessage>(PUSH_BUFFER);
    let cancel = CancellationToken::new();
    let _subscriptions = cancel.clone().drop_guard();

    let info_event = EventMessage::info(env!("CARGO_PKG_VERSION"), state.service.mode().as_str());
    if let Some(json) = encode(&info_event) {
        if ws_tx.send(WsMessage::Text(json)).await.is_err() {
            return;
        }
    }

    let mut ctx = ConnectionContext {
        authenticated: state.auth.open(),
        service: state.service.clone(),
        pushes: push_tx,
        cancel,
    };

    loop {
        tokio::select! {
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(WsMessage::Text(text))) => {
                        let Some(reply) = handle_text_message(&text, &state, &mut ctx).await else {
                            continue;
                        };
                        if ws_tx.send(WsMessage::Text(reply)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(WsMessage::Ping(_))) => {
                        if let Some(json) = encode(&EventMessage::pong()) {
                            let _ = ws_tx.send(WsMessage::Text(json)).await;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) => {
                        info!("client disconnected");
                        return;
                    }
                    Some(Err(e)) => {
                        warn!("websocket error: {}", e);
                        return;
                    }
                    None => return,
                    _ => {}
                }
            }

            Some(push) = push_rx.recv() => {
                if let Some(json) = encode(&push) {
                    if ws_tx.send(WsMessage::Text(json)).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

/// Handle one text frame. Returns the reply to send, if any.
async fn handle_text_message(
    text: &str,
    state: &Arc<WsState>,
    ctx: &mut ConnectionContext,
) -> Option<String> {
    match serde_json::from_str::<IncomingMessage>(text) {
        Ok(IncomingMessage::Rpc(req)) if req.method == "auth" => {
            let reply = match state.auth.verify_token(req.params["token"].as_str()) {
                Ok(()) => {
                    ctx.authenticated = true;
                    info!("client authenticated (rpc)");
                    RpcResponse::ok(&req.id, serde_json::json!({ "ok": true }))
                }
                Err(e) => {
                    warn!("auth failed: {}", e);
                    RpcResponse::auth_error(&req.id, e.to_string())
                }
            };
            encode(&reply)
        }

        Ok(IncomingMessage::Rpc(req)) => {
            debug!(id = %req.id, method = %req.method, "rpc");
            let result = rpc::route_rpc(&req.method, req.params, ctx).await;
            encode(&rpc::to_response(&req.id, result))
        }

        Ok(IncomingMessage::Auth { token }) => {
            let reply = match state.auth.verify_token(token.as_deref()) {
                Ok(()) => {
                    ctx.authenticated = true;
                    info!("client authenticated (shorthand)");
                    EventMessage::auth_result(true, None)
                }
                Err(e) => {
                    warn!("auth failed: {}", e);
                    EventMessage::auth_result(false, Some(&e.to_string()))
                }
            };
            encode(&reply)
        }

        Err(_) => {
            let preview: String = text.chars().take(100).collect();
            warn!("unparseable message: {}", preview);
            None
        }
    }
}
