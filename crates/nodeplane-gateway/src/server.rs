//! Control API server: WebSocket RPC on `/ws`, status on `/health`.

use crate::auth::{ResolvedAuth, TOKEN_ENV};
use crate::service::MachineService;
use crate::ws::{handle_connection, WsState};
use axum::{
    extract::{State, WebSocketUpgrade},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use nodeplane_core::GatewayConfig;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub fn router(state: Arc<WsState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve on an already bound listener until `cancel` fires.
pub async fn serve(
    listener: TcpListener,
    state: Arc<WsState>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move { cancel.cancelled().await })
        .await?;
    Ok(())
}

pub async fn start_gateway(
    config: &GatewayConfig,
    service: Arc<MachineService>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let auth = ResolvedAuth::from_config(&config.auth, std::env::var(TOKEN_ENV).ok());
    let state = Arc::new(WsState {
        auth,
        service: service.clone(),
        started_at: std::time::Instant::now(),
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.bind.to_addr(), config.port).parse()?;
    let listener = TcpListener::bind(&bind_addr).await?;

    info!("machined v{} starting", env!("CARGO_PKG_VERSION"));
    info!("  Listening on: {}", listener.local_addr()?);
    info!("  WebSocket: ws://{}/ws", bind_addr);
    info!("  Auth mode: {:?}", config.auth.mode);
    info!("  Platform mode: {}", service.mode());

    serve(listener, state, cancel).await
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<WsState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

async fn health_handler(State(state): State<Arc<WsState>>) -> impl IntoResponse {
    let service = &state.service;
    let (stage, ready) = match service.events().last_status() {
        Some((stage, ready)) => (Some(stage), ready),
        None => (None, false),
    };
    Json(serde_json::json!({
        "status": if ready { "healthy" } else { "degraded" },
        "version": env!("CARGO_PKG_VERSION"),
        "mode": service.mode(),
        "stage": stage,
        "boot_id": service.dispatcher().boot_id(),
        "sequences_in_flight": service.dispatcher().in_flight(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}
