//! HTTP surface: the signaling WebSocket plus health and static files.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use meshlane_proto::ClientEvent;
use tower_http::cors::CorsLayer;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::hub::SignalingHub;

#[derive(Clone)]
pub struct AppState {
  pub hub: Arc<SignalingHub>,
  pub config: Arc<RelayConfig>,
}

impl AppState {
  pub fn new(config: RelayConfig) -> Self {
    Self {
      hub: Arc::new(SignalingHub::new()),
      config: Arc::new(config),
    }
  }
}

pub fn router(state: AppState) -> Router {
  let static_dir = state.config.static_dir.clone();
  let router = Router::new()
    .route("/ws", get(ws_handler))
    .route("/health", get(health))
    .with_state(state);
  let router = match static_dir {
    Some(dir) => router.fallback_service(ServeDir::new(dir)),
    None => router,
  };
  router.layer(CorsLayer::permissive()).layer(TraceLayer::new_for_http())
}

pub async fn serve(state: AppState, addr: SocketAddr) -> anyhow::Result<()> {
  let listener = tokio::net::TcpListener::bind(addr).await?;
  info!(addr = %listener.local_addr()?, "Signaling relay listening");
  axum::serve(listener, router(state)).await?;
  Ok(())
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
  let stats = state.hub.stats();
  Json(serde_json::json!({
    "ok": true,
    "rooms": stats.rooms,
    "connections": stats.connections,
  }))
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
  ws.max_message_size(state.config.max_message_bytes)
    .on_upgrade(move |socket| handle_socket(socket, state.hub))
}

async fn handle_socket(socket: WebSocket, hub: Arc<SignalingHub>) {
  let (peer_id, mut events) = hub.connect();
  info!(peer = %peer_id, "client connected");
  let (mut ws_write, mut ws_read) = socket.split();

  let writer_peer = peer_id.clone();
  let mut writer = tokio::spawn(async move {
    while let Some(event) = events.recv().await {
      let text = match serde_json::to_string(&event) {
        Ok(text) => text,
        Err(err) => {
          warn!(peer = %writer_peer, error = %err, "failed to encode relay event");
          continue;
        }
      };
      if ws_write.send(Message::Text(text)).await.is_err() {
        break;
      }
    }
  });

  loop {
    tokio::select! {
      msg = ws_read.next() => {
        let text = match msg {
          Some(Ok(Message::Text(text))) => text,
          Some(Ok(Message::Close(_))) | None => break,
          Some(Ok(_)) => continue,
          Some(Err(err)) => {
            debug!(peer = %peer_id, error = %err, "websocket read failed");
            break;
          }
        };
        match serde_json::from_str::<ClientEvent>(&text) {
          Ok(event) => hub.handle(&peer_id, event),
          Err(err) => debug!(peer = %peer_id, error = %err, "malformed client event ignored"),
        }
      }
      _ = &mut writer => break,
    }
  }

  hub.disconnect(&peer_id);
  writer.abort();
  info!(peer = %peer_id, "client disconnected");
}
