use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::server::ServerHandle;

#[derive(Clone)]
pub struct AppState {
    pub server: ServerHandle,
    pub metrics: PrometheusHandle,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/healthz", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/debug/rooms", get(rooms_handler))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn metrics_handler(State(state): State<AppState>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn rooms_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "rooms": state.server.snapshot().await }))
}

async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.server))
}

async fn handle_socket(socket: WebSocket, server: ServerHandle) {
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let mut outbound = server.connect(connection_id);
    info!(connection_id = %connection_id, "websocket connected");

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match envelope.to_text() {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection_id = %connection_id, error = %err, "failed to encode outbound frame");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection_id = %connection_id, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let message = match frame {
            Ok(message) => message,
            Err(err) => {
                warn!(connection_id = %connection_id, error = %err, "websocket error");
                break;
            }
        };
        match message {
            Message::Text(text) => server.frame(connection_id, text),
            Message::Binary(data) => match String::from_utf8(data) {
                Ok(text) => server.frame(connection_id, text),
                Err(_) => {
                    debug!(connection_id = %connection_id, "ignoring non-utf8 binary frame");
                }
            },
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => {}
        }
    }

    server.disconnect(connection_id);
    writer.abort();
    info!(connection_id = %connection_id, "websocket disconnected");
}
