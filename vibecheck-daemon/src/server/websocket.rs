//! WebSocket handler streaming the live events of one analysis.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};

use super::state::AppState;

/// WebSocket upgrade handler.
pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    Path(analysis_id): Path<String>,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, analysis_id, state))
}

fn is_ping(text: &str) -> bool {
    if text.trim() == "ping" {
        return true;
    }
    serde_json::from_str::<Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(Value::as_str).map(|t| t == "ping"))
        .unwrap_or(false)
}

/// Handle an individual WebSocket connection.
async fn handle_socket(socket: WebSocket, analysis_id: String, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();

    let mut subscription = state.events().subscribe(&analysis_id);
    let subscriber_id = subscription.id();
    state.ws_connect();
    info!(
        "WebSocket client subscribed to {} (total: {})",
        analysis_id,
        state.ws_connection_count()
    );

    let connected = json!({ "type": "connected", "analysisId": analysis_id }).to_string();
    if sender.send(Message::Text(connected)).await.is_err() {
        state.events().unsubscribe(&analysis_id, subscriber_id);
        state.ws_disconnect();
        return;
    }

    // Replies to client messages go through the sending task.
    let (reply_tx, mut reply_rx) = mpsc::channel::<String>(8);

    let send_task = tokio::spawn(async move {
        loop {
            let text = tokio::select! {
                event = subscription.recv() => match event {
                    Some(event) => match serde_json::to_string(event.as_ref()) {
                        Ok(json) => json,
                        Err(e) => {
                            tracing::error!("Failed to serialize event: {}", e);
                            continue;
                        }
                    },
                    // Dropped by the broadcaster.
                    None => break,
                },
                reply = reply_rx.recv() => match reply {
                    Some(reply) => reply,
                    None => break,
                },
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => {
                if is_ping(&text) {
                    let pong = json!({ "type": "pong" }).to_string();
                    if reply_tx.send(pong).await.is_err() {
                        break;
                    }
                } else {
                    debug!("Ignoring WebSocket message: {}", text);
                }
            }
            Message::Close(_) => break,
            _ => {}
        }
    }

    // Clean up
    send_task.abort();
    state.events().unsubscribe(&analysis_id, subscriber_id);
    state.ws_disconnect();
    info!(
        "WebSocket client left {} (total: {})",
        analysis_id,
        state.ws_connection_count()
    );
}
