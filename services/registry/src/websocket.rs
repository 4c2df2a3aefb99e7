//! WebSocket push channel for change-feed subscribers
//!
//! Each connection gets its own bounded feed subscription. Delivery is
//! best-effort: a connection that stops draining loses its subscription
//! and must reconcile through the changes endpoint after reconnecting.

use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, info, warn};

use crate::handlers::AppState;

/// GET /ws/registry
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (subscriber_id, mut events) = state.feed.subscribe();
    info!(subscriber = subscriber_id, "Push subscriber connected");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else {
                    // Dropped by the feed (too slow) or feed closed
                    debug!(subscriber = subscriber_id, "Feed channel closed, ending push session");
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                };
                let frame = match serde_json::to_string(&event) {
                    Ok(json) => json,
                    Err(e) => {
                        warn!(subscriber = subscriber_id, error = %e, "Failed to encode change event");
                        continue;
                    }
                };
                if sender.send(Message::Text(frame)).await.is_err() {
                    debug!(subscriber = subscriber_id, "Push send failed, client gone");
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Ping(payload))) => {
                        if sender.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(subscriber = subscriber_id, "Push subscriber closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // The push channel is one-way; client frames are ignored
                    }
                    Some(Err(e)) => {
                        debug!(subscriber = subscriber_id, error = %e, "WebSocket error");
                        break;
                    }
                }
            }
        }
    }

    state.feed.unsubscribe(subscriber_id);
    info!(subscriber = subscriber_id, "Push subscriber disconnected");
}
