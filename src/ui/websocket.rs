//! Status push over WebSocket
//!
//! Every connected browser gets the current [`SessionStatus`] as JSON right
//! away and again on each change.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;

use crate::session::SessionStatus;
use crate::ui::server::AppState;

pub async fn status_ws(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| push_status(socket, state))
}

async fn push_status(socket: WebSocket, state: Arc<AppState>) {
    let (mut sender, mut receiver) = socket.split();
    let mut status = state.controller.subscribe();

    let initial = status_json(&status.borrow_and_update());
    if let Some(json) = initial {
        if sender.send(Message::Text(json)).await.is_err() {
            return;
        }
    }

    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let Some(json) = status_json(&status.borrow_and_update()) else {
                    continue;
                };
                if sender.send(Message::Text(json)).await.is_err() {
                    break;
                }
            }
            incoming = receiver.next() => match incoming {
                Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                Some(Ok(_)) => {}
            }
        }
    }
    tracing::debug!("Status client disconnected");
}

fn status_json(status: &SessionStatus) -> Option<String> {
    serde_json::to_string(status)
        .map_err(|e| tracing::warn!("Failed to serialize status: {}", e))
        .ok()
}
