//! Subscriber event stream: a WebSocket that opens with a snapshot of all
//! active calls and then relays the ordered event stream.
//!
//! Delivery is best-effort. A subscriber that falls behind the broadcast
//! buffer just misses events; the core never blocks on it.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::server::AppState;

pub async fn events_ws(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_events_socket(socket, state))
}

async fn handle_events_socket(socket: WebSocket, state: AppState) {
    // Subscribe before snapshotting so nothing between the two is lost.
    let mut events = state.manager.registry().subscribe();
    let snapshot = state.manager.registry().active();

    let (mut sender, mut receiver) = socket.split();

    let snapshot_msg = serde_json::json!({
        "type": "snapshot",
        "calls": snapshot,
    });
    if sender
        .send(Message::Text(snapshot_msg.to_string().into()))
        .await
        .is_err()
    {
        return;
    }
    debug!("event subscriber connected");

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => {
                    let text = match serde_json::to_string(&event) {
                        Ok(t) => t,
                        Err(e) => {
                            warn!("unserializable event: {e}");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "event subscriber lagged, events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            inbound = receiver.next() => match inbound {
                // Subscribers only listen; any close or error ends the session.
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {}
            },
        }
    }
    debug!("event subscriber disconnected");
}
