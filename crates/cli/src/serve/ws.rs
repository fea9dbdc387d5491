//! GET /ws -- per-owner notification stream.
//!
//! Server frames are events (`{type, operation_id, data, timestamp}`) and
//! periodic `{"type":"heartbeat"}`. Any inbound frame counts as liveness.
//! When the hub reaps the connection for silence its event stream ends and
//! the socket is closed.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use tracksync_engine::{heartbeat_frame, OwnerId, Subscription};

use super::middleware::Owner;
use super::state::AppState;

pub(crate) async fn handle_ws(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| run_socket(socket, state, owner))
}

fn text_frame(value: &serde_json::Value) -> Message {
    Message::Text(value.to_string().into())
}

async fn run_socket(socket: WebSocket, state: Arc<AppState>, owner: OwnerId) {
    let hub = Arc::clone(state.engine.hub());
    let Subscription { handle, mut events } = hub.register(&owner);
    let (mut sender, mut receiver) = socket.split();

    let mut heartbeat = tokio::time::interval(state.engine.config().heartbeat_interval());
    // The first tick completes immediately.
    heartbeat.tick().await;

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(event) => {
                    if sender.send(text_frame(&event.to_wire())).await.is_err() {
                        break;
                    }
                }
                None => {
                    let _ = sender.send(Message::Close(None)).await;
                    break;
                }
            },
            _ = heartbeat.tick() => {
                if sender.send(text_frame(&heartbeat_frame())).await.is_err() {
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                Some(Ok(_)) => {
                    if !hub.touch(&handle) {
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
            },
        }
    }

    hub.unregister(&handle);
}
