//! WebSocket endpoint for the signaling relay
//!
//! One socket per client. Inbound text frames go to the hub; the hub's
//! outbound queue for this connection is drained into the socket. A periodic
//! ping keeps NAT bindings and proxies from idling the connection out.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::hub::Outgoing;
use super::RelayAppState;

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<RelayAppState>>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<RelayAppState>) {
    let (mut sender, mut receiver) = socket.split();
    let hub = state.hub.clone();
    let (conn, mut outgoing) = hub.register();

    info!(conn, "Relay client connected");

    let heartbeat_secs = state.config.get().relay.heartbeat_secs.max(1);
    let mut heartbeat_interval = tokio::time::interval(Duration::from_secs(heartbeat_secs));

    loop {
        tokio::select! {
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        hub.handle_text(conn, &text).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        debug!(conn, "Ignoring binary frame");
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => {
                        info!(conn, "Relay client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(conn, "Relay receive error: {}", e);
                        break;
                    }
                }
            }

            frame = outgoing.recv() => {
                match frame {
                    Some(Outgoing::Message(message)) => {
                        let json = match message.to_json() {
                            Ok(json) => json,
                            Err(e) => {
                                warn!(conn, "Failed to encode relay frame: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(json)).await.is_err() {
                            warn!(conn, "Failed to send to relay client, disconnecting");
                            break;
                        }
                    }
                    Some(Outgoing::Close) | None => {
                        let _ = sender.send(Message::Close(None)).await;
                        info!(conn, "Closing relay connection");
                        break;
                    }
                }
            }

            _ = heartbeat_interval.tick() => {
                if sender.send(Message::Ping(vec![])).await.is_err() {
                    warn!(conn, "Failed to send ping, disconnecting");
                    break;
                }
            }
        }
    }

    hub.disconnect(conn);
}
