//! Client side of the relay connection
//!
//! `RelayLink::connect` performs the join handshake (connect, authenticate,
//! join) under one timeout, then hands the socket to a reader and a writer
//! task. The controller talks to the link through two channels.

use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use crate::error::{AppError, Result};
use crate::signaling::{ParticipantInfo, Role, SignalMessage};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Credentials and target for one join attempt
#[derive(Debug, Clone)]
pub struct JoinRequest {
    pub relay_url: String,
    pub session_id: String,
    pub identity: String,
    pub token: String,
    pub role: Role,
}

/// Frames from the relay after the handshake
#[derive(Debug, Clone, PartialEq)]
pub enum RelayEvent {
    Message(SignalMessage),
    /// Socket closed or failed; the session must be re-joined from scratch
    Closed,
}

/// Established, joined relay connection
pub struct RelayLink {
    /// Messages to the relay
    pub outbound: mpsc::UnboundedSender<SignalMessage>,
    /// Messages from the relay
    pub inbound: mpsc::UnboundedReceiver<RelayEvent>,
    /// Membership at join time, excluding ourselves
    pub participants: Vec<ParticipantInfo>,
}

impl RelayLink {
    /// Connect, authenticate and join within `timeout`
    pub async fn connect(request: &JoinRequest, timeout: Duration) -> Result<Self> {
        match tokio::time::timeout(timeout, Self::handshake(request)).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Handshake(format!(
                "no response from {} within {} seconds",
                request.relay_url,
                timeout.as_secs()
            ))),
        }
    }

    async fn handshake(request: &JoinRequest) -> Result<Self> {
        info!("Connecting to relay: {}", request.relay_url);

        let (ws_stream, _) = connect_async(request.relay_url.as_str())
            .await
            .map_err(|e| AppError::Handshake(format!("failed to connect: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();

        send_frame(
            &mut write,
            &SignalMessage::Authenticate {
                identity: request.identity.clone(),
                token: request.token.clone(),
            },
        )
        .await?;

        match next_frame(&mut read).await? {
            SignalMessage::Authenticated { identity } => {
                debug!("Authenticated with relay as {}", identity);
            }
            SignalMessage::AuthFailed { reason } => {
                // Retried like any other handshake fault
                return Err(AppError::Handshake(format!("authentication failed: {}", reason)));
            }
            other => {
                return Err(AppError::Handshake(format!(
                    "unexpected {} before authentication",
                    other.kind()
                )));
            }
        }

        send_frame(
            &mut write,
            &SignalMessage::JoinVideoSession {
                session_id: request.session_id.clone(),
                role: request.role,
            },
        )
        .await?;

        let participants = loop {
            match next_frame(&mut read).await? {
                SignalMessage::SessionJoined { participants, .. } => break participants,
                SignalMessage::SessionJoinBlocked { reason } => {
                    return Err(AppError::Blocked(reason));
                }
                SignalMessage::Error { message } => {
                    return Err(AppError::Handshake(message));
                }
                other => debug!("Ignoring {} while joining", other.kind()),
            }
        };

        let participants: Vec<ParticipantInfo> = participants
            .into_iter()
            .filter(|p| p.identity != request.identity)
            .collect();

        info!(
            session_id = %request.session_id,
            identity = %request.identity,
            existing = participants.len(),
            "Joined session on relay"
        );

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (inbound_tx, inbound) = mpsc::unbounded_channel();

        tokio::spawn(writer_task(write, outbound_rx));
        tokio::spawn(reader_task(read, inbound_tx));

        Ok(Self {
            outbound,
            inbound,
            participants,
        })
    }
}

async fn send_frame(write: &mut SplitSink<WsStream, Message>, message: &SignalMessage) -> Result<()> {
    let json = message.to_json()?;
    write
        .send(Message::Text(json))
        .await
        .map_err(|e| AppError::Handshake(format!("send failed: {}", e)))
}

/// Next parseable signaling frame during the handshake
async fn next_frame(read: &mut SplitStream<WsStream>) -> Result<SignalMessage> {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                Ok(message) => return Ok(message),
                Err(e) => warn!("Malformed relay frame: {}", e),
            },
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => return Err(AppError::Handshake(format!("receive failed: {}", e))),
        }
    }
    Err(AppError::Handshake("relay closed the connection".to_string()))
}

async fn writer_task(
    mut write: SplitSink<WsStream, Message>,
    mut rx: mpsc::UnboundedReceiver<SignalMessage>,
) {
    while let Some(message) = rx.recv().await {
        let json = match message.to_json() {
            Ok(json) => json,
            Err(e) => {
                warn!("Failed to encode {}: {}", message.kind(), e);
                continue;
            }
        };
        if let Err(e) = write.send(Message::Text(json)).await {
            warn!("Failed to send to relay: {}", e);
            break;
        }
    }

    let _ = write.send(Message::Close(None)).await;
    debug!("Relay writer stopped");
}

async fn reader_task(mut read: SplitStream<WsStream>, tx: mpsc::UnboundedSender<RelayEvent>) {
    while let Some(frame) = read.next().await {
        match frame {
            Ok(Message::Text(text)) => match SignalMessage::from_json(&text) {
                Ok(message) => {
                    if tx.send(RelayEvent::Message(message)).is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Malformed relay frame: {}", e),
            },
            Ok(Message::Close(_)) => {
                info!("Relay closed the connection");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                warn!("Relay connection error: {}", e);
                break;
            }
        }
    }

    let _ = tx.send(RelayEvent::Closed);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AppConfig, AuthMode, ConfigStore};
    use crate::relay::{create_router, RelayAppState};

    async fn start_relay() -> String {
        let mut config = AppConfig::default();
        config.relay.auth.mode = AuthMode::Open;
        let state = RelayAppState::new(ConfigStore::new(config)).unwrap();
        let app = create_router(state);

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("ws://{}/api/ws/video", addr)
    }

    fn request(url: &str, identity: &str, role: Role) -> JoinRequest {
        JoinRequest {
            relay_url: url.to_string(),
            session_id: "S1".to_string(),
            identity: identity.to_string(),
            token: "dev".to_string(),
            role,
        }
    }

    #[tokio::test]
    async fn test_join_lists_existing_members() {
        let url = start_relay().await;
        let timeout = Duration::from_secs(5);

        let a = RelayLink::connect(&request(&url, "A", Role::Teacher), timeout)
            .await
            .unwrap();
        assert!(a.participants.is_empty());

        let b = RelayLink::connect(&request(&url, "B", Role::Student), timeout)
            .await
            .unwrap();
        assert_eq!(b.participants.len(), 1);
        assert_eq!(b.participants[0].identity, "A");
        assert_eq!(b.participants[0].role, Role::Teacher);

        let mut a = a;
        match a.inbound.recv().await.unwrap() {
            RelayEvent::Message(SignalMessage::ParticipantJoined { identity, role }) => {
                assert_eq!(identity, "B");
                assert_eq!(role, Role::Student);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unreachable_relay_is_handshake_error() {
        let err = RelayLink::connect(
            &request("ws://127.0.0.1:1/api/ws/video", "A", Role::Teacher),
            Duration::from_secs(2),
        )
        .await
        .err()
        .unwrap();
        assert!(matches!(err, AppError::Handshake(_)));
        assert!(err.is_retryable());
    }
}
