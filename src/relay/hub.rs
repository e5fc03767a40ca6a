//! Relay hub: owns the session table and the per-connection outbound queues

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use super::auth::Authenticator;
use super::state::{ConnectionId, Outbound, RelayState};
use crate::signaling::{ParticipantInfo, SignalMessage};

/// Frame queued for a connection's socket writer
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Message(SignalMessage),
    Close,
}

struct Inner {
    state: RelayState,
    senders: HashMap<ConnectionId, mpsc::UnboundedSender<Outgoing>>,
}

impl Inner {
    /// Deliveries are queued while the table lock is held so every socket
    /// observes table changes in the order they were made.
    fn dispatch(&mut self, outbound: Vec<Outbound>) {
        for item in outbound {
            let (to, frame) = match item {
                Outbound::Send { to, message } => (to, Outgoing::Message(message)),
                Outbound::Close { to } => (to, Outgoing::Close),
            };
            if let Some(tx) = self.senders.get(&to) {
                if tx.send(frame).is_err() {
                    debug!(conn = to, "Dropping frame for closed connection");
                }
            }
        }
    }
}

/// Per-session broadcast hub
pub struct RelayHub {
    inner: Mutex<Inner>,
    authenticator: Arc<dyn Authenticator>,
}

impl RelayHub {
    pub fn new(authenticator: Arc<dyn Authenticator>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: RelayState::new(),
                senders: HashMap::new(),
            }),
            authenticator,
        }
    }

    /// Register a socket; returns its id and the queue its writer drains
    pub fn register(&self) -> (ConnectionId, mpsc::UnboundedReceiver<Outgoing>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut inner = self.inner.lock();
        let id = inner.state.connect();
        inner.senders.insert(id, tx);
        (id, rx)
    }

    /// Process one text frame from a connection
    pub async fn handle_text(&self, conn: ConnectionId, text: &str) {
        let message = match SignalMessage::from_json(text) {
            Ok(message) => message,
            Err(e) => {
                debug!(conn, "Malformed relay frame: {}", e);
                self.inner.lock().dispatch(vec![Outbound::Send {
                    to: conn,
                    message: SignalMessage::error("Malformed message"),
                }]);
                return;
            }
        };
        self.handle_message(conn, message).await;
    }

    pub async fn handle_message(&self, conn: ConnectionId, message: SignalMessage) {
        if let SignalMessage::Authenticate { identity, token } = message {
            if self.inner.lock().state.is_authenticated(conn) {
                self.inner.lock().dispatch(vec![Outbound::Send {
                    to: conn,
                    message: SignalMessage::error("Connection is already authenticated"),
                }]);
                return;
            }

            let verdict = self.authenticator.verify(&identity, &token).await;
            let mut inner = self.inner.lock();
            let out = match verdict {
                Ok(()) => inner.state.authenticate(conn, &identity),
                Err(e) => {
                    warn!(conn, identity = %identity, "Authentication failed: {}", e);
                    vec![Outbound::Send {
                        to: conn,
                        message: SignalMessage::AuthFailed {
                            reason: e.to_string(),
                        },
                    }]
                }
            };
            inner.dispatch(out);
            return;
        }

        let mut inner = self.inner.lock();
        let out = inner.state.handle(conn, message);
        inner.dispatch(out);
    }

    /// Socket closed: leave the session and drop the queue
    pub fn disconnect(&self, conn: ConnectionId) {
        let mut inner = self.inner.lock();
        let out = inner.state.disconnect(conn);
        inner.senders.remove(&conn);
        inner.dispatch(out);
    }

    /// Forward a moderation alert verbatim to every member of a session
    pub fn moderation_alert(&self, session_id: &str, message: &str) -> usize {
        self.broadcast(
            session_id,
            SignalMessage::ModerationAlert {
                message: message.to_string(),
            },
        )
    }

    /// Forward a moderation warning verbatim to every member of a session
    pub fn moderation_warning(&self, session_id: &str, message: &str) -> usize {
        self.broadcast(
            session_id,
            SignalMessage::ModerationWarning {
                message: message.to_string(),
            },
        )
    }

    /// Bar a participant from a session, removing them if present. Returns whether they were present.
    pub fn block(&self, session_id: &str, identity: &str, reason: &str) -> bool {
        let mut inner = self.inner.lock();
        let out = inner.state.block(session_id, identity, reason);
        let found = !out.is_empty();
        inner.dispatch(out);
        found
    }

    pub fn members(&self, session_id: &str) -> Vec<ParticipantInfo> {
        self.inner.lock().state.members(session_id)
    }

    pub fn session_count(&self) -> usize {
        self.inner.lock().state.session_count()
    }

    pub fn connection_count(&self) -> usize {
        self.inner.lock().state.connection_count()
    }

    fn broadcast(&self, session_id: &str, message: SignalMessage) -> usize {
        let mut inner = self.inner.lock();
        let out = inner.state.broadcast_to_session(session_id, &message);
        let count = out.len();
        inner.dispatch(out);
        count
    }
}
