//! Relay session table
//!
//! Pure bookkeeping: every operation takes the current table plus one input
//! and returns the frames to deliver. The hub owns the sockets.

use std::collections::HashMap;
use tracing::{debug, info};

use crate::signaling::{ParticipantInfo, Role, SignalMessage};

pub type ConnectionId = u64;

/// A frame or control action for one connection
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Send {
        to: ConnectionId,
        message: SignalMessage,
    },
    Close {
        to: ConnectionId,
    },
}

impl Outbound {
    fn send(to: ConnectionId, message: SignalMessage) -> Self {
        Outbound::Send { to, message }
    }
}

#[derive(Debug, Default)]
struct ConnectionEntry {
    /// Set once `authenticate` succeeds
    identity: Option<String>,
    /// Session this connection is a member of
    session: Option<String>,
}

#[derive(Debug, Clone)]
struct Member {
    connection: ConnectionId,
    identity: String,
    role: Role,
}

/// Connection and session membership table
#[derive(Debug, Default)]
pub struct RelayState {
    next_id: ConnectionId,
    connections: HashMap<ConnectionId, ConnectionEntry>,
    /// Members per session, in join order
    sessions: HashMap<String, Vec<Member>>,
    /// Moderation blocks per session: identity -> reason. Dropped with the
    /// session once its last member leaves.
    blocked: HashMap<String, HashMap<String, String>>,
}

impl RelayState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new, untrusted connection
    pub fn connect(&mut self) -> ConnectionId {
        self.next_id += 1;
        let id = self.next_id;
        self.connections.insert(id, ConnectionEntry::default());
        id
    }

    pub fn is_authenticated(&self, conn: ConnectionId) -> bool {
        self.connections
            .get(&conn)
            .map(|c| c.identity.is_some())
            .unwrap_or(false)
    }

    pub fn identity_of(&self, conn: ConnectionId) -> Option<&str> {
        self.connections.get(&conn)?.identity.as_deref()
    }

    /// Mark the connection trusted after the authenticator accepted it
    pub fn authenticate(&mut self, conn: ConnectionId, identity: &str) -> Vec<Outbound> {
        let Some(entry) = self.connections.get_mut(&conn) else {
            return vec![];
        };
        if let Some(existing) = &entry.identity {
            if existing != identity {
                return vec![Outbound::send(
                    conn,
                    SignalMessage::error("Connection is already authenticated"),
                )];
            }
        }
        entry.identity = Some(identity.to_string());
        debug!(conn, identity, "Connection authenticated");
        vec![Outbound::send(
            conn,
            SignalMessage::Authenticated {
                identity: identity.to_string(),
            },
        )]
    }

    /// Process one message from an authenticated or unauthenticated connection.
    /// `authenticate` itself is resolved by the hub before reaching here.
    pub fn handle(&mut self, conn: ConnectionId, message: SignalMessage) -> Vec<Outbound> {
        let Some(identity) = self.identity_of(conn).map(str::to_string) else {
            return vec![Outbound::send(conn, SignalMessage::error("Not authenticated"))];
        };

        if !message.is_client_originated() {
            return vec![Outbound::send(
                conn,
                SignalMessage::error(format!("Unsupported message type: {}", message.kind())),
            )];
        }

        match message {
            SignalMessage::Authenticate { .. } => vec![Outbound::send(
                conn,
                SignalMessage::error("Connection is already authenticated"),
            )],
            SignalMessage::JoinVideoSession { session_id, role } => {
                self.join(conn, &identity, &session_id, role)
            }
            SignalMessage::LeaveVideoSession { session_id } => {
                let in_session = self
                    .connections
                    .get(&conn)
                    .and_then(|c| c.session.as_deref())
                    == Some(session_id.as_str());
                if in_session {
                    self.leave(conn)
                } else {
                    vec![]
                }
            }
            relayed => self.forward(conn, &identity, &relayed),
        }
    }

    /// Drop a connection, leaving its session
    pub fn disconnect(&mut self, conn: ConnectionId) -> Vec<Outbound> {
        let out = self.leave(conn);
        self.connections.remove(&conn);
        out
    }

    /// Send a moderation frame verbatim to every member of a session
    pub fn broadcast_to_session(&self, session_id: &str, message: &SignalMessage) -> Vec<Outbound> {
        self.sessions
            .get(session_id)
            .map(|members| {
                members
                    .iter()
                    .map(|m| Outbound::send(m.connection, message.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Bar `identity` from a session; a present member is removed and closed
    pub fn block(&mut self, session_id: &str, identity: &str, reason: &str) -> Vec<Outbound> {
        let out = self.remove_blocked(session_id, identity, reason);
        // Recorded after removal so it survives the session emptying
        self.blocked
            .entry(session_id.to_string())
            .or_default()
            .insert(identity.to_string(), reason.to_string());
        out
    }

    fn remove_blocked(&mut self, session_id: &str, identity: &str, reason: &str) -> Vec<Outbound> {
        let Some(conn) = self.sessions.get(session_id).and_then(|members| {
            members
                .iter()
                .find(|m| m.identity == identity)
                .map(|m| m.connection)
        }) else {
            return vec![];
        };

        info!(session_id, identity, reason, "Blocking participant");
        let mut out = vec![Outbound::send(
            conn,
            SignalMessage::SessionJoinBlocked {
                reason: reason.to_string(),
            },
        )];
        out.extend(self.leave(conn));
        out.push(Outbound::Close { to: conn });
        out
    }

    pub fn members(&self, session_id: &str) -> Vec<ParticipantInfo> {
        self.sessions
            .get(session_id)
            .map(|members| members.iter().map(Member::info).collect())
            .unwrap_or_default()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    fn join(
        &mut self,
        conn: ConnectionId,
        identity: &str,
        session_id: &str,
        role: Role,
    ) -> Vec<Outbound> {
        if let Some(reason) = self.blocked.get(session_id).and_then(|b| b.get(identity)) {
            info!(session_id, identity, "Rejecting blocked participant");
            return vec![
                Outbound::send(
                    conn,
                    SignalMessage::SessionJoinBlocked {
                        reason: reason.clone(),
                    },
                ),
                Outbound::Close { to: conn },
            ];
        }

        let mut out = Vec::new();

        // A connection is a member of at most one session
        if self.connections.get(&conn).and_then(|c| c.session.as_ref()).is_some() {
            out.extend(self.leave(conn));
        }

        // A newer connection for the same identity supersedes a stale one
        let stale = self.sessions.get(session_id).and_then(|members| {
            members
                .iter()
                .find(|m| m.identity == identity && m.connection != conn)
                .map(|m| m.connection)
        });
        if let Some(stale) = stale {
            info!(session_id, identity, "Superseding stale connection");
            out.push(Outbound::send(
                stale,
                SignalMessage::error("Joined from another connection"),
            ));
            out.extend(self.leave(stale));
        }

        let members = self.sessions.entry(session_id.to_string()).or_default();
        let existing: Vec<ParticipantInfo> = members.iter().map(Member::info).collect();

        for member in members.iter() {
            out.push(Outbound::send(
                member.connection,
                SignalMessage::ParticipantJoined {
                    identity: identity.to_string(),
                    role,
                },
            ));
        }

        members.push(Member {
            connection: conn,
            identity: identity.to_string(),
            role,
        });
        if let Some(entry) = self.connections.get_mut(&conn) {
            entry.session = Some(session_id.to_string());
        }

        info!(
            session_id,
            identity,
            %role,
            members = existing.len() + 1,
            "Participant joined session"
        );

        out.push(Outbound::send(
            conn,
            SignalMessage::SessionJoined {
                session_id: session_id.to_string(),
                participants: existing,
            },
        ));
        out
    }

    fn leave(&mut self, conn: ConnectionId) -> Vec<Outbound> {
        let Some(session_id) = self.connections.get_mut(&conn).and_then(|c| c.session.take())
        else {
            return vec![];
        };
        let Some(members) = self.sessions.get_mut(&session_id) else {
            return vec![];
        };

        let Some(pos) = members.iter().position(|m| m.connection == conn) else {
            return vec![];
        };
        let departed = members.remove(pos);

        let out: Vec<Outbound> = members
            .iter()
            .map(|m| {
                Outbound::send(
                    m.connection,
                    SignalMessage::ParticipantLeft {
                        identity: departed.identity.clone(),
                        role: Some(departed.role),
                    },
                )
            })
            .collect();

        info!(
            session_id = %session_id,
            identity = %departed.identity,
            remaining = members.len(),
            "Participant left session"
        );

        if members.is_empty() {
            self.sessions.remove(&session_id);
            self.blocked.remove(&session_id);
            debug!(session_id = %session_id, "Removed empty session");
        }
        out
    }

    fn forward(&self, conn: ConnectionId, sender: &str, message: &SignalMessage) -> Vec<Outbound> {
        let Some((session_id, target)) = message.relay_target() else {
            return vec![];
        };

        let sender_session = self.connections.get(&conn).and_then(|c| c.session.as_deref());
        if sender_session != Some(session_id) {
            debug!(sender, session_id, "Dropping relay from non-member");
            return vec![];
        }

        let target_conn = self.sessions.get(session_id).and_then(|members| {
            members
                .iter()
                .find(|m| m.identity == target)
                .map(|m| m.connection)
        });

        match (target_conn, message.stamped(sender)) {
            (Some(to), Some(stamped)) => vec![Outbound::send(to, stamped)],
            _ => {
                debug!(sender, target, kind = message.kind(), "Dropping relay to unknown target");
                vec![]
            }
        }
    }
}

impl Member {
    fn info(&self) -> ParticipantInfo {
        ParticipantInfo {
            identity: self.identity.clone(),
            role: self.role,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn authed(state: &mut RelayState, identity: &str) -> ConnectionId {
        let conn = state.connect();
        state.authenticate(conn, identity);
        conn
    }

    fn join(state: &mut RelayState, conn: ConnectionId, session: &str, role: Role) -> Vec<Outbound> {
        state.handle(
            conn,
            SignalMessage::JoinVideoSession {
                session_id: session.to_string(),
                role,
            },
        )
    }

    fn offer(session: &str, target: &str, claimed: Option<&str>) -> SignalMessage {
        SignalMessage::Offer {
            session_id: session.to_string(),
            target_identity: target.to_string(),
            from_identity: claimed.map(str::to_string),
            sdp: "v=0".to_string(),
            ice_restart: false,
        }
    }

    #[test]
    fn test_unauthenticated_messages_are_rejected() {
        let mut state = RelayState::new();
        let conn = state.connect();

        let out = join(&mut state, conn, "S1", Role::Teacher);
        assert_eq!(
            out,
            vec![Outbound::send(conn, SignalMessage::error("Not authenticated"))]
        );
        assert_eq!(state.session_count(), 0);
    }

    #[test]
    fn test_join_order_scenario() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        let b = authed(&mut state, "B");

        let out = join(&mut state, a, "S1", Role::Teacher);
        assert_eq!(
            out,
            vec![Outbound::send(
                a,
                SignalMessage::SessionJoined {
                    session_id: "S1".to_string(),
                    participants: vec![],
                }
            )]
        );

        let out = join(&mut state, b, "S1", Role::Student);
        assert_eq!(
            out,
            vec![
                Outbound::send(
                    a,
                    SignalMessage::ParticipantJoined {
                        identity: "B".to_string(),
                        role: Role::Student,
                    }
                ),
                Outbound::send(
                    b,
                    SignalMessage::SessionJoined {
                        session_id: "S1".to_string(),
                        participants: vec![ParticipantInfo {
                            identity: "A".to_string(),
                            role: Role::Teacher,
                        }],
                    }
                ),
            ]
        );
    }

    #[test]
    fn test_forward_stamps_authenticated_identity() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        let b = authed(&mut state, "B");
        join(&mut state, a, "S1", Role::Teacher);
        join(&mut state, b, "S1", Role::Student);

        let out = state.handle(a, offer("S1", "B", Some("spoofed")));
        assert_eq!(out, vec![Outbound::send(b, offer("S1", "B", Some("A")))]);
    }

    #[test]
    fn test_forward_never_crosses_sessions() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        let b = authed(&mut state, "B");
        let c = authed(&mut state, "C");
        join(&mut state, a, "S1", Role::Teacher);
        join(&mut state, b, "S1", Role::Student);
        join(&mut state, c, "S2", Role::Student);

        // Target lives in another session
        assert!(state.handle(a, offer("S1", "C", None)).is_empty());
        // Sender claims a session it is not a member of
        assert!(state.handle(a, offer("S2", "C", None)).is_empty());
        // Unknown target
        assert!(state.handle(a, offer("S1", "Z", None)).is_empty());
    }

    #[test]
    fn test_leave_broadcasts_and_removes_empty_session() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        let b = authed(&mut state, "B");
        join(&mut state, a, "S1", Role::Teacher);
        join(&mut state, b, "S1", Role::Student);

        let out = state.handle(
            b,
            SignalMessage::LeaveVideoSession {
                session_id: "S1".to_string(),
            },
        );
        assert_eq!(
            out,
            vec![Outbound::send(
                a,
                SignalMessage::ParticipantLeft {
                    identity: "B".to_string(),
                    role: Some(Role::Student),
                }
            )]
        );

        let out = state.disconnect(a);
        assert!(out.is_empty());
        assert_eq!(state.session_count(), 0);
        assert_eq!(state.connection_count(), 1);
    }

    #[test]
    fn test_client_cannot_send_server_messages() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        join(&mut state, a, "S1", Role::Teacher);

        let out = state.handle(
            a,
            SignalMessage::ModerationAlert {
                message: "fake".to_string(),
            },
        );
        assert!(matches!(
            out.as_slice(),
            [Outbound::Send { message: SignalMessage::Error { .. }, .. }]
        ));
    }

    #[test]
    fn test_duplicate_identity_supersedes_stale_connection() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        let b_old = authed(&mut state, "B");
        let b_new = authed(&mut state, "B");
        join(&mut state, a, "S1", Role::Teacher);
        join(&mut state, b_old, "S1", Role::Student);

        let out = join(&mut state, b_new, "S1", Role::Student);
        assert!(out.contains(&Outbound::send(
            a,
            SignalMessage::ParticipantLeft {
                identity: "B".to_string(),
                role: Some(Role::Student),
            }
        )));
        assert!(out.contains(&Outbound::send(
            a,
            SignalMessage::ParticipantJoined {
                identity: "B".to_string(),
                role: Role::Student,
            }
        )));
        assert_eq!(state.members("S1").len(), 2);

        // Relay to B now reaches the new connection only
        let out = state.handle(a, offer("S1", "B", None));
        assert_eq!(out, vec![Outbound::send(b_new, offer("S1", "B", Some("A")))]);
    }

    #[test]
    fn test_block_closes_connection() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        let b = authed(&mut state, "B");
        join(&mut state, a, "S1", Role::Teacher);
        join(&mut state, b, "S1", Role::Student);

        let out = state.block("S1", "B", "inappropriate content");
        assert_eq!(out.first(), Some(&Outbound::send(
            b,
            SignalMessage::SessionJoinBlocked {
                reason: "inappropriate content".to_string(),
            }
        )));
        assert_eq!(out.last(), Some(&Outbound::Close { to: b }));
        assert_eq!(state.members("S1").len(), 1);
    }

    #[test]
    fn test_blocked_identity_cannot_rejoin() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        join(&mut state, a, "S1", Role::Teacher);
        state.block("S1", "B", "policy");

        let b = authed(&mut state, "B");
        let out = join(&mut state, b, "S1", Role::Student);
        assert_eq!(
            out,
            vec![
                Outbound::send(
                    b,
                    SignalMessage::SessionJoinBlocked {
                        reason: "policy".to_string(),
                    }
                ),
                Outbound::Close { to: b },
            ]
        );
        assert_eq!(state.members("S1").len(), 1);

        // Other sessions are unaffected
        let out = join(&mut state, b, "S2", Role::Student);
        assert!(matches!(out.last(), Some(Outbound::Send { message: SignalMessage::SessionJoined { .. }, .. })));
    }

    #[test]
    fn test_blocks_are_dropped_with_their_session() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        let b = authed(&mut state, "B");
        join(&mut state, a, "S1", Role::Teacher);
        join(&mut state, b, "S1", Role::Student);
        state.block("S1", "C", "policy");
        state.block("S1", "B", "policy");
        assert_eq!(state.blocked["S1"].len(), 2);

        state.disconnect(a);
        assert_eq!(state.session_count(), 0);
        assert!(state.blocked.is_empty());

        // A fresh session under the same id starts with no blocks
        let c = authed(&mut state, "C");
        let out = join(&mut state, c, "S1", Role::Student);
        assert!(matches!(out.last(), Some(Outbound::Send { message: SignalMessage::SessionJoined { .. }, .. })));
    }

    #[test]
    fn test_blocking_last_member_keeps_block() {
        let mut state = RelayState::new();
        let a = authed(&mut state, "A");
        join(&mut state, a, "S1", Role::Student);

        state.block("S1", "A", "policy");
        assert_eq!(state.session_count(), 0);

        let a2 = authed(&mut state, "A");
        let out = join(&mut state, a2, "S1", Role::Student);
        assert_eq!(out.last(), Some(&Outbound::Close { to: a2 }));
    }
}
