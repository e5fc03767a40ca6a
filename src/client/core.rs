//! Session reducer
//!
//! Relay messages and peer notifications go in, commands come out. Holds the
//! participant set and per-peer politeness; never touches the network or
//! media, so every negotiation decision is testable in isolation.

use std::collections::HashMap;
use tracing::{debug, info, warn};

use super::negotiation::{PeerOrigin, PeerState, Politeness};
use crate::events::SessionEvent;
use crate::signaling::{IceCandidate, ParticipantInfo, Role, SignalMessage};

/// Side effect requested by the reducer
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// Create the peer connection for a remote participant
    CreatePeer { identity: String, politeness: Politeness },
    /// Create and send an offer
    SendOffer { identity: String, ice_restart: bool },
    /// Hand a remote offer to the peer
    ApplyOffer { identity: String, sdp: String, ice_restart: bool },
    ApplyAnswer { identity: String, sdp: String },
    AddCandidate { identity: String, candidate: IceCandidate },
    ClosePeer { identity: String },
    Emit(SessionEvent),
    /// Moderation removed us; tear down without retry
    Terminate { reason: String },
}

/// A remote participant as seen by the local client
#[derive(Debug, Clone)]
pub struct RemoteParticipant {
    pub identity: String,
    /// `None` until the membership broadcast names the role
    pub role: Option<Role>,
    pub politeness: Politeness,
    pub state: PeerState,
    /// (kind, track id) of received tracks
    pub tracks: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct SessionCore {
    session_id: String,
    local: ParticipantInfo,
    participants: HashMap<String, RemoteParticipant>,
}

impl SessionCore {
    pub fn new(session_id: impl Into<String>, identity: impl Into<String>, role: Role) -> Self {
        Self {
            session_id: session_id.into(),
            local: ParticipantInfo {
                identity: identity.into(),
                role,
            },
            participants: HashMap::new(),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn local(&self) -> &ParticipantInfo {
        &self.local
    }

    pub fn participant(&self, identity: &str) -> Option<&RemoteParticipant> {
        self.participants.get(identity)
    }

    pub fn participants(&self) -> impl Iterator<Item = &RemoteParticipant> {
        self.participants.values()
    }

    pub fn participant_count(&self) -> usize {
        self.participants.len()
    }

    /// Any peer in a failed or disconnected transport state
    pub fn transport_degraded(&self) -> bool {
        self.participants.values().any(|p| p.state.is_degraded())
    }

    /// Peers an ICE restart wave should renegotiate
    pub fn restart_targets(&self) -> Vec<String> {
        let mut targets: Vec<String> = self
            .participants
            .values()
            .filter(|p| p.state != PeerState::Closed)
            .map(|p| p.identity.clone())
            .collect();
        targets.sort();
        targets
    }

    /// Seed membership from the `session-joined` reply
    pub fn joined(&mut self, participants: &[ParticipantInfo]) -> Vec<Command> {
        let mut commands = Vec::new();
        for info in participants {
            if info.identity == self.local.identity {
                continue;
            }
            // Newcomer: polite toward everyone already present, sends no offer
            self.add(&info.identity, Some(info.role), PeerOrigin::PresentAtJoin, &mut commands);
        }
        info!(
            session_id = %self.session_id,
            existing = self.participants.len(),
            "Joined video session"
        );
        commands
    }

    pub fn handle(&mut self, message: SignalMessage) -> Vec<Command> {
        let mut commands = Vec::new();

        match message {
            SignalMessage::ParticipantJoined { identity, role } => {
                if identity == self.local.identity {
                    return commands;
                }
                if let Some(existing) = self.participants.get_mut(&identity) {
                    if existing.role.is_none() {
                        // Its offer arrived first; the peer is already negotiating
                        existing.role = Some(role);
                        commands.push(Command::Emit(SessionEvent::ParticipantJoined { identity, role }));
                        return commands;
                    }
                    // Rejoined from a new connection; the old transport is stale
                    self.remove(&identity, &mut commands);
                }
                self.add(&identity, Some(role), PeerOrigin::JoinedAfterUs, &mut commands);
                commands.push(Command::SendOffer {
                    identity,
                    ice_restart: false,
                });
            }

            SignalMessage::ParticipantLeft { identity, .. } => {
                self.remove(&identity, &mut commands);
            }

            SignalMessage::Offer {
                from_identity: Some(from),
                sdp,
                ice_restart,
                ..
            } => {
                if !self.participants.contains_key(&from) {
                    // Offer raced ahead of the membership broadcast
                    self.add(&from, None, PeerOrigin::Unknown, &mut commands);
                }
                commands.push(Command::ApplyOffer {
                    identity: from,
                    sdp,
                    ice_restart,
                });
            }

            SignalMessage::Answer {
                from_identity: Some(from),
                sdp,
                ..
            } => {
                if self.participants.contains_key(&from) {
                    commands.push(Command::ApplyAnswer { identity: from, sdp });
                } else {
                    debug!("Dropping answer from unknown peer {}", from);
                }
            }

            SignalMessage::IceCandidate {
                from_identity: Some(from),
                candidate,
                ..
            } => {
                if self.participants.contains_key(&from) {
                    commands.push(Command::AddCandidate {
                        identity: from,
                        candidate,
                    });
                } else {
                    debug!("Dropping ICE candidate from unknown peer {}", from);
                }
            }

            SignalMessage::ModerationAlert { message } => {
                commands.push(Command::Emit(SessionEvent::ModerationAlert { message }));
            }

            SignalMessage::ModerationWarning { message } => {
                commands.push(Command::Emit(SessionEvent::ModerationWarning { message }));
            }

            SignalMessage::SessionJoinBlocked { reason } => {
                warn!(session_id = %self.session_id, "Removed from session: {}", reason);
                commands.push(Command::Emit(SessionEvent::SessionBlocked {
                    reason: reason.clone(),
                }));
                commands.push(Command::Terminate { reason });
            }

            SignalMessage::Error { message } => {
                warn!(session_id = %self.session_id, "Relay error: {}", message);
                commands.push(Command::Emit(SessionEvent::SessionError {
                    message,
                    retryable: false,
                }));
            }

            other => {
                debug!("Ignoring {} in session", other.kind());
            }
        }

        commands
    }

    /// Transport state reported by a peer connection
    pub fn peer_state_changed(&mut self, identity: &str, state: PeerState) -> Vec<Command> {
        let Some(participant) = self.participants.get_mut(identity) else {
            return Vec::new();
        };
        if participant.state == state {
            return Vec::new();
        }
        participant.state = state;
        vec![Command::Emit(SessionEvent::PeerStateChanged {
            identity: identity.to_string(),
            state,
        })]
    }

    /// A remote media track arrived
    pub fn remote_track(&mut self, identity: &str, kind: &str, track_id: &str) -> Vec<Command> {
        let Some(participant) = self.participants.get_mut(identity) else {
            return Vec::new();
        };
        participant
            .tracks
            .push((kind.to_string(), track_id.to_string()));
        vec![Command::Emit(SessionEvent::RemoteTrackAdded {
            identity: identity.to_string(),
            kind: kind.to_string(),
            track_id: track_id.to_string(),
        })]
    }

    /// ICE restart offers to every live peer, regardless of politeness
    pub fn restart_ice(&self) -> Vec<Command> {
        self.restart_targets()
            .into_iter()
            .map(|identity| Command::SendOffer {
                identity,
                ice_restart: true,
            })
            .collect()
    }

    /// Close every peer and forget the participant set
    pub fn leave(&mut self) -> Vec<Command> {
        let mut identities: Vec<String> = self.participants.keys().cloned().collect();
        identities.sort();
        self.participants.clear();
        identities
            .into_iter()
            .map(|identity| Command::ClosePeer { identity })
            .collect()
    }

    fn add(
        &mut self,
        identity: &str,
        role: Option<Role>,
        origin: PeerOrigin,
        commands: &mut Vec<Command>,
    ) {
        let politeness = Politeness::resolve(&self.local.identity, identity, origin);
        debug!(
            "Tracking peer {} ({:?}), origin {:?}, local side {:?}",
            identity, role, origin, politeness
        );

        commands.push(Command::CreatePeer {
            identity: identity.to_string(),
            politeness,
        });
        if let Some(role) = role {
            commands.push(Command::Emit(SessionEvent::ParticipantJoined {
                identity: identity.to_string(),
                role,
            }));
        }

        self.participants.insert(
            identity.to_string(),
            RemoteParticipant {
                identity: identity.to_string(),
                role,
                politeness,
                state: PeerState::Idle,
                tracks: Vec::new(),
            },
        );
    }

    fn remove(&mut self, identity: &str, commands: &mut Vec<Command>) {
        if self.participants.remove(identity).is_none() {
            return;
        }
        commands.push(Command::ClosePeer {
            identity: identity.to_string(),
        });
        commands.push(Command::Emit(SessionEvent::ParticipantLeft {
            identity: identity.to_string(),
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(identity: &str, role: Role) -> ParticipantInfo {
        ParticipantInfo {
            identity: identity.to_string(),
            role,
        }
    }

    fn offers(commands: &[Command]) -> Vec<&str> {
        commands
            .iter()
            .filter_map(|c| match c {
                Command::SendOffer { identity, .. } => Some(identity.as_str()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_two_party_join_sends_exactly_one_offer() {
        // A joins S1 first and sees nobody
        let mut a = SessionCore::new("S1", "A", Role::Teacher);
        assert!(a.joined(&[]).is_empty());

        // B joins second, session-joined lists A
        let mut b = SessionCore::new("S1", "B", Role::Student);
        let b_cmds = b.joined(&[info("A", Role::Teacher)]);
        assert!(offers(&b_cmds).is_empty());
        assert!(b_cmds.contains(&Command::CreatePeer {
            identity: "A".to_string(),
            politeness: Politeness::Polite,
        }));

        // A learns about B and offers
        let a_cmds = a.handle(SignalMessage::ParticipantJoined {
            identity: "B".to_string(),
            role: Role::Student,
        });
        assert_eq!(offers(&a_cmds), vec!["B"]);
        assert_eq!(a.participant("B").unwrap().politeness, Politeness::Impolite);
    }

    #[test]
    fn test_offer_routed_to_peer() {
        let mut b = SessionCore::new("S1", "B", Role::Student);
        b.joined(&[info("A", Role::Teacher)]);

        let cmds = b.handle(SignalMessage::Offer {
            session_id: "S1".to_string(),
            target_identity: "B".to_string(),
            from_identity: Some("A".to_string()),
            sdp: "v=0".to_string(),
            ice_restart: false,
        });
        assert_eq!(
            cmds,
            vec![Command::ApplyOffer {
                identity: "A".to_string(),
                sdp: "v=0".to_string(),
                ice_restart: false,
            }]
        );
    }

    #[test]
    fn test_offer_from_unknown_peer_uses_tiebreak() {
        let mut core = SessionCore::new("S1", "bob", Role::Student);
        let cmds = core.handle(SignalMessage::Offer {
            session_id: "S1".to_string(),
            target_identity: "bob".to_string(),
            from_identity: Some("alice".to_string()),
            sdp: "v=0".to_string(),
            ice_restart: false,
        });

        assert!(matches!(
            &cmds[0],
            Command::CreatePeer { politeness: Politeness::Polite, .. }
        ));
        assert!(matches!(&cmds[1], Command::ApplyOffer { .. }));
        assert_eq!(cmds.len(), 2);
        assert_eq!(core.participant("alice").unwrap().role, None);
    }

    #[test]
    fn test_membership_after_early_offer_fills_role() {
        let mut core = SessionCore::new("S1", "bob", Role::Student);
        core.handle(SignalMessage::Offer {
            session_id: "S1".to_string(),
            target_identity: "bob".to_string(),
            from_identity: Some("alice".to_string()),
            sdp: "v=0".to_string(),
            ice_restart: false,
        });

        let cmds = core.handle(SignalMessage::ParticipantJoined {
            identity: "alice".to_string(),
            role: Role::Teacher,
        });
        // Same transport keeps negotiating
        assert_eq!(
            cmds,
            vec![Command::Emit(SessionEvent::ParticipantJoined {
                identity: "alice".to_string(),
                role: Role::Teacher,
            })]
        );
        assert_eq!(core.participant("alice").unwrap().role, Some(Role::Teacher));
        assert_eq!(core.participant_count(), 1);
    }

    #[test]
    fn test_unstamped_and_unknown_negotiation_dropped() {
        let mut core = SessionCore::new("S1", "A", Role::Teacher);
        let unstamped = core.handle(SignalMessage::Answer {
            session_id: "S1".to_string(),
            target_identity: "A".to_string(),
            from_identity: None,
            sdp: "v=0".to_string(),
        });
        assert!(unstamped.is_empty());

        let unknown = core.handle(SignalMessage::IceCandidate {
            session_id: "S1".to_string(),
            target_identity: "A".to_string(),
            from_identity: Some("ghost".to_string()),
            candidate: IceCandidate::new("candidate:1"),
        });
        assert!(unknown.is_empty());
    }

    #[test]
    fn test_leave_closes_peer_and_emits() {
        let mut a = SessionCore::new("S1", "A", Role::Teacher);
        a.handle(SignalMessage::ParticipantJoined {
            identity: "B".to_string(),
            role: Role::Student,
        });

        let cmds = a.handle(SignalMessage::ParticipantLeft {
            identity: "B".to_string(),
            role: Some(Role::Student),
        });
        assert_eq!(cmds[0], Command::ClosePeer { identity: "B".to_string() });
        assert_eq!(a.participant_count(), 0);
    }

    #[test]
    fn test_rejoin_replaces_stale_peer() {
        let mut a = SessionCore::new("S1", "A", Role::Teacher);
        a.handle(SignalMessage::ParticipantJoined {
            identity: "B".to_string(),
            role: Role::Student,
        });
        let cmds = a.handle(SignalMessage::ParticipantJoined {
            identity: "B".to_string(),
            role: Role::Student,
        });
        assert_eq!(cmds[0], Command::ClosePeer { identity: "B".to_string() });
        assert_eq!(offers(&cmds), vec!["B"]);
        assert_eq!(a.participant_count(), 1);
    }

    #[test]
    fn test_blocked_terminates() {
        let mut core = SessionCore::new("S1", "B", Role::Student);
        let cmds = core.handle(SignalMessage::SessionJoinBlocked {
            reason: "policy".to_string(),
        });
        assert!(cmds.contains(&Command::Terminate {
            reason: "policy".to_string()
        }));
    }

    #[test]
    fn test_restart_ignores_politeness() {
        let mut b = SessionCore::new("S1", "B", Role::Student);
        b.joined(&[info("A", Role::Teacher), info("C", Role::Student)]);
        let cmds = b.restart_ice();
        assert_eq!(offers(&cmds), vec!["A", "C"]);
        assert!(cmds
            .iter()
            .all(|c| matches!(c, Command::SendOffer { ice_restart: true, .. })));
    }

    #[test]
    fn test_peer_state_tracking() {
        let mut b = SessionCore::new("S1", "B", Role::Student);
        b.joined(&[info("A", Role::Teacher)]);
        assert!(!b.transport_degraded());

        let cmds = b.peer_state_changed("A", PeerState::Failed);
        assert_eq!(cmds.len(), 1);
        assert!(b.transport_degraded());
        assert!(b.peer_state_changed("A", PeerState::Failed).is_empty());
    }
}
