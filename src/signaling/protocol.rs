//! Relay wire protocol
//!
//! Every frame on the relay connection is one JSON object with a `type`
//! discriminator. The same enum is used on both ends; the relay rejects
//! server-originated types when a client sends them.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Participant role in a live class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => write!(f, "teacher"),
            Role::Student => write!(f, "student"),
        }
    }
}

/// Membership entry in `session-joined`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParticipantInfo {
    pub identity: String,
    pub role: Role,
}

/// ICE candidate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IceCandidate {
    /// Candidate string
    pub candidate: String,
    /// SDP mid (media ID)
    #[serde(rename = "sdpMid")]
    pub sdp_mid: Option<String>,
    /// SDP mline index
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    /// Username fragment
    #[serde(rename = "usernameFragment", default)]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        }
    }

    pub fn with_mid(mut self, mid: impl Into<String>, index: u16) -> Self {
        self.sdp_mid = Some(mid.into());
        self.sdp_mline_index = Some(index);
        self
    }
}

/// Signaling message catalog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalMessage {
    /// First message on every connection
    Authenticate { identity: String, token: String },
    /// Relay accepted the credentials
    Authenticated { identity: String },
    /// Relay rejected the credentials
    AuthFailed { reason: String },

    #[serde(rename_all = "camelCase")]
    JoinVideoSession { session_id: String, role: Role },
    /// Reply to the joiner with everyone already present
    #[serde(rename_all = "camelCase")]
    SessionJoined {
        session_id: String,
        participants: Vec<ParticipantInfo>,
    },
    ParticipantJoined { identity: String, role: Role },
    ParticipantLeft {
        identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    #[serde(rename_all = "camelCase")]
    LeaveVideoSession { session_id: String },

    /// SDP offer; `from_identity` is stamped by the relay
    #[serde(rename = "webrtc-offer", rename_all = "camelCase")]
    Offer {
        session_id: String,
        target_identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_identity: Option<String>,
        sdp: String,
        #[serde(default)]
        ice_restart: bool,
    },
    #[serde(rename = "webrtc-answer", rename_all = "camelCase")]
    Answer {
        session_id: String,
        target_identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_identity: Option<String>,
        sdp: String,
    },
    #[serde(rename = "webrtc-ice-candidate", rename_all = "camelCase")]
    IceCandidate {
        session_id: String,
        target_identity: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from_identity: Option<String>,
        candidate: IceCandidate,
    },

    ModerationAlert { message: String },
    ModerationWarning { message: String },
    /// Moderation removed this participant; the relay closes the connection after sending it
    SessionJoinBlocked { reason: String },

    Error { message: String },
}

impl SignalMessage {
    /// Wire name of the message type
    pub fn kind(&self) -> &'static str {
        match self {
            SignalMessage::Authenticate { .. } => "authenticate",
            SignalMessage::Authenticated { .. } => "authenticated",
            SignalMessage::AuthFailed { .. } => "auth-failed",
            SignalMessage::JoinVideoSession { .. } => "join-video-session",
            SignalMessage::SessionJoined { .. } => "session-joined",
            SignalMessage::ParticipantJoined { .. } => "participant-joined",
            SignalMessage::ParticipantLeft { .. } => "participant-left",
            SignalMessage::LeaveVideoSession { .. } => "leave-video-session",
            SignalMessage::Offer { .. } => "webrtc-offer",
            SignalMessage::Answer { .. } => "webrtc-answer",
            SignalMessage::IceCandidate { .. } => "webrtc-ice-candidate",
            SignalMessage::ModerationAlert { .. } => "moderation-alert",
            SignalMessage::ModerationWarning { .. } => "moderation-warning",
            SignalMessage::SessionJoinBlocked { .. } => "session-join-blocked",
            SignalMessage::Error { .. } => "error",
        }
    }

    /// Target of a relayed negotiation message
    pub fn relay_target(&self) -> Option<(&str, &str)> {
        match self {
            SignalMessage::Offer {
                session_id,
                target_identity,
                ..
            }
            | SignalMessage::Answer {
                session_id,
                target_identity,
                ..
            }
            | SignalMessage::IceCandidate {
                session_id,
                target_identity,
                ..
            } => Some((session_id.as_str(), target_identity.as_str())),
            _ => None,
        }
    }

    /// Copy of a relayed message with the sender's authenticated identity stamped in
    pub fn stamped(&self, sender: &str) -> Option<SignalMessage> {
        let mut msg = self.clone();
        match &mut msg {
            SignalMessage::Offer { from_identity, .. }
            | SignalMessage::Answer { from_identity, .. }
            | SignalMessage::IceCandidate { from_identity, .. } => {
                *from_identity = Some(sender.to_string());
                Some(msg)
            }
            _ => None,
        }
    }

    /// Whether a client may send this message type
    pub fn is_client_originated(&self) -> bool {
        matches!(
            self,
            SignalMessage::Authenticate { .. }
                | SignalMessage::JoinVideoSession { .. }
                | SignalMessage::LeaveVideoSession { .. }
                | SignalMessage::Offer { .. }
                | SignalMessage::Answer { .. }
                | SignalMessage::IceCandidate { .. }
        )
    }

    pub fn error(message: impl Into<String>) -> Self {
        SignalMessage::Error {
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_json(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }
}
