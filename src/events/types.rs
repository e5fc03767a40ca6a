//! Session event types
//!
//! Events the engine emits for the surrounding application to display or log.

use serde::{Deserialize, Serialize};

use crate::client::PeerState;
use crate::quality::{ConnectionQuality, QualityLevel};
use crate::signaling::Role;

/// Session event enumeration
///
/// Serialized as:
/// ```json
/// {
///   "event": "participant.joined",
///   "data": { "identity": "student-7", "role": "student" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data")]
pub enum SessionEvent {
    // ============================================================================
    // Membership
    // ============================================================================
    #[serde(rename = "participant.joined")]
    ParticipantJoined { identity: String, role: Role },

    #[serde(rename = "participant.left")]
    ParticipantLeft { identity: String },

    /// A remote audio or video track arrived for a participant
    #[serde(rename = "participant.track_added")]
    RemoteTrackAdded {
        identity: String,
        /// "audio" or "video"
        kind: String,
        track_id: String,
    },

    // ============================================================================
    // Connection quality
    // ============================================================================
    /// Health band changed
    #[serde(rename = "connection.quality_changed")]
    QualityChanged {
        quality: ConnectionQuality,
        score: u8,
    },

    /// Video ladder rung or bitrate cap changed
    #[serde(rename = "connection.level_changed")]
    LevelChanged {
        level: QualityLevel,
        max_bitrate_kbps: u32,
    },

    /// ICE restart wave started
    #[serde(rename = "connection.repair_started")]
    RepairStarted { attempt: u32, peers: usize },

    /// Transport state of one peer connection
    #[serde(rename = "connection.peer_state")]
    PeerStateChanged { identity: String, state: PeerState },

    // ============================================================================
    // Moderation
    // ============================================================================
    #[serde(rename = "moderation.alert")]
    ModerationAlert { message: String },

    #[serde(rename = "moderation.warning")]
    ModerationWarning { message: String },

    /// Moderation removed the local participant; not retryable
    #[serde(rename = "session.blocked")]
    SessionBlocked { reason: String },

    // ============================================================================
    // Session lifecycle
    // ============================================================================
    #[serde(rename = "session.joined")]
    SessionJoined {
        session_id: String,
        participants: usize,
        audio_only: bool,
    },

    /// User-visible failure with a human-readable reason
    #[serde(rename = "session.error")]
    SessionError { message: String, retryable: bool },

    #[serde(rename = "session.ended")]
    SessionEnded,

    #[serde(rename = "screenshare.started")]
    ScreenShareStarted,

    #[serde(rename = "screenshare.stopped")]
    ScreenShareStopped,
}

impl SessionEvent {
    /// Get the event name (for topic matching)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ParticipantJoined { .. } => "participant.joined",
            Self::ParticipantLeft { .. } => "participant.left",
            Self::RemoteTrackAdded { .. } => "participant.track_added",
            Self::QualityChanged { .. } => "connection.quality_changed",
            Self::LevelChanged { .. } => "connection.level_changed",
            Self::RepairStarted { .. } => "connection.repair_started",
            Self::PeerStateChanged { .. } => "connection.peer_state",
            Self::ModerationAlert { .. } => "moderation.alert",
            Self::ModerationWarning { .. } => "moderation.warning",
            Self::SessionBlocked { .. } => "session.blocked",
            Self::SessionJoined { .. } => "session.joined",
            Self::SessionError { .. } => "session.error",
            Self::SessionEnded => "session.ended",
            Self::ScreenShareStarted => "screenshare.started",
            Self::ScreenShareStopped => "screenshare.stopped",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports wildcards:
    /// - `*` matches all events
    /// - `connection.*` matches all connection events
    /// - `participant.joined` matches exact event
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name
                .strip_prefix(prefix)
                .map(|rest| rest.starts_with('.'))
                .unwrap_or(false)
        } else {
            event_name == topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_name_matches_serde_tag() {
        let event = SessionEvent::QualityChanged {
            quality: ConnectionQuality::Poor,
            score: 41,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["event"], event.event_name());
        assert_eq!(value["data"]["quality"], "poor");
    }

    #[test]
    fn test_matches_topic() {
        let event = SessionEvent::ParticipantJoined {
            identity: "student-7".to_string(),
            role: Role::Student,
        };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("participant.*"));
        assert!(event.matches_topic("participant.joined"));
        assert!(!event.matches_topic("participant.left"));
        assert!(!event.matches_topic("connection.*"));
        assert!(!event.matches_topic("part.*"));
    }
}
