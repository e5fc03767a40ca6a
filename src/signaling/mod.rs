//! Signaling protocol shared by the relay and the session client

pub mod protocol;

pub use protocol::{IceCandidate, ParticipantInfo, Role, SignalMessage};
