//! Session client engine
//!
//! `core` and `negotiation` are pure state machines driven by messages and
//! return the effects to perform. `peer` and `signaling` own the WebRTC and
//! relay I/O. `controller` wires them together on one event-loop task.

pub mod controller;
pub mod core;
pub mod media;
pub mod negotiation;
pub mod peer;
pub mod signaling;

pub use controller::{with_join_retries, ParticipantSnapshot, SessionClient, SessionHandle};
pub use core::{Command, RemoteParticipant, SessionCore};
pub use media::{
    acquire_local_media, LocalMedia, LocalTrack, MediaDevices, SyntheticDevices, TrackKind, TrackSource,
};
pub use negotiation::{Negotiator, PeerOrigin, PeerState, Politeness, SignalingPhase};
pub use peer::{PeerContext, PeerEvent, PeerHandle};
pub use signaling::{JoinRequest, RelayEvent, RelayLink};
