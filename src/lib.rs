//! classroom-rtc - real-time video sessions for live classes
//!
//! The crate carries both halves of a session:
//!
//! - `relay`: the signaling server that authenticates participants, tracks
//!   session membership and forwards negotiation messages to one named peer.
//! - `client`: the participant engine that joins through the relay, runs
//!   perfect negotiation with every peer and adapts video quality to the
//!   measured network health.

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod quality;
pub mod relay;
pub mod signaling;
pub mod telemetry;
pub mod utils;

pub use error::{AppError, Result};
