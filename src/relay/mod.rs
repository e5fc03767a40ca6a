//! Signaling relay server
//!
//! A thin per-session broadcast hub. Clients authenticate, join a session,
//! and exchange offers, answers and ICE candidates with exactly one named
//! peer at a time. The relay never inspects negotiation payloads.
//!
//! ```text
//! client A ──ws──┐                      ┌──ws── client B
//!                ├── RelayHub ── RelayState (sessions, members)
//! client C ──ws──┘        │
//!                          └── moderation endpoints (alert / warning / block)
//! ```

pub mod auth;
pub mod hub;
pub mod routes;
pub mod state;
pub mod ws;

use std::sync::Arc;

pub use auth::{build_authenticator, Authenticator, OpenAuthenticator, SharedSecretAuthenticator};
pub use hub::{Outgoing, RelayHub};
pub use routes::create_router;
pub use state::{ConnectionId, Outbound, RelayState};

use crate::config::ConfigStore;
use crate::error::Result;

/// Shared state for the relay's HTTP and WebSocket handlers
pub struct RelayAppState {
    pub config: ConfigStore,
    pub hub: Arc<RelayHub>,
}

impl RelayAppState {
    pub fn new(config: ConfigStore) -> Result<Arc<Self>> {
        let authenticator = build_authenticator(&config.get().relay.auth)?;
        Ok(Arc::new(Self {
            config,
            hub: Arc::new(RelayHub::new(authenticator)),
        }))
    }
}
