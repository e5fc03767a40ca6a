use serde::{Deserialize, Serialize};

// Policy sections live next to the code that enforces them
pub use crate::quality::controller::QualityPolicy;
pub use crate::quality::health::HealthPolicy;

/// Main application configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    /// Signaling relay server settings
    pub relay: RelayConfig,
    /// STUN/TURN servers handed to every peer connection
    pub ice: IceServersConfig,
    /// Session client settings
    pub client: ClientConfig,
    /// Adaptive quality policy
    pub quality: QualityPolicy,
    /// Health scoring thresholds
    pub health: HealthPolicy,
    /// Telemetry forwarding
    pub telemetry: TelemetryConfig,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Bind address
    pub bind_address: String,
    /// Listen port
    pub port: u16,
    /// WebSocket path clients connect to
    pub ws_path: String,
    /// Ping interval for idle connections
    pub heartbeat_secs: u64,
    /// Connection authentication
    pub auth: RelayAuthConfig,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 8090,
            ws_path: "/api/ws/video".to_string(),
            heartbeat_secs: 30,
            auth: RelayAuthConfig::default(),
        }
    }
}

/// How the relay verifies `authenticate` messages
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum AuthMode {
    /// Any non-empty token is accepted (development only)
    Open,
    /// Tokens are derived from a secret shared with the booking service
    #[default]
    SharedSecret,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(default)]
pub struct RelayAuthConfig {
    pub mode: AuthMode,
    /// Secret used to derive per-identity tokens
    pub shared_secret: Option<String>,
    /// Bearer token for the moderation endpoints; they are disabled when unset
    pub admin_token: Option<String>,
}

/// STUN/TURN server list
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct IceServersConfig {
    /// STUN server URLs
    pub stun_servers: Vec<String>,
    /// TURN server configuration
    pub turn_servers: Vec<TurnServer>,
}

impl Default for IceServersConfig {
    fn default() -> Self {
        Self {
            stun_servers: vec![
                "stun:stun.l.google.com:19302".to_string(),
                "stun:stun1.l.google.com:19302".to_string(),
            ],
            turn_servers: vec![],
        }
    }
}

/// TURN server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TurnServer {
    /// TURN server URLs (e.g., ["turn:turn.example.com:3478?transport=udp", "turn:turn.example.com:3478?transport=tcp"])
    pub urls: Vec<String>,
    /// Username for TURN authentication
    pub username: String,
    /// Credential for TURN authentication
    pub credential: String,
}

/// Session client configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientConfig {
    /// Relay WebSocket URL
    pub relay_url: String,
    /// Upper bound on camera/microphone acquisition
    pub media_timeout_secs: u64,
    /// Upper bound on connect + authenticate + join
    pub handshake_timeout_secs: u64,
    /// Join retries after the first attempt
    pub join_retries: u32,
    /// Backoff grows by this step per retry (2s, 4s, 6s)
    pub join_backoff_step_secs: u64,
    /// Stats sampling cadence
    pub stats_interval_secs: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: "ws://127.0.0.1:8090/api/ws/video".to_string(),
            media_timeout_secs: 10,
            handshake_timeout_secs: 10,
            join_retries: 3,
            join_backoff_step_secs: 2,
            stats_interval_secs: 3,
        }
    }
}

/// Telemetry collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TelemetryConfig {
    /// HTTP endpoint receiving samples; samples are only logged when unset
    pub endpoint: Option<String>,
    /// Per-request timeout
    pub timeout_secs: u64,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            endpoint: None,
            timeout_secs: 5,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [relay]
            port = 9100

            [client]
            join_retries = 5
            "#,
        )
        .unwrap();

        assert_eq!(config.relay.port, 9100);
        assert_eq!(config.relay.ws_path, "/api/ws/video");
        assert_eq!(config.client.join_retries, 5);
        assert_eq!(config.client.media_timeout_secs, 10);
        assert_eq!(config.relay.auth.mode, AuthMode::SharedSecret);
    }

    #[test]
    fn test_turn_servers() {
        let config: AppConfig = toml::from_str(
            r#"
            [[ice.turn_servers]]
            urls = ["turn:turn.example.com:3478?transport=udp"]
            username = "class"
            credential = "secret"
            "#,
        )
        .unwrap();

        assert_eq!(config.ice.turn_servers.len(), 1);
        assert_eq!(config.ice.stun_servers.len(), 2);
    }
}
