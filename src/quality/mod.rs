//! Connection quality: stats aggregation, health scoring and the adaptive
//! controller that acts on the score.

pub mod controller;
pub mod health;
pub mod stats;

pub use controller::{
    ControllerState, QualityCommand, QualityController, QualityLevel, QualityPolicy, RepairLatch,
    VideoProfile,
};
pub use health::{ConnectionQuality, HealthPolicy, HealthScore, NetworkMetrics};
pub use stats::{RawPeerStats, StatsCollector};
