//! Health scoring
//!
//! Maps one aggregate network sample to a 0-100 score and a discrete band.
//! Pure: no state is carried between samples.

use serde::{Deserialize, Serialize};

/// Aggregate network sample for one stats tick
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NetworkMetrics {
    /// Packet loss in percent (0-100)
    pub packet_loss: f64,
    /// Round-trip time in milliseconds
    pub rtt_ms: f64,
    /// Jitter in milliseconds
    pub jitter_ms: f64,
    /// Video freezes observed since the previous sample
    pub freeze_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_bitrate_kbps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub audio_bitrate_kbps: Option<f64>,
}

/// Discrete quality band, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Fair,
    Poor,
    Critical,
}

impl ConnectionQuality {
    /// Good or excellent
    pub fn is_healthy(self) -> bool {
        matches!(self, Self::Excellent | Self::Good)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Excellent => "excellent",
            Self::Good => "good",
            Self::Fair => "fair",
            Self::Poor => "poor",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for ConnectionQuality {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HealthScore {
    pub score: u8,
    pub quality: ConnectionQuality,
}

/// Scoring weights and band cut-offs
///
/// Each metric contributes a capped penalty subtracted from 100. Latency
/// metrics are only penalized above their "good" threshold.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthPolicy {
    /// Points per percent of packet loss
    pub loss_penalty_per_percent: f64,
    pub loss_penalty_max: f64,
    /// RTT at or below this costs nothing
    pub rtt_good_ms: f64,
    /// Points per millisecond above `rtt_good_ms`
    pub rtt_penalty_per_ms: f64,
    pub rtt_penalty_max: f64,
    pub jitter_good_ms: f64,
    pub jitter_penalty_per_ms: f64,
    pub jitter_penalty_max: f64,
    pub freeze_penalty_each: f64,
    pub freeze_penalty_max: f64,
    /// Lowest score in each band
    pub excellent_min: u8,
    pub good_min: u8,
    pub fair_min: u8,
    pub poor_min: u8,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            loss_penalty_per_percent: 4.0,
            loss_penalty_max: 40.0,
            rtt_good_ms: 100.0,
            rtt_penalty_per_ms: 0.1,
            rtt_penalty_max: 25.0,
            jitter_good_ms: 20.0,
            jitter_penalty_per_ms: 0.5,
            jitter_penalty_max: 15.0,
            freeze_penalty_each: 5.0,
            freeze_penalty_max: 20.0,
            excellent_min: 85,
            good_min: 70,
            fair_min: 50,
            poor_min: 30,
        }
    }
}

impl HealthPolicy {
    /// Score one sample
    pub fn score(&self, metrics: &NetworkMetrics) -> HealthScore {
        let loss = penalty(metrics.packet_loss, 0.0, self.loss_penalty_per_percent, self.loss_penalty_max);
        let rtt = penalty(metrics.rtt_ms, self.rtt_good_ms, self.rtt_penalty_per_ms, self.rtt_penalty_max);
        let jitter = penalty(
            metrics.jitter_ms,
            self.jitter_good_ms,
            self.jitter_penalty_per_ms,
            self.jitter_penalty_max,
        );
        let freezes = penalty(
            metrics.freeze_count as f64,
            0.0,
            self.freeze_penalty_each,
            self.freeze_penalty_max,
        );

        let score = (100.0 - loss - rtt - jitter - freezes).clamp(0.0, 100.0).round() as u8;
        HealthScore {
            score,
            quality: self.band(score),
        }
    }

    /// Band for a score
    pub fn band(&self, score: u8) -> ConnectionQuality {
        if score >= self.excellent_min {
            ConnectionQuality::Excellent
        } else if score >= self.good_min {
            ConnectionQuality::Good
        } else if score >= self.fair_min {
            ConnectionQuality::Fair
        } else if score >= self.poor_min {
            ConnectionQuality::Poor
        } else {
            ConnectionQuality::Critical
        }
    }
}

fn penalty(value: f64, free_below: f64, per_unit: f64, max: f64) -> f64 {
    // NaN from a broken stats report counts as no data
    if !value.is_finite() {
        return 0.0;
    }
    ((value - free_below).max(0.0) * per_unit).min(max)
}

/// Score one sample with the default policy
pub fn score(metrics: &NetworkMetrics) -> HealthScore {
    HealthPolicy::default().score(metrics)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(packet_loss: f64, rtt_ms: f64, jitter_ms: f64, freeze_count: u32) -> NetworkMetrics {
        NetworkMetrics {
            packet_loss,
            rtt_ms,
            jitter_ms,
            freeze_count,
            ..Default::default()
        }
    }

    #[test]
    fn test_clean_link_is_healthy() {
        let result = score(&sample(0.5, 40.0, 8.0, 0));
        assert!(result.quality.is_healthy());
        assert_eq!(result.quality, ConnectionQuality::Excellent);
        assert_eq!(result.score, 98);
    }

    #[test]
    fn test_broken_link_is_critical() {
        let result = score(&sample(15.0, 400.0, 80.0, 4));
        assert_eq!(result.quality, ConnectionQuality::Critical);
        assert_eq!(result.score, 0);
    }

    #[test]
    fn test_bands_are_ordered() {
        let policy = HealthPolicy::default();
        let mut previous = policy.band(100);
        for s in (0..=100u8).rev() {
            let band = policy.band(s);
            assert!(band as u8 >= previous as u8, "band improved as score fell at {}", s);
            previous = band;
        }
    }

    #[test]
    fn test_moderate_loss_is_fair() {
        // 6% loss -> 24 points, 150ms rtt -> 5 points
        let result = score(&sample(6.0, 150.0, 10.0, 0));
        assert_eq!(result.score, 71);
        assert_eq!(result.quality, ConnectionQuality::Good);

        let result = score(&sample(6.0, 150.0, 10.0, 2));
        assert_eq!(result.score, 61);
        assert_eq!(result.quality, ConnectionQuality::Fair);
    }

    #[test]
    fn test_non_finite_metrics_ignored() {
        let result = score(&sample(f64::NAN, 40.0, 8.0, 0));
        assert_eq!(result.score, 100);
    }

    #[test]
    fn test_policy_partial_toml() {
        let policy: HealthPolicy = toml::from_str("good_min = 75").unwrap();
        assert_eq!(policy.good_min, 75);
        assert_eq!(policy.excellent_min, 85);
    }
}
