//! Stats aggregation
//!
//! Turns cumulative per-peer transport counters into one `NetworkMetrics`
//! sample per tick. Most metrics are averaged across peers; freeze count
//! takes the maximum so a single stalled peer is not diluted.

use std::collections::HashMap;
use std::time::Instant;

use super::health::NetworkMetrics;

/// Cumulative counters read from one peer connection
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RawPeerStats {
    /// Packets the remote side reports as received from us
    pub packets_received: u64,
    /// Packets the remote side reports as lost
    pub packets_lost: u64,
    /// Current round-trip time, if measured yet
    pub rtt_ms: Option<f64>,
    /// Interarrival jitter, if the transport reports it
    pub jitter_ms: Option<f64>,
    pub video_packets_received: u64,
    pub video_bytes_received: u64,
    pub audio_bytes_received: u64,
    /// Remote video is expected (track received and not audio-only)
    pub expects_video: bool,
}

#[derive(Debug, Clone)]
struct PeerSnapshot {
    raw: RawPeerStats,
    at: Instant,
    last_rtt_ms: Option<f64>,
    jitter_estimate_ms: f64,
}

#[derive(Debug, Clone, Default)]
struct PeerMetrics {
    packet_loss: f64,
    rtt_ms: Option<f64>,
    jitter_ms: f64,
    freezes: u32,
    video_kbps: Option<f64>,
    audio_kbps: Option<f64>,
}

/// Per-peer delta tracking across ticks
#[derive(Debug, Default)]
pub struct StatsCollector {
    previous: HashMap<String, PeerSnapshot>,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Aggregate one tick. Returns `None` when no peer reported.
    pub fn sample(&mut self, peers: &[(String, RawPeerStats)], now: Instant) -> Option<NetworkMetrics> {
        self.previous
            .retain(|identity, _| peers.iter().any(|(id, _)| id == identity));

        if peers.is_empty() {
            return None;
        }

        let per_peer: Vec<PeerMetrics> = peers
            .iter()
            .map(|(identity, raw)| self.peer_metrics(identity, raw, now))
            .collect();

        let count = per_peer.len() as f64;
        let packet_loss = per_peer.iter().map(|m| m.packet_loss).sum::<f64>() / count;
        let jitter_ms = per_peer.iter().map(|m| m.jitter_ms).sum::<f64>() / count;
        let rtt_ms = mean(per_peer.iter().filter_map(|m| m.rtt_ms)).unwrap_or(0.0);
        let freeze_count = per_peer.iter().map(|m| m.freezes).max().unwrap_or(0);

        Some(NetworkMetrics {
            packet_loss,
            rtt_ms,
            jitter_ms,
            freeze_count,
            video_bitrate_kbps: mean(per_peer.iter().filter_map(|m| m.video_kbps)),
            audio_bitrate_kbps: mean(per_peer.iter().filter_map(|m| m.audio_kbps)),
        })
    }

    fn peer_metrics(&mut self, identity: &str, raw: &RawPeerStats, now: Instant) -> PeerMetrics {
        let prev = self.previous.get(identity);

        let (received, lost) = match prev {
            Some(p) => (
                raw.packets_received.saturating_sub(p.raw.packets_received),
                raw.packets_lost.saturating_sub(p.raw.packets_lost),
            ),
            None => (raw.packets_received, raw.packets_lost),
        };
        let packet_loss = if received + lost == 0 {
            0.0
        } else {
            lost as f64 / (received + lost) as f64 * 100.0
        };

        // RFC 3550 style smoothing over RTT variation when no jitter is reported
        let last_rtt_ms = raw.rtt_ms.or(prev.and_then(|p| p.last_rtt_ms));
        let mut jitter_estimate_ms = prev.map(|p| p.jitter_estimate_ms).unwrap_or(0.0);
        if let (Some(current), Some(previous)) = (raw.rtt_ms, prev.and_then(|p| p.last_rtt_ms)) {
            let d = (current - previous).abs();
            jitter_estimate_ms += (d - jitter_estimate_ms) / 16.0;
        }
        let jitter_ms = raw.jitter_ms.unwrap_or(jitter_estimate_ms);

        let mut metrics = PeerMetrics {
            packet_loss,
            rtt_ms: raw.rtt_ms,
            jitter_ms,
            ..Default::default()
        };

        if let Some(p) = prev {
            let secs = now.duration_since(p.at).as_secs_f64();
            if secs > 0.0 {
                let video_bytes = raw.video_bytes_received.saturating_sub(p.raw.video_bytes_received);
                let audio_bytes = raw.audio_bytes_received.saturating_sub(p.raw.audio_bytes_received);
                metrics.video_kbps = Some(video_bytes as f64 * 8.0 / 1000.0 / secs);
                metrics.audio_kbps = Some(audio_bytes as f64 * 8.0 / 1000.0 / secs);
            }
            if raw.expects_video
                && p.raw.expects_video
                && raw.video_packets_received == p.raw.video_packets_received
            {
                metrics.freezes = 1;
            }
        }

        self.previous.insert(
            identity.to_string(),
            PeerSnapshot {
                raw: raw.clone(),
                at: now,
                last_rtt_ms,
                jitter_estimate_ms,
            },
        );

        metrics
    }
}

fn mean(values: impl Iterator<Item = f64>) -> Option<f64> {
    let (sum, n) = values.fold((0.0, 0usize), |(s, n), v| (s + v, n + 1));
    (n > 0).then(|| sum / n as f64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn raw(received: u64, lost: u64, rtt: f64, video_packets: u64) -> RawPeerStats {
        RawPeerStats {
            packets_received: received,
            packets_lost: lost,
            rtt_ms: Some(rtt),
            jitter_ms: Some(5.0),
            video_packets_received: video_packets,
            video_bytes_received: video_packets * 1000,
            audio_bytes_received: 0,
            expects_video: true,
        }
    }

    #[test]
    fn test_empty_tick() {
        let mut collector = StatsCollector::new();
        assert!(collector.sample(&[], Instant::now()).is_none());
    }

    #[test]
    fn test_mean_loss_and_max_freezes() {
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_secs(3);
        let mut collector = StatsCollector::new();

        collector.sample(
            &[
                ("a".to_string(), raw(100, 0, 40.0, 100)),
                ("b".to_string(), raw(100, 0, 60.0, 100)),
            ],
            t0,
        );

        // a: 10 lost of 100 -> 10%, video stalled; b: clean, flowing
        let metrics = collector
            .sample(
                &[
                    ("a".to_string(), raw(190, 10, 40.0, 100)),
                    ("b".to_string(), raw(200, 0, 60.0, 250)),
                ],
                t1,
            )
            .unwrap();

        assert!((metrics.packet_loss - 5.0).abs() < 1e-9);
        assert!((metrics.rtt_ms - 50.0).abs() < 1e-9);
        assert_eq!(metrics.freeze_count, 1);
        assert!(metrics.video_bitrate_kbps.is_some());
    }

    #[test]
    fn test_first_sample_has_no_freeze_or_bitrate() {
        let mut collector = StatsCollector::new();
        let metrics = collector
            .sample(&[("a".to_string(), raw(0, 0, 30.0, 0))], Instant::now())
            .unwrap();
        assert_eq!(metrics.freeze_count, 0);
        assert_eq!(metrics.packet_loss, 0.0);
        assert!(metrics.video_bitrate_kbps.is_none());
    }

    #[test]
    fn test_jitter_estimated_from_rtt_when_missing() {
        let t0 = Instant::now();
        let mut collector = StatsCollector::new();
        let mut stats = raw(10, 0, 40.0, 10);
        stats.jitter_ms = None;

        collector.sample(&[("a".to_string(), stats.clone())], t0);
        stats.rtt_ms = Some(200.0);
        stats.video_packets_received = 20;
        let metrics = collector
            .sample(&[("a".to_string(), stats)], t0 + Duration::from_secs(3))
            .unwrap();
        assert!((metrics.jitter_ms - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_departed_peers_forgotten() {
        let t0 = Instant::now();
        let mut collector = StatsCollector::new();
        collector.sample(&[("a".to_string(), raw(10, 0, 40.0, 10))], t0);
        collector.sample(&[("b".to_string(), raw(10, 0, 40.0, 10))], t0);
        assert!(!collector.previous.contains_key("a"));
    }
}
