//! Adaptive quality controller
//!
//! Closed loop over the health band: steps a video resolution ladder, caps
//! the target bitrate, and escalates to ICE restart when softer measures are
//! not enough. All timing uses caller-supplied `Instant`s so the loop can be
//! driven with simulated time.
//!
//! Anti-oscillation rules:
//! - ladder changes in either direction are at least `min_change_interval_secs` apart
//! - upgrades need `upgrade_stable_secs` of continuous good/excellent samples
//! - repairs need `poor_threshold_secs` of continuous fair-or-worse samples and
//!   an exponentially growing gap since the previous attempt

use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use super::health::ConnectionQuality;

/// Rungs of the video ladder, best first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum QualityLevel {
    #[serde(rename = "720p")]
    Hd720,
    #[serde(rename = "480p")]
    Sd480,
    #[serde(rename = "360p")]
    Ld360,
    #[serde(rename = "audio-only")]
    AudioOnly,
}

impl QualityLevel {
    /// One rung lower, `None` at the bottom
    pub fn step_down(self) -> Option<Self> {
        match self {
            Self::Hd720 => Some(Self::Sd480),
            Self::Sd480 => Some(Self::Ld360),
            Self::Ld360 => Some(Self::AudioOnly),
            Self::AudioOnly => None,
        }
    }

    /// One rung higher, `None` at the top
    pub fn step_up(self) -> Option<Self> {
        match self {
            Self::Hd720 => None,
            Self::Sd480 => Some(Self::Hd720),
            Self::Ld360 => Some(Self::Sd480),
            Self::AudioOnly => Some(Self::Ld360),
        }
    }

    /// Bitrate cap when this rung is reached normally
    pub fn bitrate_kbps(self) -> u32 {
        match self {
            Self::Hd720 => 1500,
            Self::Sd480 => 800,
            Self::Ld360 => 500,
            Self::AudioOnly => 200,
        }
    }

    /// Bitrate cap when this rung is reached by a poor-quality cut
    pub fn degraded_bitrate_kbps(self) -> u32 {
        match self {
            Self::Hd720 => 1000,
            Self::Sd480 => 500,
            Self::Ld360 => 300,
            Self::AudioOnly => 200,
        }
    }

    /// Frame size for the encoder, `None` when video is off
    pub fn resolution(self) -> Option<(u32, u32)> {
        match self {
            Self::Hd720 => Some((1280, 720)),
            Self::Sd480 => Some((854, 480)),
            Self::Ld360 => Some((640, 360)),
            Self::AudioOnly => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Hd720 => "720p",
            Self::Sd480 => "480p",
            Self::Ld360 => "360p",
            Self::AudioOnly => "audio-only",
        }
    }
}

impl std::fmt::Display for QualityLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Actuator settings for the outbound video sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoProfile {
    pub level: QualityLevel,
    pub max_bitrate_kbps: u32,
    /// The video sender stays attached but sends nothing while disabled
    pub video_enabled: bool,
}

impl VideoProfile {
    pub fn new(level: QualityLevel, max_bitrate_kbps: u32) -> Self {
        Self {
            level,
            max_bitrate_kbps,
            video_enabled: level != QualityLevel::AudioOnly,
        }
    }
}

impl Default for VideoProfile {
    fn default() -> Self {
        Self::new(QualityLevel::Hd720, QualityLevel::Hd720.bitrate_kbps())
    }
}

/// Quality loop policy
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QualityPolicy {
    /// Continuous fair-or-worse time before any repair
    pub poor_threshold_secs: u64,
    /// Continuous good-or-better time before a step up
    pub upgrade_stable_secs: u64,
    /// Minimum gap between two ladder changes
    pub min_change_interval_secs: u64,
    /// Gap after the first repair; doubles with each further attempt
    pub repair_backoff_base_secs: u64,
    /// Repairs stop after this many attempts until quality recovers
    pub max_repair_attempts: u32,
    /// Latch hold time after an ICE restart wave completes
    pub repair_cooldown_secs: u64,
    /// Latch is force-released if a wave never reports completion
    pub repair_timeout_secs: u64,
}

impl Default for QualityPolicy {
    fn default() -> Self {
        Self {
            poor_threshold_secs: 10,
            upgrade_stable_secs: 30,
            min_change_interval_secs: 60,
            repair_backoff_base_secs: 30,
            max_repair_attempts: 5,
            repair_cooldown_secs: 5,
            repair_timeout_secs: 30,
        }
    }
}

impl QualityPolicy {
    /// Required gap since the last attempt, given attempts made so far
    pub fn repair_backoff(&self, attempts: u32) -> Duration {
        let exp = attempts.saturating_sub(1).min(16);
        Duration::from_secs(self.repair_backoff_base_secs.saturating_mul(1u64 << exp))
    }
}

/// ICE restart exclusion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairLatch {
    Idle,
    InProgress { started_at: Instant },
    CoolingDown { until: Instant },
}

/// Repair bookkeeping
#[derive(Debug, Clone)]
pub struct RepairState {
    pub last_attempt_at: Option<Instant>,
    pub attempt_count: u32,
    pub latch: RepairLatch,
    pub poor_since: Option<Instant>,
}

/// Everything the controller mutates, in one place
#[derive(Debug, Clone)]
pub struct ControllerState {
    pub profile: VideoProfile,
    pub quality: Option<ConnectionQuality>,
    pub good_since: Option<Instant>,
    pub last_change_at: Option<Instant>,
    pub repair: RepairState,
}

impl ControllerState {
    fn new(profile: VideoProfile) -> Self {
        Self {
            profile,
            quality: None,
            good_since: None,
            last_change_at: None,
            repair: RepairState {
                last_attempt_at: None,
                attempt_count: 0,
                latch: RepairLatch::Idle,
                poor_since: None,
            },
        }
    }
}

/// Side effects requested by one evaluation
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QualityCommand {
    /// Health band differs from the previous sample
    BandChanged(ConnectionQuality),
    /// Push new settings to the video sender
    ApplyProfile(VideoProfile),
    /// Renegotiate every peer with an ICE restart offer.
    /// Call [`QualityController::repair_completed`] when the wave is done.
    RestartIce { attempt: u32 },
}

pub struct QualityController {
    policy: QualityPolicy,
    state: ControllerState,
}

impl QualityController {
    pub fn new(policy: QualityPolicy) -> Self {
        Self::with_profile(policy, VideoProfile::default())
    }

    /// Start from a given rung, e.g. audio-only when no camera was found
    pub fn with_profile(policy: QualityPolicy, profile: VideoProfile) -> Self {
        Self {
            policy,
            state: ControllerState::new(profile),
        }
    }

    pub fn state(&self) -> &ControllerState {
        &self.state
    }

    pub fn profile(&self) -> VideoProfile {
        self.state.profile
    }

    pub fn set_policy(&mut self, policy: QualityPolicy) {
        self.policy = policy;
    }

    /// Feed one health sample
    pub fn evaluate(&mut self, quality: ConnectionQuality, now: Instant) -> Vec<QualityCommand> {
        let mut commands = Vec::new();

        if self.state.quality != Some(quality) {
            debug!("Connection quality {:?} -> {}", self.state.quality, quality);
            self.state.quality = Some(quality);
            commands.push(QualityCommand::BandChanged(quality));
        }

        self.release_latch(now);

        if quality.is_healthy() {
            self.on_healthy(now, &mut commands);
        } else {
            self.on_degraded(quality, now, &mut commands);
        }

        commands
    }

    /// The ICE restart wave finished; hold the latch for the cooldown
    pub fn repair_completed(&mut self, now: Instant) {
        if let RepairLatch::InProgress { .. } = self.state.repair.latch {
            let until = now + Duration::from_secs(self.policy.repair_cooldown_secs);
            self.state.repair.latch = RepairLatch::CoolingDown { until };
        }
    }

    fn release_latch(&mut self, now: Instant) {
        match self.state.repair.latch {
            RepairLatch::CoolingDown { until } if now >= until => {
                self.state.repair.latch = RepairLatch::Idle;
            }
            RepairLatch::InProgress { started_at }
                if now.duration_since(started_at)
                    >= Duration::from_secs(self.policy.repair_timeout_secs) =>
            {
                warn!("ICE restart wave did not complete, releasing repair latch");
                self.state.repair.latch = RepairLatch::Idle;
            }
            _ => {}
        }
    }

    fn on_healthy(&mut self, now: Instant, commands: &mut Vec<QualityCommand>) {
        let repair = &mut self.state.repair;
        repair.poor_since = None;
        if repair.attempt_count > 0 {
            debug!("Quality recovered, resetting repair attempts");
            repair.attempt_count = 0;
        }

        let good_since = *self.state.good_since.get_or_insert(now);
        if now.duration_since(good_since) < Duration::from_secs(self.policy.upgrade_stable_secs) {
            return;
        }
        if !self.ladder_change_allowed(now) {
            return;
        }
        let Some(next) = self.state.profile.level.step_up() else {
            return;
        };

        info!("Stable connection, stepping up to {}", next);
        self.change_level(next, next.bitrate_kbps(), now, commands);
        // Next step up needs a fresh stable period
        self.state.good_since = Some(now);
    }

    fn on_degraded(&mut self, quality: ConnectionQuality, now: Instant, commands: &mut Vec<QualityCommand>) {
        self.state.good_since = None;
        let poor_since = *self.state.repair.poor_since.get_or_insert(now);

        if now.duration_since(poor_since) < Duration::from_secs(self.policy.poor_threshold_secs) {
            return;
        }
        if self.state.repair.attempt_count >= self.policy.max_repair_attempts {
            return;
        }
        if self.state.repair.latch != RepairLatch::Idle {
            return;
        }
        if let Some(last) = self.state.repair.last_attempt_at {
            let backoff = self.policy.repair_backoff(self.state.repair.attempt_count);
            if now.duration_since(last) < backoff {
                return;
            }
        }

        let level = self.state.profile.level;
        match quality {
            ConnectionQuality::Critical => self.restart_ice(now, commands),
            ConnectionQuality::Poor => match level.step_down() {
                None => self.restart_ice(now, commands),
                Some(next) if self.ladder_change_allowed(now) => {
                    info!("Poor connection, stepping down to {} with reduced bitrate", next);
                    self.change_level(next, next.degraded_bitrate_kbps(), now, commands);
                    self.record_attempt(now);
                }
                Some(_) => {}
            },
            ConnectionQuality::Fair => match level.step_down() {
                Some(next) if self.ladder_change_allowed(now) => {
                    info!("Fair connection, stepping down to {}", next);
                    self.change_level(next, next.bitrate_kbps(), now, commands);
                    self.record_attempt(now);
                }
                _ => {}
            },
            ConnectionQuality::Good | ConnectionQuality::Excellent => {}
        }
    }

    fn ladder_change_allowed(&self, now: Instant) -> bool {
        match self.state.last_change_at {
            Some(last) => {
                now.duration_since(last) >= Duration::from_secs(self.policy.min_change_interval_secs)
            }
            None => true,
        }
    }

    fn change_level(
        &mut self,
        level: QualityLevel,
        bitrate_kbps: u32,
        now: Instant,
        commands: &mut Vec<QualityCommand>,
    ) {
        let bitrate = if level == QualityLevel::AudioOnly {
            QualityLevel::AudioOnly.bitrate_kbps()
        } else {
            bitrate_kbps
        };
        self.state.profile = VideoProfile::new(level, bitrate);
        self.state.last_change_at = Some(now);
        commands.push(QualityCommand::ApplyProfile(self.state.profile));
    }

    fn restart_ice(&mut self, now: Instant, commands: &mut Vec<QualityCommand>) {
        self.record_attempt(now);
        self.state.repair.latch = RepairLatch::InProgress { started_at: now };
        let attempt = self.state.repair.attempt_count;
        warn!(attempt, "Connection degraded, restarting ICE");
        commands.push(QualityCommand::RestartIce { attempt });
    }

    fn record_attempt(&mut self, now: Instant) {
        let repair = &mut self.state.repair;
        repair.attempt_count += 1;
        repair.last_attempt_at = Some(now);
        if repair.attempt_count >= self.policy.max_repair_attempts {
            warn!(
                attempts = repair.attempt_count,
                "Repair attempts exhausted, continuing in degraded mode"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ConnectionQuality::*;

    fn at(t0: Instant, secs: u64) -> Instant {
        t0 + Duration::from_secs(secs)
    }

    fn restarts(commands: &[QualityCommand]) -> usize {
        commands
            .iter()
            .filter(|c| matches!(c, QualityCommand::RestartIce { .. }))
            .count()
    }

    fn profile_change(commands: &[QualityCommand]) -> Option<VideoProfile> {
        commands.iter().find_map(|c| match c {
            QualityCommand::ApplyProfile(p) => Some(*p),
            _ => None,
        })
    }

    #[test]
    fn test_critical_restarts_after_threshold() {
        let t0 = Instant::now();
        let mut ctl = QualityController::new(QualityPolicy::default());

        let first = ctl.evaluate(Critical, t0);
        assert_eq!(first, vec![QualityCommand::BandChanged(Critical)]);
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 9))), 0);

        let cmds = ctl.evaluate(Critical, at(t0, 10));
        assert_eq!(cmds, vec![QualityCommand::RestartIce { attempt: 1 }]);
        // Ladder untouched by an ICE restart
        assert_eq!(ctl.profile().level, QualityLevel::Hd720);
    }

    #[test]
    fn test_ladder_changes_are_spaced_and_single_step() {
        let t0 = Instant::now();
        let mut ctl = QualityController::new(QualityPolicy::default());
        let mut changes: Vec<(u64, QualityLevel)> = Vec::new();

        for s in (0..400).step_by(3) {
            if let Some(p) = profile_change(&ctl.evaluate(Fair, at(t0, s))) {
                changes.push((s, p.level));
            }
        }

        let levels: Vec<_> = changes.iter().map(|(_, l)| *l).collect();
        assert_eq!(
            levels,
            vec![QualityLevel::Sd480, QualityLevel::Ld360, QualityLevel::AudioOnly]
        );
        for pair in changes.windows(2) {
            assert!(pair[1].0 - pair[0].0 >= 60, "changes too close: {:?}", pair);
        }
    }

    #[test]
    fn test_upgrade_requires_stable_period() {
        let t0 = Instant::now();
        let policy = QualityPolicy::default();
        let mut ctl = QualityController::with_profile(
            policy,
            VideoProfile::new(QualityLevel::Ld360, 300),
        );

        assert!(profile_change(&ctl.evaluate(Good, t0)).is_none());
        assert!(profile_change(&ctl.evaluate(Excellent, at(t0, 29))).is_none());
        let up = profile_change(&ctl.evaluate(Good, at(t0, 30))).unwrap();
        assert_eq!(up.level, QualityLevel::Sd480);
        assert_eq!(up.max_bitrate_kbps, 800);

        // A single fair sample resets the stability timer
        ctl.evaluate(Fair, at(t0, 95));
        assert!(profile_change(&ctl.evaluate(Good, at(t0, 100))).is_none());
        assert!(profile_change(&ctl.evaluate(Good, at(t0, 129))).is_none());
        let up = profile_change(&ctl.evaluate(Good, at(t0, 130))).unwrap();
        assert_eq!(up.level, QualityLevel::Hd720);
    }

    #[test]
    fn test_attempts_reset_on_recovery() {
        let t0 = Instant::now();
        let mut ctl = QualityController::new(QualityPolicy::default());

        ctl.evaluate(Critical, t0);
        ctl.evaluate(Critical, at(t0, 10));
        assert_eq!(ctl.state().repair.attempt_count, 1);

        ctl.evaluate(Good, at(t0, 12));
        assert_eq!(ctl.state().repair.attempt_count, 0);
        assert!(ctl.state().repair.poor_since.is_none());
    }

    #[test]
    fn test_backoff_doubles_and_caps() {
        let t0 = Instant::now();
        let mut ctl = QualityController::new(QualityPolicy::default());
        let mut attempts_at = Vec::new();

        for s in 0..2000 {
            let now = at(t0, s);
            if restarts(&ctl.evaluate(Critical, now)) > 0 {
                attempts_at.push(s);
                ctl.repair_completed(now);
            }
            assert!(ctl.state().repair.attempt_count <= 5);
        }

        assert_eq!(attempts_at, vec![10, 40, 100, 220, 460]);
    }

    #[test]
    fn test_latch_blocks_overlapping_restarts() {
        let t0 = Instant::now();
        let policy = QualityPolicy {
            repair_backoff_base_secs: 1,
            ..Default::default()
        };
        let mut ctl = QualityController::new(policy);

        ctl.evaluate(Critical, t0);
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 10))), 1);
        // Wave still running
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 20))), 0);

        ctl.repair_completed(at(t0, 21));
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 25))), 0);
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 26))), 1);
    }

    #[test]
    fn test_stuck_latch_times_out() {
        let t0 = Instant::now();
        let mut ctl = QualityController::new(QualityPolicy::default());

        ctl.evaluate(Critical, t0);
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 10))), 1);
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 39))), 0);
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 40))), 1);
    }

    #[test]
    fn test_poor_cuts_bitrate_then_escalates_at_bottom() {
        let t0 = Instant::now();
        let mut ctl = QualityController::with_profile(
            QualityPolicy::default(),
            VideoProfile::new(QualityLevel::Sd480, 800),
        );

        ctl.evaluate(Poor, t0);
        let p = profile_change(&ctl.evaluate(Poor, at(t0, 10))).unwrap();
        assert_eq!(p, VideoProfile::new(QualityLevel::Ld360, 300));

        let p = profile_change(&ctl.evaluate(Poor, at(t0, 70))).unwrap();
        assert_eq!(p.level, QualityLevel::AudioOnly);
        assert_eq!(p.max_bitrate_kbps, 200);
        assert!(!p.video_enabled);

        // Attempt 3 may run 60s after attempt 2
        assert_eq!(restarts(&ctl.evaluate(Poor, at(t0, 129))), 0);
        assert_eq!(restarts(&ctl.evaluate(Poor, at(t0, 130))), 1);
    }

    #[test]
    fn test_policy_change_applies_to_running_timers() {
        let t0 = Instant::now();
        let mut ctl = QualityController::new(QualityPolicy::default());
        ctl.evaluate(Critical, t0);
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 3))), 0);

        ctl.set_policy(QualityPolicy {
            poor_threshold_secs: 4,
            ..QualityPolicy::default()
        });
        assert_eq!(restarts(&ctl.evaluate(Critical, at(t0, 4))), 1);
    }

    #[test]
    fn test_backoff_schedule() {
        let policy = QualityPolicy::default();
        let secs: Vec<u64> = (1..=5).map(|n| policy.repair_backoff(n).as_secs()).collect();
        assert_eq!(secs, vec![30, 60, 120, 240, 480]);
    }
}
