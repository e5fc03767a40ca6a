//! Perfect negotiation for one remote peer
//!
//! Pure bookkeeping: decides who offers, what to do with a colliding offer,
//! and when remote candidates may be applied. The peer worker performs the
//! actual SDP operations and reports back through these methods.
//!
//! Roles: the participant already in the session is impolite toward a
//! newcomer and offers first; the newcomer is polite. When neither side
//! knows who came first, the lexicographically smaller identity is impolite.
//! On collision the impolite side ignores the incoming offer and the polite
//! side rolls back its own offer before accepting.

use serde::{Deserialize, Serialize};

use crate::signaling::IceCandidate;

/// Transport lifecycle of one peer connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerState {
    Idle,
    Negotiating,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl PeerState {
    /// Soft failure: handled by the repair loop, not by teardown
    pub fn is_degraded(self) -> bool {
        matches!(self, Self::Disconnected | Self::Failed)
    }
}

impl std::fmt::Display for PeerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Negotiating => "negotiating",
            Self::Connected => "connected",
            Self::Disconnected => "disconnected",
            Self::Failed => "failed",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// How the remote participant became known
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerOrigin {
    /// Listed in our `session-joined`: they were here first
    PresentAtJoin,
    /// Announced by `participant-joined`: we were here first
    JoinedAfterUs,
    /// First heard of through their offer
    Unknown,
}

/// Local side's role toward one remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Politeness {
    Polite,
    Impolite,
}

impl Politeness {
    pub fn resolve(local: &str, remote: &str, origin: PeerOrigin) -> Self {
        match origin {
            PeerOrigin::PresentAtJoin => Self::Polite,
            PeerOrigin::JoinedAfterUs => Self::Impolite,
            PeerOrigin::Unknown => {
                if local < remote {
                    Self::Impolite
                } else {
                    Self::Polite
                }
            }
        }
    }

    pub fn is_polite(self) -> bool {
        self == Self::Polite
    }
}

/// Local view of the SDP exchange
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingPhase {
    /// No exchange in flight
    Stable,
    /// Creating and setting a local offer
    MakingOffer,
    /// Local offer sent, waiting for the answer
    HaveLocalOffer,
    /// Remote offer applied, answer being produced
    HaveRemoteOffer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfferDecision {
    /// Collision and we are impolite: keep our offer
    Ignore,
    /// Apply the remote offer and answer it
    Accept,
    /// Collision and we are polite: roll back our offer, then accept
    RollbackThenAccept,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CandidateDecision {
    Apply(IceCandidate),
    /// Held until the remote description is set
    Queued,
    /// Belongs to an offer we ignored
    Dropped,
}

#[derive(Debug)]
pub struct Negotiator {
    politeness: Politeness,
    phase: SignalingPhase,
    /// The offer being made replaces an unanswered one
    superseding: bool,
    remote_description_set: bool,
    ignore_offer: bool,
    pending_candidates: Vec<IceCandidate>,
}

impl Negotiator {
    pub fn new(politeness: Politeness) -> Self {
        Self {
            politeness,
            phase: SignalingPhase::Stable,
            superseding: false,
            remote_description_set: false,
            ignore_offer: false,
            pending_candidates: Vec::new(),
        }
    }

    pub fn politeness(&self) -> Politeness {
        self.politeness
    }

    pub fn phase(&self) -> SignalingPhase {
        self.phase
    }

    pub fn pending_candidates(&self) -> usize {
        self.pending_candidates.len()
    }

    /// Claim the offer slot. `false` if an exchange is already in flight.
    ///
    /// An ICE restart may supersede a local offer that was never answered;
    /// the lost answer is usually the reason for the restart.
    pub fn begin_offer(&mut self, ice_restart: bool) -> bool {
        let free = match self.phase {
            SignalingPhase::Stable => true,
            SignalingPhase::HaveLocalOffer => ice_restart,
            SignalingPhase::MakingOffer | SignalingPhase::HaveRemoteOffer => false,
        };
        if free {
            self.superseding = self.phase == SignalingPhase::HaveLocalOffer;
            self.phase = SignalingPhase::MakingOffer;
        }
        free
    }

    /// Local offer was set and sent
    pub fn offer_sent(&mut self) {
        if self.phase == SignalingPhase::MakingOffer {
            self.phase = SignalingPhase::HaveLocalOffer;
        }
    }

    /// Creating or setting the local offer failed; an earlier unanswered
    /// offer is still outstanding
    pub fn offer_failed(&mut self) {
        if self.phase == SignalingPhase::MakingOffer {
            self.phase = if self.superseding {
                SignalingPhase::HaveLocalOffer
            } else {
                SignalingPhase::Stable
            };
        }
    }

    pub fn on_remote_offer(&mut self) -> OfferDecision {
        let collision = matches!(
            self.phase,
            SignalingPhase::MakingOffer | SignalingPhase::HaveLocalOffer
        );

        self.ignore_offer = collision && !self.politeness.is_polite();
        if self.ignore_offer {
            return OfferDecision::Ignore;
        }

        self.phase = SignalingPhase::HaveRemoteOffer;
        self.remote_description_set = false;
        if collision {
            OfferDecision::RollbackThenAccept
        } else {
            OfferDecision::Accept
        }
    }

    /// Whether a remote answer matches an outstanding local offer
    pub fn on_remote_answer(&mut self) -> bool {
        if self.phase != SignalingPhase::HaveLocalOffer {
            return false;
        }
        self.remote_description_set = false;
        true
    }

    /// Remote description applied; returns the candidates held back so far
    pub fn remote_description_applied(&mut self) -> Vec<IceCandidate> {
        self.remote_description_set = true;
        self.ignore_offer = false;
        if self.phase == SignalingPhase::HaveLocalOffer {
            self.phase = SignalingPhase::Stable;
        }
        std::mem::take(&mut self.pending_candidates)
    }

    /// Answer to a remote offer was set and sent
    pub fn answer_sent(&mut self) {
        if self.phase == SignalingPhase::HaveRemoteOffer {
            self.phase = SignalingPhase::Stable;
        }
    }

    /// Applying a remote description or answering failed
    pub fn exchange_failed(&mut self) {
        self.phase = SignalingPhase::Stable;
    }

    pub fn on_remote_candidate(&mut self, candidate: IceCandidate) -> CandidateDecision {
        if self.ignore_offer {
            return CandidateDecision::Dropped;
        }
        if !self.remote_description_set {
            self.pending_candidates.push(candidate);
            return CandidateDecision::Queued;
        }
        CandidateDecision::Apply(candidate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(n: u32) -> IceCandidate {
        IceCandidate::new(format!("candidate:{} 1 udp 2122260223 10.0.0.{} 5000 typ host", n, n))
    }

    #[test]
    fn test_join_order_decides_politeness() {
        // A joined first; B sees A in session-joined
        assert_eq!(
            Politeness::resolve("B", "A", PeerOrigin::PresentAtJoin),
            Politeness::Polite
        );
        // A sees B in participant-joined
        assert_eq!(
            Politeness::resolve("A", "B", PeerOrigin::JoinedAfterUs),
            Politeness::Impolite
        );
    }

    #[test]
    fn test_tiebreak_is_symmetric() {
        let a = Politeness::resolve("alice", "bob", PeerOrigin::Unknown);
        let b = Politeness::resolve("bob", "alice", PeerOrigin::Unknown);
        assert_eq!(a, Politeness::Impolite);
        assert_eq!(b, Politeness::Polite);
    }

    #[test]
    fn test_clean_round() {
        let mut offerer = Negotiator::new(Politeness::Impolite);
        let mut answerer = Negotiator::new(Politeness::Polite);

        assert!(offerer.begin_offer(false));
        assert!(!offerer.begin_offer(false));
        offerer.offer_sent();

        assert_eq!(answerer.on_remote_offer(), OfferDecision::Accept);
        assert!(answerer.remote_description_applied().is_empty());
        answerer.answer_sent();
        assert_eq!(answerer.phase(), SignalingPhase::Stable);

        assert!(offerer.on_remote_answer());
        offerer.remote_description_applied();
        assert_eq!(offerer.phase(), SignalingPhase::Stable);
    }

    #[test]
    fn test_collision_impolite_ignores() {
        let mut n = Negotiator::new(Politeness::Impolite);
        n.begin_offer(false);
        n.offer_sent();

        assert_eq!(n.on_remote_offer(), OfferDecision::Ignore);
        assert_eq!(n.phase(), SignalingPhase::HaveLocalOffer);
        // Candidates for the ignored offer are dropped
        assert_eq!(n.on_remote_candidate(candidate(1)), CandidateDecision::Dropped);

        // The polite side's answer to our offer still lands
        assert!(n.on_remote_answer());
        n.remote_description_applied();
        assert_eq!(n.on_remote_candidate(candidate(2)), CandidateDecision::Apply(candidate(2)));
    }

    #[test]
    fn test_collision_polite_rolls_back() {
        let mut n = Negotiator::new(Politeness::Polite);
        n.begin_offer(false);

        assert_eq!(n.on_remote_offer(), OfferDecision::RollbackThenAccept);
        assert_eq!(n.phase(), SignalingPhase::HaveRemoteOffer);

        // Our own offer finishing late must not resurrect it
        n.offer_sent();
        assert_eq!(n.phase(), SignalingPhase::HaveRemoteOffer);
        assert!(!n.on_remote_answer());
    }

    #[test]
    fn test_early_candidates_are_queued() {
        let mut n = Negotiator::new(Politeness::Polite);
        assert_eq!(n.on_remote_candidate(candidate(1)), CandidateDecision::Queued);
        assert_eq!(n.on_remote_candidate(candidate(2)), CandidateDecision::Queued);
        assert_eq!(n.pending_candidates(), 2);

        n.on_remote_offer();
        let flushed = n.remote_description_applied();
        assert_eq!(flushed, vec![candidate(1), candidate(2)]);
        assert_eq!(n.on_remote_candidate(candidate(3)), CandidateDecision::Apply(candidate(3)));
    }

    #[test]
    fn test_failed_offer_releases_slot() {
        let mut n = Negotiator::new(Politeness::Impolite);
        assert!(n.begin_offer(false));
        n.offer_failed();
        assert!(n.begin_offer(false));
    }

    #[test]
    fn test_ice_restart_supersedes_unanswered_offer() {
        let mut n = Negotiator::new(Politeness::Polite);
        assert!(n.begin_offer(false));
        n.offer_sent();

        // A plain renegotiation waits for the answer
        assert!(!n.begin_offer(false));
        assert!(n.begin_offer(true));
        assert_eq!(n.phase(), SignalingPhase::MakingOffer);
        n.offer_sent();

        // The answer to the restart offer completes the exchange
        assert!(n.on_remote_answer());
        n.remote_description_applied();
        assert_eq!(n.phase(), SignalingPhase::Stable);
    }

    #[test]
    fn test_ice_restart_waits_while_answering() {
        let mut n = Negotiator::new(Politeness::Impolite);
        assert_eq!(n.on_remote_offer(), OfferDecision::Accept);
        assert!(!n.begin_offer(true));
    }

    #[test]
    fn test_failed_restart_keeps_earlier_offer_outstanding() {
        let mut n = Negotiator::new(Politeness::Impolite);
        assert!(n.begin_offer(false));
        n.offer_sent();

        assert!(n.begin_offer(true));
        n.offer_failed();
        assert_eq!(n.phase(), SignalingPhase::HaveLocalOffer);
        // The late answer to the first offer still applies
        assert!(n.on_remote_answer());
    }
}
