//! In-memory peer runtime: lifecycle, traffic accounting, and scoring.
//!
//! Deliberately self-contained — a `Peer` can be scored, rate-limited,
//! and snapshotted for persistence without any reference to the event
//! loop that drives its session.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PeerStatus {
    Dialing,
    Connected,
    Disconnected,
    Banned,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
    pub struct PeerRole: u32 {
        const NONE = 0;
        const FULL = 1 << 0;
        const LIGHT = 1 << 1;
        const MINER = 1 << 2;
        const DA_ONLY = 1 << 3;
        const PROVIDER_AI = 1 << 4;
        const PROVIDER_QPU = 1 << 5;
        const RELAY = 1 << 6;
    }
}

/// Tunable scoring constants. Defaults match the reference values
/// carried through from the original P2P stack's `ScoreParams`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoreParams {
    pub base: f64,
    pub rtt_ref_ms: f64,
    pub rtt_slope: f64,
    pub good_msg_weight: f64,
    pub bad_msg_penalty: f64,
    pub dupe_penalty: f64,
    pub topic_cap: f64,
    pub penalty_decay_half_life_s: f64,
    pub ban_threshold: f64,
    pub uptime_bonus_max: f64,
    pub uptime_bonus_rate: f64,
    pub flap_penalty: f64,
    pub flap_window_s: f64,
}

impl Default for ScoreParams {
    fn default() -> Self {
        Self {
            base: 10.0,
            rtt_ref_ms: 150.0,
            rtt_slope: 0.015,
            good_msg_weight: 0.002,
            bad_msg_penalty: 0.2,
            dupe_penalty: 0.05,
            topic_cap: 15.0,
            penalty_decay_half_life_s: 600.0,
            ban_threshold: -10.0,
            uptime_bonus_max: 20.0,
            uptime_bonus_rate: 0.002,
            flap_penalty: 2.0,
            flap_window_s: 300.0,
        }
    }
}

/// Per-topic validity/duplicate counters feeding the topic-quality term.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TopicScore {
    pub valid_msgs: u64,
    pub invalid_msgs: u64,
    pub duplicate_msgs: u64,
    pub bytes: u64,
}

impl TopicScore {
    pub fn quality_score(&self, params: &ScoreParams) -> f64 {
        let raw = params.good_msg_weight * self.valid_msgs as f64
            - params.bad_msg_penalty * self.invalid_msgs as f64
            - params.dupe_penalty * self.duplicate_msgs as f64;
        raw.clamp(-params.topic_cap, params.topic_cap)
    }
}

/// A named penalty that decays exponentially with half-life
/// `penalty_decay_half_life_s`, measured from `connected_at`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct Penalty {
    pub magnitude: f64,
    pub applied_at_s: f64,
}

fn decay(magnitude: f64, dt_s: f64, half_life_s: f64) -> f64 {
    if half_life_s <= 0.0 || dt_s <= 0.0 {
        return magnitude;
    }
    magnitude * 0.5f64.powf(dt_s / half_life_s)
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerSnapshot {
    pub peer_id: String,
    pub address: String,
    pub roles: u32,
    pub status: PeerStatus,
    pub chain_id: u64,
    pub head_height: u64,
    pub caps: Vec<String>,
    pub last_seen_s: f64,
    pub connected_at_s: f64,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub msgs_in: u64,
    pub msgs_out: u64,
    pub rtt_ms_ewma: f64,
    pub topic_scores: HashMap<String, TopicScore>,
    pub penalties: HashMap<String, f64>,
    pub score: f64,
}

/// Runtime state for one peer.
#[derive(Debug, Clone)]
pub struct Peer {
    pub peer_id: String,
    pub address: String,
    pub roles: PeerRole,
    pub status: PeerStatus,
    pub chain_id: u64,
    pub alg_policy_root: [u8; 32],
    pub head_height: u64,
    pub caps: Vec<String>,
    pub first_seen_s: f64,
    pub last_seen_s: f64,
    pub connected_at_s: f64,
    pub last_disconnect_s: Option<f64>,
    pub bytes_in: u64,
    pub bytes_out: u64,
    pub msgs_in: u64,
    pub msgs_out: u64,
    pub rtt_ms_ewma: f64,
    pub topic_scores: HashMap<String, TopicScore>,
    pub penalties: HashMap<String, Penalty>,
}

impl Peer {
    pub fn new(peer_id: String, address: String, chain_id: u64, now_s: f64) -> Self {
        Self {
            peer_id,
            address,
            roles: PeerRole::NONE,
            status: PeerStatus::Dialing,
            chain_id,
            alg_policy_root: [0u8; 32],
            head_height: 0,
            caps: Vec::new(),
            first_seen_s: now_s,
            last_seen_s: now_s,
            connected_at_s: now_s,
            last_disconnect_s: None,
            bytes_in: 0,
            bytes_out: 0,
            msgs_in: 0,
            msgs_out: 0,
            rtt_ms_ewma: 0.0,
            topic_scores: HashMap::new(),
            penalties: HashMap::new(),
        }
    }

    /// Handshake success: Dialing/Disconnected → Connected. Applies a
    /// flap penalty if the gap since the last disconnect is under the
    /// configured flap window.
    pub fn on_connected(&mut self, now_s: f64, params: &ScoreParams) {
        if let Some(last_disconnect) = self.last_disconnect_s {
            if now_s - last_disconnect < params.flap_window_s {
                self.apply_penalty("flap", params.flap_penalty, now_s);
            }
        }
        self.status = PeerStatus::Connected;
        self.connected_at_s = now_s;
        self.last_seen_s = now_s;
    }

    pub fn on_disconnected(&mut self, now_s: f64) {
        self.status = PeerStatus::Disconnected;
        self.last_disconnect_s = Some(now_s);
        self.last_seen_s = now_s;
    }

    pub fn apply_penalty(&mut self, reason: &str, magnitude: f64, now_s: f64) {
        self.penalties.insert(reason.to_string(), Penalty { magnitude, applied_at_s: now_s });
    }

    pub fn record_inbound(&mut self, topic: &str, bytes: u64, valid: bool, duplicate: bool, now_s: f64) {
        self.bytes_in += bytes;
        self.msgs_in += 1;
        self.last_seen_s = now_s;
        let entry = self.topic_scores.entry(topic.to_string()).or_default();
        entry.bytes += bytes;
        if duplicate {
            entry.duplicate_msgs += 1;
        } else if valid {
            entry.valid_msgs += 1;
        } else {
            entry.invalid_msgs += 1;
        }
    }

    pub fn record_outbound(&mut self, topic: &str, bytes: u64, now_s: f64) {
        self.bytes_out += bytes;
        self.msgs_out += 1;
        self.last_seen_s = now_s;
        let entry = self.topic_scores.entry(topic.to_string()).or_default();
        entry.bytes += bytes;
    }

    pub fn note_rtt_sample(&mut self, sample_ms: f64, alpha: f64) {
        if self.rtt_ms_ewma == 0.0 {
            self.rtt_ms_ewma = sample_ms;
        } else {
            self.rtt_ms_ewma = alpha * sample_ms + (1.0 - alpha) * self.rtt_ms_ewma;
        }
    }

    /// Computes the current score, transitioning to `Banned` if it
    /// falls below `ban_threshold`. Banning is terminal and only
    /// observed on a score read, per the spec's lazy-transition design.
    pub fn compute_score(&mut self, now_s: f64, params: &ScoreParams) -> f64 {
        let topic_sum: f64 = self.topic_scores.values().map(|t| t.quality_score(params)).sum();

        let rtt_penalty = if self.rtt_ms_ewma > params.rtt_ref_ms {
            ((self.rtt_ms_ewma - params.rtt_ref_ms) / params.rtt_ref_ms) * params.rtt_slope * 100.0
        } else {
            0.0
        };

        let connected_dt = (now_s - self.connected_at_s).max(0.0);
        let uptime_bonus = (connected_dt * params.uptime_bonus_rate).min(params.uptime_bonus_max);

        let penalty_sum: f64 = self
            .penalties
            .values()
            .map(|p| decay(p.magnitude, now_s - self.connected_at_s, params.penalty_decay_half_life_s).abs())
            .sum();

        let score = params.base + topic_sum - rtt_penalty + uptime_bonus - penalty_sum;

        if score < params.ban_threshold {
            self.status = PeerStatus::Banned;
        }
        score
    }

    /// Conservative pre-filter: does this peer's role set plausibly
    /// carry this topic family? Mesh membership remains authoritative.
    pub fn supports_topic(&self, topic: &str) -> bool {
        let required = if topic.contains("block") || topic.contains("header") {
            PeerRole::FULL | PeerRole::RELAY
        } else if topic.contains("tx") {
            PeerRole::FULL | PeerRole::LIGHT | PeerRole::RELAY
        } else if topic.contains("share") {
            PeerRole::MINER | PeerRole::RELAY
        } else if topic.contains("da") {
            PeerRole::DA_ONLY | PeerRole::FULL | PeerRole::RELAY
        } else {
            return true;
        };
        self.roles.intersects(required)
    }

    pub fn snapshot(&mut self, now_s: f64, params: &ScoreParams) -> PeerSnapshot {
        let score = self.compute_score(now_s, params);
        PeerSnapshot {
            peer_id: self.peer_id.clone(),
            address: self.address.clone(),
            roles: self.roles.bits(),
            status: self.status,
            chain_id: self.chain_id,
            head_height: self.head_height,
            caps: self.caps.clone(),
            last_seen_s: self.last_seen_s,
            connected_at_s: self.connected_at_s,
            bytes_in: self.bytes_in,
            bytes_out: self.bytes_out,
            msgs_in: self.msgs_in,
            msgs_out: self.msgs_out,
            rtt_ms_ewma: self.rtt_ms_ewma,
            topic_scores: self.topic_scores.clone(),
            penalties: self.penalties.iter().map(|(k, v)| (k.clone(), v.magnitude)).collect(),
            score,
        }
    }
}

/// Builds a `Peer` straight from a successful handshake, already
/// transitioned into `Connected`.
pub fn peer_from_handshake(peer_id: String, address: String, chain_id: u64, now_s: f64, params: &ScoreParams) -> Peer {
    let mut peer = Peer::new(peer_id, address, chain_id, now_s);
    peer.on_connected(now_s, params);
    peer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_peer_scores_base() {
        let params = ScoreParams::default();
        let mut peer = Peer::new("p1".into(), "tcp/1.2.3.4:9000".into(), 1, 1000.0);
        peer.status = PeerStatus::Connected;
        let score = peer.compute_score(1000.0, &params);
        assert!((score - params.base).abs() < 1e-9);
    }

    #[test]
    fn bad_messages_drag_score_down() {
        let params = ScoreParams::default();
        let mut peer = Peer::new("p1".into(), "addr".into(), 1, 0.0);
        for _ in 0..100 {
            peer.record_inbound("tx", 10, false, false, 0.0);
        }
        let score = peer.compute_score(0.0, &params);
        assert!(score < params.base);
    }

    #[test]
    fn score_below_threshold_bans() {
        let params = ScoreParams::default();
        let mut peer = Peer::new("p1".into(), "addr".into(), 1, 0.0);
        peer.apply_penalty("abuse", 100.0, 0.0);
        let score = peer.compute_score(0.0, &params);
        assert!(score < params.ban_threshold);
        assert_eq!(peer.status, PeerStatus::Banned);
    }

    #[test]
    fn penalties_decay_over_time() {
        let params = ScoreParams::default();
        let mut peer = Peer::new("p1".into(), "addr".into(), 1, 0.0);
        peer.apply_penalty("abuse", 10.0, 0.0);
        let score_now = peer.compute_score(0.0, &params);
        let score_later = peer.compute_score(params.penalty_decay_half_life_s, &params);
        assert!(score_later > score_now);
    }

    #[test]
    fn flap_penalty_applies_on_quick_reconnect() {
        let params = ScoreParams::default();
        let mut peer = Peer::new("p1".into(), "addr".into(), 1, 0.0);
        peer.on_connected(0.0, &params);
        peer.on_disconnected(10.0);
        peer.on_connected(20.0, &params);
        assert!(peer.penalties.contains_key("flap"));
    }

    #[test]
    fn topic_support_predicate() {
        let mut peer = Peer::new("p1".into(), "addr".into(), 1, 0.0);
        peer.roles = PeerRole::MINER;
        assert!(peer.supports_topic("shares"));
        assert!(!peer.supports_topic("blocks"));
        assert!(peer.supports_topic("whatever"));
    }
}
