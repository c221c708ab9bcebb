//! Hierarchical token-bucket admission control.
//!
//! Four tiers — Global, Topic, Peer, Peer×Topic — are checked in a
//! fixed order against a single shared `now` snapshot per call. A
//! refusal at any tier does not roll back tokens already consumed at
//! earlier tiers: this is deliberate (see `allow`) and matches the
//! reference rate limiter's semantics exactly.

use std::collections::HashMap;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BucketSpec {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl BucketSpec {
    pub fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self { capacity, refill_per_sec }
    }
}

#[derive(Debug, Clone, Copy)]
struct Bucket {
    spec: BucketSpec,
    tokens: f64,
    last_refill: Instant,
}

impl Bucket {
    fn fresh(spec: BucketSpec, now: Instant) -> Self {
        Self { spec, tokens: spec.capacity, last_refill: now }
    }

    fn refill(&mut self, now: Instant) {
        let dt = now.saturating_duration_since(self.last_refill).as_secs_f64();
        if dt > 0.0 {
            self.tokens = (self.tokens + dt * self.spec.refill_per_sec).min(self.spec.capacity);
            self.last_refill = now;
        }
    }

    /// Returns `(allowed, retry_seconds)`. On refusal, tokens are left
    /// untouched (this tier's own bucket, not the caller's earlier
    /// tiers) so a subsequent retry computes a fresh deficit.
    fn try_consume(&mut self, cost: f64, now: Instant) -> (bool, f64) {
        self.refill(now);
        if self.tokens >= cost {
            self.tokens -= cost;
            (true, 0.0)
        } else {
            let deficit = cost - self.tokens;
            let retry = if self.spec.refill_per_sec > 0.0 { deficit / self.spec.refill_per_sec } else { f64::INFINITY };
            (false, retry)
        }
    }
}

#[derive(Debug, Clone)]
pub struct RatelimitConfig {
    pub global: BucketSpec,
    pub topic_specs: HashMap<String, BucketSpec>,
    pub per_peer_default: BucketSpec,
    pub per_peer_specs: HashMap<String, BucketSpec>,
    pub per_peer_topic_specs: HashMap<String, BucketSpec>,
    pub topic_costs: HashMap<String, f64>,
}

impl RatelimitConfig {
    pub fn cost_for(&self, topic: &str, base_cost: f64) -> f64 {
        base_cost * self.topic_costs.get(topic).copied().unwrap_or(1.0)
    }
}

impl Default for RatelimitConfig {
    fn default() -> Self {
        let mut per_peer_topic_specs = HashMap::new();
        per_peer_topic_specs.insert("blocks".to_string(), BucketSpec::new(4.0, 2.0));
        per_peer_topic_specs.insert("headers".to_string(), BucketSpec::new(20.0, 10.0));
        per_peer_topic_specs.insert("tx".to_string(), BucketSpec::new(60.0, 30.0));
        per_peer_topic_specs.insert("shares".to_string(), BucketSpec::new(40.0, 20.0));
        per_peer_topic_specs.insert("ping".to_string(), BucketSpec::new(10.0, 5.0));

        let mut topic_costs = HashMap::new();
        topic_costs.insert("blocks".to_string(), 10.0);
        topic_costs.insert("headers".to_string(), 2.0);
        topic_costs.insert("tx".to_string(), 1.0);
        topic_costs.insert("shares".to_string(), 1.0);
        topic_costs.insert("ping".to_string(), 0.5);

        Self {
            global: BucketSpec::new(400.0, 200.0),
            topic_specs: HashMap::new(),
            per_peer_default: BucketSpec::new(100.0, 50.0),
            per_peer_specs: HashMap::new(),
            per_peer_topic_specs,
            topic_costs,
        }
    }
}

/// Builds a `RatelimitConfig` from the loosely-shaped `(capacity,
/// fill_rate)` pairs operators tend to hand-write in config files and
/// admin tooling, rather than requiring `BucketSpec` values up front.
/// Replaces what used to be three near-identical bucket types
/// (`Bucket`, `RateBucket`, `PeerRateLimiter`) with one `Bucket` record
/// and this single builder.
#[derive(Debug, Clone, Default)]
pub struct RatelimitConfigBuilder {
    global: Option<(f64, f64)>,
    per_peer_default: Option<(f64, f64)>,
    topics: HashMap<String, (f64, f64)>,
    peers: HashMap<String, (f64, f64)>,
    peer_topics: HashMap<String, (f64, f64)>,
    topic_costs: HashMap<String, f64>,
}

impl RatelimitConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global(mut self, capacity: f64, fill_rate: f64) -> Self {
        self.global = Some((capacity, fill_rate));
        self
    }

    pub fn per_peer_default(mut self, capacity: f64, fill_rate: f64) -> Self {
        self.per_peer_default = Some((capacity, fill_rate));
        self
    }

    pub fn topic(mut self, name: &str, capacity: f64, fill_rate: f64) -> Self {
        self.topics.insert(name.to_string(), (capacity, fill_rate));
        self
    }

    pub fn peer(mut self, peer_id: &str, capacity: f64, fill_rate: f64) -> Self {
        self.peers.insert(peer_id.to_string(), (capacity, fill_rate));
        self
    }

    pub fn peer_topic(mut self, topic: &str, capacity: f64, fill_rate: f64) -> Self {
        self.peer_topics.insert(topic.to_string(), (capacity, fill_rate));
        self
    }

    pub fn topic_cost(mut self, topic: &str, cost: f64) -> Self {
        self.topic_costs.insert(topic.to_string(), cost);
        self
    }

    /// Builds the final config, layering this builder's overrides on
    /// top of `RatelimitConfig::default()`.
    pub fn build(self) -> RatelimitConfig {
        let mut cfg = RatelimitConfig::default();
        if let Some((c, r)) = self.global {
            cfg.global = BucketSpec::new(c, r);
        }
        if let Some((c, r)) = self.per_peer_default {
            cfg.per_peer_default = BucketSpec::new(c, r);
        }
        for (name, (c, r)) in self.topics {
            cfg.topic_specs.insert(name, BucketSpec::new(c, r));
        }
        for (peer_id, (c, r)) in self.peers {
            cfg.per_peer_specs.insert(peer_id, BucketSpec::new(c, r));
        }
        for (topic, (c, r)) in self.peer_topics {
            cfg.per_peer_topic_specs.insert(topic, BucketSpec::new(c, r));
        }
        for (topic, cost) in self.topic_costs {
            cfg.topic_costs.insert(topic, cost);
        }
        cfg
    }
}

/// Outcome of an admission check. Not an error — callers decide
/// whether to wait, drop, or penalize the peer.
#[derive(Debug, Clone)]
pub struct Decision {
    pub allowed: bool,
    pub retry_after_s: f64,
    pub limiting_keys: Vec<String>,
}

pub struct HierarchicalLimiter {
    cfg: Mutex<RatelimitConfig>,
    global: Mutex<Bucket>,
    topic: DashMap<String, Bucket>,
    peer: DashMap<String, Bucket>,
    peer_topic: DashMap<String, Bucket>,
}

impl HierarchicalLimiter {
    pub fn new(cfg: RatelimitConfig) -> Self {
        let now = Instant::now();
        let global = Mutex::new(Bucket::fresh(cfg.global, now));
        Self {
            cfg: Mutex::new(cfg),
            global,
            topic: DashMap::new(),
            peer: DashMap::new(),
            peer_topic: DashMap::new(),
        }
    }

    /// Checks all applicable tiers under one shared `now` snapshot and
    /// returns an admission decision. See module docs for the
    /// no-rollback-on-refusal rationale.
    pub async fn allow(&self, peer_id: &str, topic: &str, base_cost: f64) -> Decision {
        let now = Instant::now();
        let cfg = self.cfg.lock().await;
        let cost = cfg.cost_for(topic, base_cost);

        let mut refused: Vec<(String, f64)> = Vec::new();

        {
            let mut g = self.global.lock().await;
            let (ok, retry) = g.try_consume(cost, now);
            if !ok {
                refused.push(("global".to_string(), retry));
            }
        }

        if let Some(spec) = cfg.topic_specs.get(topic).copied() {
            let mut bucket = self.topic.entry(topic.to_string()).or_insert_with(|| Bucket::fresh(spec, now));
            let (ok, retry) = bucket.try_consume(cost, now);
            if !ok {
                refused.push((format!("topic:{topic}"), retry));
            }
        }

        let peer_spec = cfg.per_peer_specs.get(peer_id).copied().unwrap_or(cfg.per_peer_default);
        {
            let mut bucket = self.peer.entry(peer_id.to_string()).or_insert_with(|| Bucket::fresh(peer_spec, now));
            let (ok, retry) = bucket.try_consume(cost, now);
            if !ok {
                refused.push((format!("peer:{peer_id}"), retry));
            }
        }

        if let Some(spec) = cfg.per_peer_topic_specs.get(topic).copied() {
            let key = format!("{peer_id}:{topic}");
            let mut bucket = self.peer_topic.entry(key).or_insert_with(|| Bucket::fresh(spec, now));
            let (ok, retry) = bucket.try_consume(cost, now);
            if !ok {
                refused.push((format!("peer_topic:{peer_id}:{topic}"), retry));
            }
        }

        if refused.is_empty() {
            Decision { allowed: true, retry_after_s: 0.0, limiting_keys: Vec::new() }
        } else {
            let retry = refused.iter().map(|(_, r)| *r).fold(0.0f64, f64::max);
            let mut keys: Vec<String> = refused.into_iter().map(|(k, _)| k).collect();
            keys.sort();
            Decision { allowed: false, retry_after_s: retry, limiting_keys: keys }
        }
    }

    /// Polls `allow` with capped exponential backoff (10ms, ×1.6, cap
    /// 250ms) until admitted.
    pub async fn wait(&self, peer_id: &str, topic: &str, base_cost: f64) {
        let mut backoff = 0.010f64;
        loop {
            let decision = self.allow(peer_id, topic, base_cost).await;
            if decision.allowed {
                return;
            }
            let sleep_s = decision.retry_after_s.max(0.001).min(1.0) + backoff;
            tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_s)).await;
            backoff = (backoff * 1.6).min(0.250);
        }
    }

    pub async fn set_global(&self, spec: BucketSpec) {
        let mut cfg = self.cfg.lock().await;
        cfg.global = spec;
        *self.global.lock().await = Bucket::fresh(spec, Instant::now());
    }

    pub async fn set_topic(&self, topic: &str, spec: BucketSpec) {
        let mut cfg = self.cfg.lock().await;
        cfg.topic_specs.insert(topic.to_string(), spec);
        self.topic.insert(topic.to_string(), Bucket::fresh(spec, Instant::now()));
    }

    pub async fn set_peer(&self, peer_id: &str, spec: BucketSpec) {
        let mut cfg = self.cfg.lock().await;
        cfg.per_peer_specs.insert(peer_id.to_string(), spec);
        self.peer.insert(peer_id.to_string(), Bucket::fresh(spec, Instant::now()));
    }

    pub async fn set_peer_topic(&self, peer_id: &str, topic: &str, spec: BucketSpec) {
        let mut cfg = self.cfg.lock().await;
        cfg.per_peer_topic_specs.insert(topic.to_string(), spec);
        self.peer_topic.insert(format!("{peer_id}:{topic}"), Bucket::fresh(spec, Instant::now()));
    }

    /// Removes peer and peer×topic buckets for peers no longer alive.
    pub fn prune(&self, peers_alive: &[String]) {
        let alive: std::collections::HashSet<&str> = peers_alive.iter().map(|s| s.as_str()).collect();
        self.peer.retain(|peer_id, _| alive.contains(peer_id.as_str()));
        self.peer_topic.retain(|key, _| {
            key.split_once(':').map(|(peer_id, _)| alive.contains(peer_id)).unwrap_or(false)
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn global_bucket_admits_within_capacity() {
        let mut cfg = RatelimitConfig::default();
        cfg.global = BucketSpec::new(5.0, 1.0);
        let limiter = HierarchicalLimiter::new(cfg);
        for _ in 0..5 {
            let d = limiter.allow("peerA", "ping", 1.0).await;
            assert!(d.allowed);
        }
        let d = limiter.allow("peerA", "ping", 1.0).await;
        assert!(!d.allowed);
        assert!(d.limiting_keys.contains(&"global".to_string()));
    }

    #[tokio::test]
    async fn per_peer_tier_isolates_peers() {
        let mut cfg = RatelimitConfig::default();
        cfg.global = BucketSpec::new(1000.0, 1000.0);
        cfg.per_peer_default = BucketSpec::new(2.0, 1.0);
        let limiter = HierarchicalLimiter::new(cfg);
        assert!(limiter.allow("a", "ping", 1.0).await.allowed);
        assert!(limiter.allow("a", "ping", 1.0).await.allowed);
        assert!(!limiter.allow("a", "ping", 1.0).await.allowed);
        assert!(limiter.allow("b", "ping", 1.0).await.allowed);
    }

    #[tokio::test]
    async fn topic_weight_scales_cost() {
        let mut cfg = RatelimitConfig::default();
        cfg.global = BucketSpec::new(10.0, 0.0);
        cfg.topic_costs.insert("blocks".to_string(), 10.0);
        let limiter = HierarchicalLimiter::new(cfg);
        let d = limiter.allow("a", "blocks", 1.0).await;
        assert!(d.allowed);
        let d2 = limiter.allow("a", "blocks", 1.0).await;
        assert!(!d2.allowed);
    }

    #[test]
    fn builder_overrides_only_what_is_set() {
        let cfg = RatelimitConfigBuilder::new().global(2.0, 1.0).topic("shares", 8.0, 4.0).build();
        assert_eq!(cfg.global, BucketSpec::new(2.0, 1.0));
        assert_eq!(cfg.topic_specs.get("shares").copied(), Some(BucketSpec::new(8.0, 4.0)));
        // Everything else still comes from RatelimitConfig::default().
        assert_eq!(cfg.per_peer_default, RatelimitConfig::default().per_peer_default);
    }

    #[tokio::test]
    async fn builder_output_drives_admission() {
        let cfg = RatelimitConfigBuilder::new().global(1.0, 0.0).build();
        let limiter = HierarchicalLimiter::new(cfg);
        assert!(limiter.allow("a", "ping", 1.0).await.allowed);
        assert!(!limiter.allow("a", "ping", 1.0).await.allowed);
    }
}
