use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::crypto::aead::AeadAlgorithm;
use crate::error::{P2pError, Result};
use crate::peer::ScoreParams;
use crate::ratelimit::{BucketSpec, RatelimitConfig};

/// Top-level configuration for the P2P core.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    pub node: NodeConfig,
    pub peer_score: PeerScoreConfig,
    pub ratelimit: RatelimitConfigToml,
    pub aead: AeadConfig,
}

impl Config {
    pub fn production() -> Self {
        Self {
            node: NodeConfig::production(),
            peer_score: PeerScoreConfig::default(),
            ratelimit: RatelimitConfigToml::default(),
            aead: AeadConfig::production(),
        }
    }

    pub fn development() -> Self {
        Self {
            node: NodeConfig::development(),
            peer_score: PeerScoreConfig::default(),
            ratelimit: RatelimitConfigToml::default(),
            aead: AeadConfig::development(),
        }
    }

    pub fn testnet() -> Self {
        Self {
            node: NodeConfig::testnet(),
            peer_score: PeerScoreConfig::default(),
            ratelimit: RatelimitConfigToml::default(),
            aead: AeadConfig::development(),
        }
    }

    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let config_str = std::fs::read_to_string(path)?;
        let mut config: Config = toml::from_str(&config_str)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let toml_str = toml::to_string_pretty(self)?;
        std::fs::write(path, toml_str)?;
        Ok(())
    }

    /// Overrides loaded from `ANIMICA_P2P_*` environment variables,
    /// applied after file load and before validation, matching the
    /// teacher crate's own `NUMI_*` convention.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("ANIMICA_P2P_LISTEN_ADDR") {
            self.node.listen_address = v;
        }
        if let Ok(v) = std::env::var("ANIMICA_P2P_MAX_PEERS") {
            if let Ok(n) = v.parse() {
                self.node.max_peers = n;
            }
        }
        if let Ok(v) = std::env::var("ANIMICA_P2P_DATA_DIR") {
            self.node.data_dir = PathBuf::from(v);
        }
        if let Ok(v) = std::env::var("ANIMICA_P2P_ALLOW_DEVNET_HANDSHAKE") {
            self.node.allow_devnet_handshake = matches!(v.as_str(), "1" | "true" | "yes");
        }
        if let Ok(v) = std::env::var("ANIMICA_P2P_AEAD") {
            self.aead.default_algorithm = v;
        }
        if let Ok(v) = std::env::var("ANIMICA_P2P_CHAIN_ID") {
            if let Ok(n) = v.parse() {
                self.node.chain_id = n;
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.node.validate()?;
        self.peer_score.validate()?;
        self.aead.validate()?;
        Ok(())
    }

    /// `$ANIMICA_HOME` if set, else `$HOME/.animica` — the home the
    /// CLI and config loader both resolve peer-store/seed paths from.
    pub fn resolve_home_dir() -> PathBuf {
        if let Ok(home) = std::env::var("ANIMICA_HOME") {
            return PathBuf::from(home);
        }
        dirs_home().join(".animica")
    }

    pub fn default_peer_store_path() -> PathBuf {
        Self::resolve_home_dir().join("p2p").join("peers.db")
    }
}

fn dirs_home() -> PathBuf {
    std::env::var("HOME").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    pub listen_address: String,
    pub max_peers: usize,
    pub connection_timeout_secs: u64,
    pub handshake_timeout_secs: u64,
    pub data_dir: PathBuf,
    pub chain_id: u64,
    /// Gates the unauthenticated lightweight devnet handshake path; must
    /// stay false outside development/testnet profiles.
    pub allow_devnet_handshake: bool,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl NodeConfig {
    pub fn production() -> Self {
        Self {
            listen_address: "0.0.0.0:30333".to_string(),
            max_peers: 128,
            connection_timeout_secs: 10,
            handshake_timeout_secs: 10,
            data_dir: Config::resolve_home_dir(),
            chain_id: 1,
            allow_devnet_handshake: false,
        }
    }

    pub fn development() -> Self {
        Self {
            listen_address: "127.0.0.1:30333".to_string(),
            max_peers: 32,
            connection_timeout_secs: 30,
            handshake_timeout_secs: 30,
            data_dir: PathBuf::from("./data"),
            chain_id: 0,
            allow_devnet_handshake: true,
        }
    }

    pub fn testnet() -> Self {
        Self {
            listen_address: "0.0.0.0:40333".to_string(),
            chain_id: 2,
            allow_devnet_handshake: true,
            ..Self::production()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_peers == 0 {
            return Err(P2pError::Config("max_peers must be at least 1".into()));
        }
        if self.connection_timeout_secs == 0 || self.handshake_timeout_secs == 0 {
            return Err(P2pError::Config("timeouts must be positive".into()));
        }
        Ok(())
    }

    pub fn peer_store_path(&self) -> PathBuf {
        self.data_dir.join("p2p").join("peers.db")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeerScoreConfig {
    pub params: ScoreParams,
}

impl Default for PeerScoreConfig {
    fn default() -> Self {
        Self { params: ScoreParams::default() }
    }
}

impl PeerScoreConfig {
    pub fn validate(&self) -> Result<()> {
        if self.params.topic_cap <= 0.0 {
            return Err(P2pError::Config("peer_score.params.topic_cap must be positive".into()));
        }
        if self.params.ban_threshold >= self.params.base {
            return Err(P2pError::Config("peer_score.params.ban_threshold must be below base".into()));
        }
        Ok(())
    }
}

/// A TOML-friendly mirror of `RatelimitConfig` (plain maps of spec
/// pairs rather than the richer runtime type) that converts into the
/// runtime config the limiter actually uses.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RatelimitConfigToml {
    pub global_capacity: f64,
    pub global_refill_per_sec: f64,
    pub per_peer_default_capacity: f64,
    pub per_peer_default_refill_per_sec: f64,
    pub topic_costs: std::collections::HashMap<String, f64>,
    pub per_peer_topic_specs: std::collections::HashMap<String, (f64, f64)>,
}

impl Default for RatelimitConfigToml {
    fn default() -> Self {
        let rt = RatelimitConfig::default();
        Self {
            global_capacity: rt.global.capacity,
            global_refill_per_sec: rt.global.refill_per_sec,
            per_peer_default_capacity: rt.per_peer_default.capacity,
            per_peer_default_refill_per_sec: rt.per_peer_default.refill_per_sec,
            topic_costs: rt.topic_costs,
            per_peer_topic_specs: rt
                .per_peer_topic_specs
                .into_iter()
                .map(|(k, v)| (k, (v.capacity, v.refill_per_sec)))
                .collect(),
        }
    }
}

impl RatelimitConfigToml {
    pub fn into_runtime(self) -> RatelimitConfig {
        RatelimitConfig {
            global: BucketSpec::new(self.global_capacity, self.global_refill_per_sec),
            topic_specs: std::collections::HashMap::new(),
            per_peer_default: BucketSpec::new(self.per_peer_default_capacity, self.per_peer_default_refill_per_sec),
            per_peer_specs: std::collections::HashMap::new(),
            per_peer_topic_specs: self
                .per_peer_topic_specs
                .into_iter()
                .map(|(k, (c, r))| (k, BucketSpec::new(c, r)))
                .collect(),
            topic_costs: self.topic_costs,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AeadConfig {
    pub default_algorithm: String,
}

impl Default for AeadConfig {
    fn default() -> Self {
        Self::development()
    }
}

impl AeadConfig {
    pub fn production() -> Self {
        Self { default_algorithm: "chacha20-poly1305".to_string() }
    }

    pub fn development() -> Self {
        Self { default_algorithm: "chacha20-poly1305".to_string() }
    }

    pub fn validate(&self) -> Result<()> {
        AeadAlgorithm::from_name(&self.default_algorithm)?;
        Ok(())
    }

    pub fn algorithm(&self) -> Result<AeadAlgorithm> {
        AeadAlgorithm::from_name(&self.default_algorithm)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn development_config_validates() {
        Config::development().validate().unwrap();
    }

    #[test]
    fn production_config_validates() {
        Config::production().validate().unwrap();
    }

    #[test]
    fn round_trips_through_toml() {
        let cfg = Config::development();
        let toml_str = toml::to_string_pretty(&cfg).unwrap();
        let parsed: Config = toml::from_str(&toml_str).unwrap();
        parsed.validate().unwrap();
    }

    #[test]
    fn env_override_changes_listen_address() {
        std::env::set_var("ANIMICA_P2P_LISTEN_ADDR", "0.0.0.0:9999");
        let mut cfg = Config::development();
        cfg.apply_env_overrides();
        assert_eq!(cfg.node.listen_address, "0.0.0.0:9999");
        std::env::remove_var("ANIMICA_P2P_LISTEN_ADDR");
    }
}
