pub mod config;
pub mod crypto;
pub mod error;
pub mod peer;
pub mod ratelimit;
pub mod sync_lock;

pub use config::Config;
pub use crypto::{AeadAlgorithm, AeadContext, HandshakeKeys, IdentityAlgorithm, IdentityKeypair};
pub use error::{P2pError, Result};
pub use peer::{Peer, PeerRole, PeerStatus, PeerStore, ScoreParams};
pub use ratelimit::{Decision, HierarchicalLimiter, RatelimitConfig, RatelimitConfigBuilder};

/// Shared handles a running node passes to session tasks instead of
/// relying on process-wide globals.
pub struct NodeContext {
    pub config: Config,
    pub peer_store: std::sync::Arc<PeerStore>,
    pub limiter: std::sync::Arc<HierarchicalLimiter>,
}

impl NodeContext {
    pub fn new(config: Config) -> Result<Self> {
        let peer_store = std::sync::Arc::new(PeerStore::open(config.node.peer_store_path())?);
        let limiter = std::sync::Arc::new(HierarchicalLimiter::new(config.ratelimit.clone().into_runtime()));
        Ok(Self { config, peer_store, limiter })
    }
}
