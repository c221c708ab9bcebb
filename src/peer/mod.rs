pub mod state;
pub mod store;

pub use state::{Peer, PeerRole, PeerSnapshot, PeerStatus, ScoreParams, TopicScore};
pub use store::{OrderBy, PeerStore};
