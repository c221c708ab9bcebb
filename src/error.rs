use thiserror::Error;

/// Error taxonomy for the P2P core.
///
/// `LimiterRefusal` is deliberately not a variant here: a rate-limiter
/// refusal is an ordinary control-flow outcome (`ratelimit::Decision`),
/// not a failure, and callers decide whether to wait, drop, or
/// penalize the peer.
#[derive(Debug, Error)]
pub enum P2pError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("handshake error: {0}")]
    Handshake(String),

    #[error("aead error: {0}")]
    Aead(String),

    #[error("sequence counter exhausted")]
    SequenceExhausted,

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("peer store error: {0}")]
    Store(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<rusqlite::Error> for P2pError {
    fn from(err: rusqlite::Error) -> Self {
        P2pError::Store(err.to_string())
    }
}

impl From<serde_json::Error> for P2pError {
    fn from(err: serde_json::Error) -> Self {
        P2pError::Store(err.to_string())
    }
}

impl From<toml::de::Error> for P2pError {
    fn from(err: toml::de::Error) -> Self {
        P2pError::Config(err.to_string())
    }
}

impl From<toml::ser::Error> for P2pError {
    fn from(err: toml::ser::Error) -> Self {
        P2pError::Config(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, P2pError>;
