pub mod aead;
pub mod handshake;
pub mod identity;

pub use aead::{AeadAlgorithm, AeadContext};
pub use handshake::{HandshakeKeys, Role};
pub use identity::{IdentityAlgorithm, IdentityKeypair, IdentitySignature};
