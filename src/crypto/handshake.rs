//! Two-flight PQ-KEM channel-binding handshake.
//!
//! Produces opposing AEAD keys and a 32-byte transcript hash (`TH`) from
//! the exact bytes both sides put on the wire for their HELLO frames.
//! The engine never parses HELLO internals — the protocol layer owns
//! that schema — it only needs byte-identical frames to bind.

use hkdf::Hkdf;
use pqcrypto_kyber::kyber768;
use pqcrypto_traits::kem::{
    Ciphertext as KemCiphertext, PublicKey as KemPublicKey, SecretKey as KemSecretKey,
    SharedSecret as KemSharedSecret,
};
use rand::rngs::OsRng;
use rand::RngCore;
use sha3::{Digest, Sha3_256};

use crate::crypto::aead::{AeadAlgorithm, AeadContext};
use crate::error::{P2pError, Result};

pub const TRANSCRIPT_DOMAIN: &[u8] = b"animica/p2p/hs/v1";
pub const KEY_SCHEDULE_INFO: &[u8] = b"animica/p2p/hs/keys/v1";
const OKM_LEN: usize = 88;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

/// The four-tuple derived from a completed handshake, plus the
/// transcript hash the protocol layer signs for authentication.
pub struct HandshakeKeys {
    pub aead: AeadAlgorithm,
    pub send_key: [u8; 32],
    pub recv_key: [u8; 32],
    pub send_nonce_base: [u8; 12],
    pub recv_nonce_base: [u8; 12],
    pub transcript_hash: [u8; 32],
}

impl HandshakeKeys {
    pub fn send_context(&self) -> Result<AeadContext> {
        AeadContext::new(self.aead, &self.send_key, &self.send_nonce_base)
    }

    pub fn recv_context(&self) -> Result<AeadContext> {
        AeadContext::new(self.aead, &self.recv_key, &self.recv_nonce_base)
    }
}

fn len32(label: &[u8], blob: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(4 + label.len() + 4 + blob.len());
    out.extend_from_slice(&(label.len() as u32).to_be_bytes());
    out.extend_from_slice(label);
    out.extend_from_slice(&(blob.len() as u32).to_be_bytes());
    out.extend_from_slice(blob);
    out
}

/// `TH = SHA3-256(domain || IHELLO-frame || RHELLO-frame || KEM-PK-I-frame || KEM-CT-R-frame)`.
pub fn transcript_hash(hello_i_bytes: &[u8], hello_r_bytes: &[u8], pk_i: &[u8], ct: &[u8]) -> [u8; 32] {
    let mut hasher = Sha3_256::new();
    hasher.update(TRANSCRIPT_DOMAIN);
    hasher.update(len32(b"IHELLO", hello_i_bytes));
    hasher.update(len32(b"RHELLO", hello_r_bytes));
    hasher.update(len32(b"KEM-PK-I", pk_i));
    hasher.update(len32(b"KEM-CT-R", ct));
    let digest = hasher.finalize();
    let mut out = [0u8; 32];
    out.copy_from_slice(&digest);
    out
}

fn derive_keys(role: Role, ss: &[u8], th: &[u8; 32], aead: AeadAlgorithm) -> Result<HandshakeKeys> {
    let hk = Hkdf::<Sha3_256>::new(Some(th), ss);
    let mut okm = [0u8; OKM_LEN];
    hk.expand(KEY_SCHEDULE_INFO, &mut okm)
        .map_err(|e| P2pError::Handshake(format!("hkdf expand failed: {e}")))?;

    let mut client_write_key = [0u8; 32];
    let mut server_write_key = [0u8; 32];
    let mut client_nonce_base = [0u8; 12];
    let mut server_nonce_base = [0u8; 12];
    client_write_key.copy_from_slice(&okm[0..32]);
    server_write_key.copy_from_slice(&okm[32..64]);
    client_nonce_base.copy_from_slice(&okm[64..76]);
    server_nonce_base.copy_from_slice(&okm[76..88]);

    let (send_key, recv_key, send_nonce_base, recv_nonce_base) = match role {
        Role::Initiator => (client_write_key, server_write_key, client_nonce_base, server_nonce_base),
        Role::Responder => (server_write_key, client_write_key, server_nonce_base, client_nonce_base),
    };

    Ok(HandshakeKeys {
        aead,
        send_key,
        recv_key,
        send_nonce_base,
        recv_nonce_base,
        transcript_hash: *th,
    })
}

/// State an initiator holds between flight 1 and finalize.
pub struct InitiatorState {
    hello_i_bytes: Vec<u8>,
    kyber_sk: kyber768::SecretKey,
    kyber_pk_bytes: Vec<u8>,
    aead: AeadAlgorithm,
}

/// Begins the handshake as initiator: generates the ephemeral KEM
/// keypair and returns the state plus the raw public-key bytes the
/// caller must embed in its HELLO-I frame before transmitting it.
pub fn initiator_begin(hello_i_bytes: Vec<u8>, aead: AeadAlgorithm) -> (InitiatorState, Vec<u8>) {
    let (pk, sk) = kyber768::keypair();
    let pk_bytes = pk.as_bytes().to_vec();
    (
        InitiatorState { hello_i_bytes, kyber_sk: sk, kyber_pk_bytes: pk_bytes.clone(), aead },
        pk_bytes,
    )
}

/// Completes the handshake as initiator once HELLO-R and the KEM
/// ciphertext have arrived.
pub fn initiator_complete(state: InitiatorState, hello_r_bytes: &[u8], ct_bytes: &[u8]) -> Result<HandshakeKeys> {
    let ct = kyber768::Ciphertext::from_bytes(ct_bytes)
        .map_err(|_| P2pError::Handshake("malformed kem ciphertext".into()))?;
    let ss = kyber768::decapsulate(&ct, &state.kyber_sk);
    let th = transcript_hash(&state.hello_i_bytes, hello_r_bytes, &state.kyber_pk_bytes, ct_bytes);
    derive_keys(Role::Initiator, ss.as_bytes(), &th, state.aead)
}

/// Performs the responder's side in one call: encapsulates to the
/// initiator's ephemeral KEM public key and derives keys. Returns the
/// ciphertext the caller must embed in HELLO-R alongside the derived
/// keys.
pub fn responder_respond(
    hello_i_bytes: &[u8],
    kyber_pk_i_bytes: &[u8],
    hello_r_bytes: &[u8],
    aead: AeadAlgorithm,
) -> Result<(Vec<u8>, HandshakeKeys)> {
    let pk_i = kyber768::PublicKey::from_bytes(kyber_pk_i_bytes)
        .map_err(|_| P2pError::Handshake("malformed kem public key".into()))?;
    let (ct, ss) = kyber768::encapsulate(&pk_i);
    let ct_bytes = ct.as_bytes().to_vec();
    let th = transcript_hash(hello_i_bytes, hello_r_bytes, kyber_pk_i_bytes, &ct_bytes);
    let keys = derive_keys(Role::Responder, ss.as_bytes(), &th, aead)?;
    Ok((ct_bytes, keys))
}

/// Lightweight devnet handshake path: no HELLO frames, no
/// authentication, same key schedule. Gated to non-production profiles
/// by the caller (see `config::NodeConfig::allow_devnet_handshake`).
pub mod devnet {
    use super::*;
    use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

    pub const MAGIC: &[u8] = b"ANIMICA/TCP/HS/V0";
    const SEED_LEN: usize = 32;

    async fn write_frame<W: AsyncWrite + Unpin>(w: &mut W, prologue: &[u8], seed: &[u8; SEED_LEN]) -> Result<()> {
        if prologue.len() > 255 {
            return Err(P2pError::Handshake("devnet prologue too long".into()));
        }
        w.write_all(MAGIC).await?;
        w.write_all(&[prologue.len() as u8]).await?;
        w.write_all(prologue).await?;
        w.write_all(seed).await?;
        w.flush().await?;
        Ok(())
    }

    async fn read_frame<R: AsyncRead + Unpin>(r: &mut R) -> Result<(Vec<u8>, [u8; SEED_LEN])> {
        let mut magic = [0u8; 17];
        r.read_exact(&mut magic).await?;
        if magic != *MAGIC {
            return Err(P2pError::Handshake("devnet magic mismatch".into()));
        }
        let mut len_byte = [0u8; 1];
        r.read_exact(&mut len_byte).await?;
        let mut prologue = vec![0u8; len_byte[0] as usize];
        r.read_exact(&mut prologue).await?;
        let mut seed = [0u8; SEED_LEN];
        r.read_exact(&mut seed).await?;
        Ok((prologue, seed))
    }

    fn transcript(prologue: &[u8], peer_prologue: &[u8], seed_i: &[u8; SEED_LEN], seed_r: &[u8; SEED_LEN]) -> [u8; 32] {
        let mut hasher = Sha3_256::new();
        hasher.update(MAGIC);
        hasher.update(len32(b"PROLOGUE", prologue));
        hasher.update(len32(b"PEER-PROLOGUE", peer_prologue));
        hasher.update(seed_i);
        hasher.update(seed_r);
        let digest = hasher.finalize();
        let mut out = [0u8; 32];
        out.copy_from_slice(&digest);
        out
    }

    /// Performs the unauthenticated devnet handshake over any ordered
    /// byte stream. `is_outbound` controls send/receive order so both
    /// peers agree on transcript ordering without negotiation.
    pub async fn perform<S: AsyncRead + AsyncWrite + Unpin>(
        stream: &mut S,
        is_outbound: bool,
        prologue: &[u8],
        aead: AeadAlgorithm,
    ) -> Result<HandshakeKeys> {
        let mut seed = [0u8; SEED_LEN];
        OsRng.fill_bytes(&mut seed);

        let (peer_prologue, seed_i, seed_r, role) = if is_outbound {
            write_frame(stream, prologue, &seed).await?;
            let (peer_prologue, peer_seed) = read_frame(stream).await?;
            (peer_prologue, seed, peer_seed, Role::Initiator)
        } else {
            let (peer_prologue, peer_seed) = read_frame(stream).await?;
            write_frame(stream, prologue, &seed).await?;
            (peer_prologue, peer_seed, seed, Role::Responder)
        };

        if peer_prologue != prologue {
            return Err(P2pError::Handshake("devnet prologue mismatch".to_string()));
        }

        let th = transcript(prologue, &peer_prologue, &seed_i, &seed_r);
        let mut shared_secret = Sha3_256::new();
        shared_secret.update(seed_i);
        shared_secret.update(seed_r);
        let ss = shared_secret.finalize();

        derive_keys(role, &ss, &th, aead)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_flight_handshake_agrees_on_keys_and_transcript() {
        let hello_i = b"fake-hello-i".to_vec();
        let hello_r = b"fake-hello-r".to_vec();

        let (init_state, pk_i_bytes) = initiator_begin(hello_i.clone(), AeadAlgorithm::ChaCha20Poly1305);
        let (ct_bytes, responder_keys) =
            responder_respond(&hello_i, &pk_i_bytes, &hello_r, AeadAlgorithm::ChaCha20Poly1305).unwrap();
        let initiator_keys = initiator_complete(init_state, &hello_r, &ct_bytes).unwrap();

        assert_eq!(initiator_keys.transcript_hash, responder_keys.transcript_hash);
        assert_eq!(initiator_keys.send_key, responder_keys.recv_key);
        assert_eq!(initiator_keys.recv_key, responder_keys.send_key);
        assert_eq!(initiator_keys.send_nonce_base, responder_keys.recv_nonce_base);
    }

    #[test]
    fn flipping_a_hello_byte_changes_the_transcript() {
        let hello_i = b"fake-hello-i".to_vec();
        let hello_r_a = b"fake-hello-r-a".to_vec();
        let hello_r_b = b"fake-hello-r-b".to_vec();
        let pk_i = vec![1u8; 32];
        let ct = vec![2u8; 32];

        let th_a = transcript_hash(&hello_i, &hello_r_a, &pk_i, &ct);
        let th_b = transcript_hash(&hello_i, &hello_r_b, &pk_i, &ct);
        assert_ne!(th_a, th_b);
    }

    #[test]
    fn end_to_end_ping_roundtrips_over_derived_keys() {
        let hello_i = b"fake-hello-i".to_vec();
        let hello_r = b"fake-hello-r".to_vec();
        let (init_state, pk_i_bytes) = initiator_begin(hello_i.clone(), AeadAlgorithm::ChaCha20Poly1305);
        let (ct_bytes, responder_keys) =
            responder_respond(&hello_i, &pk_i_bytes, &hello_r, AeadAlgorithm::ChaCha20Poly1305).unwrap();
        let initiator_keys = initiator_complete(init_state, &hello_r, &ct_bytes).unwrap();

        let mut init_send = initiator_keys.send_context().unwrap();
        let resp_recv = responder_keys.recv_context().unwrap();

        let (ct, seq) = init_send.encrypt(b"ping", None).unwrap();
        assert_eq!(ct.len(), 4 + 16);
        let pt = resp_recv.decrypt(&ct, seq, None).unwrap();
        assert_eq!(pt, b"ping");
    }

    #[tokio::test]
    async fn devnet_handshake_roundtrip() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let prologue = b"animica/tcp/1".to_vec();
        let prologue2 = prologue.clone();
        let (outbound, inbound) = tokio::join!(
            devnet::perform(&mut a, true, &prologue, AeadAlgorithm::ChaCha20Poly1305),
            devnet::perform(&mut b, false, &prologue2, AeadAlgorithm::ChaCha20Poly1305),
        );
        let outbound = outbound.unwrap();
        let inbound = inbound.unwrap();
        assert_eq!(outbound.transcript_hash, inbound.transcript_hash);
        assert_eq!(outbound.send_key, inbound.recv_key);
    }

    #[tokio::test]
    async fn devnet_handshake_rejects_prologue_mismatch() {
        let (mut a, mut b) = tokio::io::duplex(4096);
        let (outbound, inbound) = tokio::join!(
            devnet::perform(&mut a, true, b"animica/tcp/1", AeadAlgorithm::ChaCha20Poly1305),
            devnet::perform(&mut b, false, b"animica/tcp/2", AeadAlgorithm::ChaCha20Poly1305),
        );
        assert!(outbound.is_err());
        assert!(inbound.is_err());
    }
}
