//! Sequence-nonced AEAD framing for established P2P sessions.
//!
//! `animica/p2p/aead/v1` binds every record to a fixed domain tag so the
//! same key material can never be replayed into an unrelated context.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use serde::{Deserialize, Serialize};

use crate::error::{P2pError, Result};

pub const AEAD_DOMAIN_TAG: &[u8] = b"animica/p2p/aead/v1";
pub const NONCE_SIZE: usize = 12;
pub const KEY_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AeadAlgorithm {
    ChaCha20Poly1305,
    Aes256Gcm,
}

impl AeadAlgorithm {
    pub fn name(&self) -> &'static str {
        match self {
            AeadAlgorithm::ChaCha20Poly1305 => "chacha20-poly1305",
            AeadAlgorithm::Aes256Gcm => "aes-256-gcm",
        }
    }

    pub fn from_name(name: &str) -> Result<Self> {
        match name {
            "chacha20-poly1305" => Ok(AeadAlgorithm::ChaCha20Poly1305),
            "aes-256-gcm" => Ok(AeadAlgorithm::Aes256Gcm),
            other => Err(P2pError::Aead(format!("unknown aead algorithm: {other}"))),
        }
    }

    /// Algorithms compiled into this build, in preference order.
    pub fn available() -> &'static [AeadAlgorithm] {
        &[AeadAlgorithm::ChaCha20Poly1305, AeadAlgorithm::Aes256Gcm]
    }
}

impl Default for AeadAlgorithm {
    fn default() -> Self {
        AeadAlgorithm::ChaCha20Poly1305
    }
}

enum Cipher {
    ChaCha20Poly1305(ChaCha20Poly1305),
    Aes256Gcm(Aes256Gcm),
}

/// A single-direction AEAD session: one key, one nonce base, one
/// strictly monotonic sequence counter.
pub struct AeadContext {
    algorithm: AeadAlgorithm,
    cipher: Cipher,
    nonce_base: [u8; NONCE_SIZE],
    seq: u64,
}

fn derive_nonce(nonce_base: &[u8; NONCE_SIZE], seq: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = *nonce_base;
    let seq_be = seq.to_be_bytes();
    for i in 0..8 {
        nonce[4 + i] ^= seq_be[i];
    }
    nonce
}

impl AeadContext {
    pub fn new(algorithm: AeadAlgorithm, key: &[u8], nonce_base: &[u8]) -> Result<Self> {
        Self::with_seq(algorithm, key, nonce_base, 0)
    }

    pub fn with_seq(algorithm: AeadAlgorithm, key: &[u8], nonce_base: &[u8], initial_seq: u64) -> Result<Self> {
        if key.len() != KEY_SIZE {
            return Err(P2pError::Aead(format!("key must be {KEY_SIZE} bytes, got {}", key.len())));
        }
        if nonce_base.len() != NONCE_SIZE {
            return Err(P2pError::Aead(format!(
                "nonce_base must be {NONCE_SIZE} bytes, got {}",
                nonce_base.len()
            )));
        }
        let cipher = match algorithm {
            AeadAlgorithm::ChaCha20Poly1305 => {
                Cipher::ChaCha20Poly1305(ChaCha20Poly1305::new_from_slice(key).map_err(|e| P2pError::Aead(e.to_string()))?)
            }
            AeadAlgorithm::Aes256Gcm => {
                Cipher::Aes256Gcm(Aes256Gcm::new_from_slice(key).map_err(|e| P2pError::Aead(e.to_string()))?)
            }
        };
        let mut base = [0u8; NONCE_SIZE];
        base.copy_from_slice(nonce_base);
        Ok(Self { algorithm, cipher, nonce_base: base, seq: initial_seq })
    }

    pub fn algorithm(&self) -> AeadAlgorithm {
        self.algorithm
    }

    pub fn seq(&self) -> u64 {
        self.seq
    }

    fn aad(&self, user_aad: Option<&[u8]>) -> Vec<u8> {
        let mut out = AEAD_DOMAIN_TAG.to_vec();
        if let Some(a) = user_aad {
            out.extend_from_slice(a);
        }
        out
    }

    /// Encrypts `plaintext`, advancing the sequence counter. Returns the
    /// ciphertext (with trailing tag) and the sequence number used.
    pub fn encrypt(&mut self, plaintext: &[u8], aad: Option<&[u8]>) -> Result<(Vec<u8>, u64)> {
        if self.seq == u64::MAX {
            return Err(P2pError::SequenceExhausted);
        }
        let used_seq = self.seq;
        let nonce = derive_nonce(&self.nonce_base, used_seq);
        let aad_bytes = self.aad(aad);
        let payload = Payload { msg: plaintext, aad: &aad_bytes };
        let ct = self.seal(&nonce, payload)?;
        self.seq += 1;
        Ok((ct, used_seq))
    }

    /// Decrypts `ciphertext` at the given out-of-band `seq`. Does not
    /// mutate the context's own counter — the caller is responsible for
    /// rejecting stale or out-of-order sequence numbers.
    pub fn decrypt(&self, ciphertext: &[u8], seq: u64, aad: Option<&[u8]>) -> Result<Vec<u8>> {
        let nonce = derive_nonce(&self.nonce_base, seq);
        let aad_bytes = self.aad(aad);
        let payload = Payload { msg: ciphertext, aad: &aad_bytes };
        self.open(&nonce, payload)
    }

    fn seal(&self, nonce: &[u8; NONCE_SIZE], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
        match &self.cipher {
            Cipher::ChaCha20Poly1305(c) => c
                .encrypt(nonce.into(), payload)
                .map_err(|e| P2pError::Aead(e.to_string())),
            Cipher::Aes256Gcm(c) => c
                .encrypt(nonce.into(), payload)
                .map_err(|e| P2pError::Aead(e.to_string())),
        }
    }

    fn open(&self, nonce: &[u8; NONCE_SIZE], payload: Payload<'_, '_>) -> Result<Vec<u8>> {
        match &self.cipher {
            Cipher::ChaCha20Poly1305(c) => c
                .decrypt(nonce.into(), payload)
                .map_err(|e| P2pError::Aead(e.to_string())),
            Cipher::Aes256Gcm(c) => c
                .decrypt(nonce.into(), payload)
                .map_err(|e| P2pError::Aead(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nonce_derivation_xors_only_last_eight_bytes() {
        let base = [1u8, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];
        let nonce = derive_nonce(&base, 1);
        assert_eq!(&nonce[..4], &base[..4]);
        assert_ne!(&nonce[4..], &base[4..]);
    }

    #[test]
    fn roundtrip_chacha20poly1305() {
        let key = [7u8; KEY_SIZE];
        let base = [0u8; NONCE_SIZE];
        let mut tx = AeadContext::new(AeadAlgorithm::ChaCha20Poly1305, &key, &base).unwrap();
        let rx = AeadContext::new(AeadAlgorithm::ChaCha20Poly1305, &key, &base).unwrap();
        let (ct, seq) = tx.encrypt(b"hello", None).unwrap();
        let pt = rx.decrypt(&ct, seq, None).unwrap();
        assert_eq!(pt, b"hello");
    }

    #[test]
    fn roundtrip_aes256gcm() {
        let key = [9u8; KEY_SIZE];
        let base = [0u8; NONCE_SIZE];
        let mut tx = AeadContext::new(AeadAlgorithm::Aes256Gcm, &key, &base).unwrap();
        let rx = AeadContext::new(AeadAlgorithm::Aes256Gcm, &key, &base).unwrap();
        let (ct, seq) = tx.encrypt(b"world", Some(b"aad")).unwrap();
        let pt = rx.decrypt(&ct, seq, Some(b"aad")).unwrap();
        assert_eq!(pt, b"world");
    }

    #[test]
    fn sequence_exhaustion_is_reported() {
        let key = [1u8; KEY_SIZE];
        let base = [0u8; NONCE_SIZE];
        let mut tx = AeadContext::with_seq(AeadAlgorithm::ChaCha20Poly1305, &key, &base, u64::MAX).unwrap();
        let err = tx.encrypt(b"x", None).unwrap_err();
        assert!(matches!(err, P2pError::SequenceExhausted));
    }

    #[test]
    fn wrong_seq_fails_to_decrypt() {
        let key = [3u8; KEY_SIZE];
        let base = [0u8; NONCE_SIZE];
        let mut tx = AeadContext::new(AeadAlgorithm::ChaCha20Poly1305, &key, &base).unwrap();
        let rx = AeadContext::new(AeadAlgorithm::ChaCha20Poly1305, &key, &base).unwrap();
        let (ct, seq) = tx.encrypt(b"data", None).unwrap();
        assert!(rx.decrypt(&ct, seq + 1, None).is_err());
    }
}
