//! Long-lived peer identity keypairs and peer-id derivation.
//!
//! Two signature schemes are supported, matching the alg-id tags carried
//! in the HELLO frame: Dilithium3 (`0x31`) and SPHINCS+-SHAKE-128s
//! (`0x32`). The core itself never signs a handshake transcript — that
//! is the protocol layer's job — but it owns key management and the
//! peer-id derivation that both layers rely on.

use std::fmt;
use std::fs::{metadata, read_to_string, OpenOptions};
use std::io::Write;
#[cfg(unix)]
use std::os::unix::fs::{OpenOptionsExt, PermissionsExt};

use base64ct::{Base64, Encoding};
use chrono::Utc;
use pqcrypto_dilithium::dilithium3::{
    detached_sign as dilithium3_sign, keypair as dilithium3_keypair,
    verify_detached_signature as dilithium3_verify, PublicKey as PqPublicKey3, SecretKey as PqSecretKey3,
};
use pqcrypto_sphincsplus::sphincsshake128ssimple::{
    detached_sign as sphincs_sign, keypair as sphincs_keypair, verify_detached_signature as sphincs_verify,
    PublicKey as PqPublicKeySp, SecretKey as PqSecretKeySp,
};
use pqcrypto_traits::sign::{DetachedSignature as PqDetachedSignature, PublicKey, SecretKey};
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha3::{Digest, Sha3_256};
use subtle::ConstantTimeEq;
use zeroize::ZeroizeOnDrop;

use crate::error::{P2pError, Result};

pub const DILITHIUM3_ALG_ID: u8 = 0x31;
pub const SPHINCS_SHAKE_128S_ALG_ID: u8 = 0x32;

pub const DILITHIUM3_SIGNATURE_SIZE: usize = pqcrypto_dilithium::dilithium3::signature_bytes();
pub const DILITHIUM3_PUBKEY_SIZE: usize = pqcrypto_dilithium::dilithium3::public_key_bytes();
pub const DILITHIUM3_SECKEY_SIZE: usize = pqcrypto_dilithium::dilithium3::secret_key_bytes();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IdentityAlgorithm {
    Dilithium3,
    SphincsShake128s,
}

impl IdentityAlgorithm {
    pub fn alg_id(&self) -> u8 {
        match self {
            IdentityAlgorithm::Dilithium3 => DILITHIUM3_ALG_ID,
            IdentityAlgorithm::SphincsShake128s => SPHINCS_SHAKE_128S_ALG_ID,
        }
    }

    pub fn from_alg_id(id: u8) -> Result<Self> {
        match id {
            DILITHIUM3_ALG_ID => Ok(IdentityAlgorithm::Dilithium3),
            SPHINCS_SHAKE_128S_ALG_ID => Ok(IdentityAlgorithm::SphincsShake128s),
            other => Err(P2pError::InvalidArgument(format!("unknown identity alg id: {other:#x}"))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PemKeyPair {
    pub private_key: String,
    pub public_key: String,
}

/// A signature produced by an `IdentityKeypair`, tagged with the
/// algorithm it was produced under so a verifier need not guess.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySignature {
    pub algorithm: IdentityAlgorithm,
    pub signature: Vec<u8>,
    pub public_key: Vec<u8>,
}

/// A post-quantum identity keypair, zeroized on drop.
#[derive(Debug, Clone, Serialize, Deserialize, ZeroizeOnDrop)]
pub enum IdentityKeypair {
    Dilithium3 {
        #[zeroize(skip)]
        public_key: Vec<u8>,
        secret_key: Vec<u8>,
        #[zeroize(skip)]
        created_at: u64,
    },
    SphincsShake128s {
        #[zeroize(skip)]
        public_key: Vec<u8>,
        secret_key: Vec<u8>,
        #[zeroize(skip)]
        created_at: u64,
    },
}

impl IdentityKeypair {
    pub fn generate(algorithm: IdentityAlgorithm) -> Result<Self> {
        check_entropy()?;
        let created_at = Utc::now().timestamp() as u64;
        match algorithm {
            IdentityAlgorithm::Dilithium3 => {
                let (pk, sk) = dilithium3_keypair();
                Ok(IdentityKeypair::Dilithium3 {
                    public_key: pk.as_bytes().to_vec(),
                    secret_key: sk.as_bytes().to_vec(),
                    created_at,
                })
            }
            IdentityAlgorithm::SphincsShake128s => {
                let (pk, sk) = sphincs_keypair();
                Ok(IdentityKeypair::SphincsShake128s {
                    public_key: pk.as_bytes().to_vec(),
                    secret_key: sk.as_bytes().to_vec(),
                    created_at,
                })
            }
        }
    }

    pub fn algorithm(&self) -> IdentityAlgorithm {
        match self {
            IdentityKeypair::Dilithium3 { .. } => IdentityAlgorithm::Dilithium3,
            IdentityKeypair::SphincsShake128s { .. } => IdentityAlgorithm::SphincsShake128s,
        }
    }

    pub fn public_key_bytes(&self) -> &[u8] {
        match self {
            IdentityKeypair::Dilithium3 { public_key, .. } => public_key,
            IdentityKeypair::SphincsShake128s { public_key, .. } => public_key,
        }
    }

    /// `sha3_256(pubkey) || alg_tag`, hex-encoded — the peer-id the rest
    /// of the core refers to peers by.
    pub fn peer_id(&self) -> String {
        peer_id_from_public_key(self.public_key_bytes(), self.algorithm())
    }

    pub fn sign(&self, msg: &[u8]) -> Result<IdentitySignature> {
        match self {
            IdentityKeypair::Dilithium3 { public_key, secret_key, .. } => {
                let sk = PqSecretKey3::from_bytes(secret_key)
                    .map_err(|_| P2pError::Handshake("invalid dilithium3 secret key".into()))?;
                let sig = dilithium3_sign(msg, &sk);
                Ok(IdentitySignature {
                    algorithm: IdentityAlgorithm::Dilithium3,
                    signature: sig.as_bytes().to_vec(),
                    public_key: public_key.clone(),
                })
            }
            IdentityKeypair::SphincsShake128s { public_key, secret_key, .. } => {
                let sk = PqSecretKeySp::from_bytes(secret_key)
                    .map_err(|_| P2pError::Handshake("invalid sphincs+ secret key".into()))?;
                let sig = sphincs_sign(msg, &sk);
                Ok(IdentitySignature {
                    algorithm: IdentityAlgorithm::SphincsShake128s,
                    signature: sig.as_bytes().to_vec(),
                    public_key: public_key.clone(),
                })
            }
        }
    }

    pub fn verify(msg: &[u8], sig: &IdentitySignature) -> Result<bool> {
        match sig.algorithm {
            IdentityAlgorithm::Dilithium3 => {
                let pk = match PqPublicKey3::from_bytes(&sig.public_key) {
                    Ok(pk) => pk,
                    Err(_) => return Ok(false),
                };
                let ds = match PqDetachedSignature::from_bytes(&sig.signature) {
                    Ok(ds) => ds,
                    Err(_) => return Ok(false),
                };
                Ok(dilithium3_verify(&ds, msg, &pk).is_ok())
            }
            IdentityAlgorithm::SphincsShake128s => {
                let pk = match PqPublicKeySp::from_bytes(&sig.public_key) {
                    Ok(pk) => pk,
                    Err(_) => return Ok(false),
                };
                let ds = match PqDetachedSignature::from_bytes(&sig.signature) {
                    Ok(ds) => ds,
                    Err(_) => return Ok(false),
                };
                Ok(sphincs_verify(&ds, msg, &pk).is_ok())
            }
        }
    }

    /// Load from JSON (enforces 0600 permissions on Unix).
    pub fn load_from_file<P: AsRef<std::path::Path>>(path: P) -> Result<Self> {
        let perms = metadata(path.as_ref())?.permissions();
        #[cfg(unix)]
        if perms.mode() & 0o177 != 0 {
            return Err(P2pError::InvalidArgument(
                "insecure key file permissions: group/other access detected, use chmod 600".into(),
            ));
        }
        #[cfg(not(unix))]
        {
            if !perms.readonly() {
                log::warn!("key file is not read-only; restrict write access to this file");
            }
        }
        let content = read_to_string(path.as_ref())?;
        serde_json::from_str(&content).map_err(|e| P2pError::InvalidArgument(e.to_string()))
    }

    /// Save as JSON (0600 on Unix).
    pub fn save_to_file<P: AsRef<std::path::Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self).map_err(|e| P2pError::InvalidArgument(e.to_string()))?;
        #[cfg(unix)]
        {
            let mut file = OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .mode(0o600)
                .open(path.as_ref())?;
            file.write_all(json.as_bytes())?;
        }
        #[cfg(not(unix))]
        {
            std::fs::write(path.as_ref(), json)?;
        }
        Ok(())
    }
}

impl fmt::Display for IdentityKeypair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdentityKeypair({:?}, peer_id={})", self.algorithm(), self.peer_id())
    }
}

/// `sha3_256(pubkey) || alg_tag`, hex-encoded.
pub fn peer_id_from_public_key(pubkey: &[u8], algorithm: IdentityAlgorithm) -> String {
    let mut hasher = Sha3_256::new();
    hasher.update(pubkey);
    let digest = hasher.finalize();
    let mut out = Vec::with_capacity(33);
    out.extend_from_slice(&digest);
    out.push(algorithm.alg_id());
    hex::encode(out)
}

pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.ct_eq(b).into()
}

fn check_entropy() -> Result<()> {
    let mut buf = [0u8; 32];
    OsRng.fill_bytes(&mut buf);
    let ones: u32 = buf.iter().map(|b| b.count_ones()).sum();
    if !(96..=160).contains(&ones) {
        return Err(P2pError::InvalidArgument("insufficient entropy".into()));
    }
    Ok(())
}

/// Convenience PEM export, kept for operators who prefer to ship keys
/// as PEM-ish blocks rather than JSON.
pub fn to_pem(public_key: &[u8], secret_key: &[u8]) -> PemKeyPair {
    PemKeyPair {
        private_key: Base64::encode_string(secret_key),
        public_key: Base64::encode_string(public_key),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dilithium3_sign_verify_roundtrip() {
        let kp = IdentityKeypair::generate(IdentityAlgorithm::Dilithium3).unwrap();
        let sig = kp.sign(b"hello").unwrap();
        assert!(IdentityKeypair::verify(b"hello", &sig).unwrap());
        assert!(!IdentityKeypair::verify(b"tampered", &sig).unwrap());
    }

    #[test]
    fn sphincs_sign_verify_roundtrip() {
        let kp = IdentityKeypair::generate(IdentityAlgorithm::SphincsShake128s).unwrap();
        let sig = kp.sign(b"hello").unwrap();
        assert!(IdentityKeypair::verify(b"hello", &sig).unwrap());
    }

    #[test]
    fn peer_id_is_alg_tagged() {
        let kp = IdentityKeypair::generate(IdentityAlgorithm::Dilithium3).unwrap();
        let id = kp.peer_id();
        assert!(id.ends_with("31"));
    }

    #[test]
    fn alg_id_roundtrips() {
        assert_eq!(IdentityAlgorithm::from_alg_id(0x31).unwrap(), IdentityAlgorithm::Dilithium3);
        assert_eq!(IdentityAlgorithm::from_alg_id(0x32).unwrap(), IdentityAlgorithm::SphincsShake128s);
        assert!(IdentityAlgorithm::from_alg_id(0xFF).is_err());
    }
}
