//! Cryptographic primitives
//!
//! Provides:
//! - Randomness (correlation ids, nonces, key seeds)
//! - Digital signatures (secp256k1, Ed25519, Dilithium5)
//! - AES-256-GCM sealing
//! - Hash functions (SHA-256, Keccak-256)
//! - Key derivation (HKDF)

use crate::error::{TrinityError, TrinityResult};
use crate::types::{KeyAlgorithm, PublicKey, Signature};

use zeroize::{Zeroize, ZeroizeOnDrop};

mod hashing;
mod kdf;
mod signing;
mod symmetric;

pub use hashing::*;
pub use kdf::*;
pub use signing::*;
pub use symmetric::*;

/// Generate cryptographically secure random bytes
pub fn random_bytes(len: usize) -> TrinityResult<Vec<u8>> {
    let mut bytes = vec![0u8; len];
    getrandom::getrandom(&mut bytes).map_err(|_| TrinityError::RngFailed)?;
    Ok(bytes)
}

/// Generate a fixed-size random array
pub fn random_array<const N: usize>() -> TrinityResult<[u8; N]> {
    let mut bytes = [0u8; N];
    getrandom::getrandom(&mut bytes).map_err(|_| TrinityError::RngFailed)?;
    Ok(bytes)
}

/// Random hex correlation id (16 bytes of entropy)
pub fn correlation_id() -> TrinityResult<String> {
    Ok(hex::encode(random_array::<16>()?))
}

/// Constant-time comparison
pub fn secure_compare(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }

    result == 0
}

/// Verify a signature with the scheme named by the public key
pub fn verify_signature(
    public_key: &PublicKey,
    message: &[u8],
    signature: &Signature,
) -> TrinityResult<bool> {
    if public_key.algorithm != signature.algorithm {
        return Ok(false);
    }
    match public_key.algorithm {
        KeyAlgorithm::Ed25519 => ed25519_verify(&public_key.bytes, message, &signature.bytes),
        KeyAlgorithm::Secp256k1 => secp256k1_verify(&public_key.bytes, message, &signature.bytes),
        KeyAlgorithm::Dilithium5 => dilithium_verify(&public_key.bytes, message, &signature.bytes),
    }
}

/// Key pair for asymmetric operations
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct KeyPair {
    /// Secret key (zeroized on drop)
    secret_key: Vec<u8>,
    /// Public key
    #[zeroize(skip)]
    public_key: PublicKey,
    /// Algorithm type
    #[zeroize(skip)]
    algorithm: KeyAlgorithm,
}

impl KeyPair {
    /// Generate a new key pair
    pub fn generate(algorithm: KeyAlgorithm) -> TrinityResult<Self> {
        match algorithm {
            KeyAlgorithm::Ed25519 => {
                let seed = random_bytes(32)?;
                let pk = ed25519_public_key(&seed)?;
                Ok(Self {
                    secret_key: seed,
                    public_key: PublicKey::new(pk.to_vec(), algorithm),
                    algorithm,
                })
            }
            KeyAlgorithm::Secp256k1 => {
                let secret = random_bytes(32)?;
                let pk = secp256k1_public_key(&secret)?;
                Ok(Self {
                    secret_key: secret,
                    public_key: PublicKey::new(pk, algorithm),
                    algorithm,
                })
            }
            KeyAlgorithm::Dilithium5 => {
                let (pk, sk) = dilithium_keypair();
                Ok(Self {
                    secret_key: sk,
                    public_key: PublicKey::new(pk, algorithm),
                    algorithm,
                })
            }
        }
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> TrinityResult<Signature> {
        let bytes = match self.algorithm {
            KeyAlgorithm::Ed25519 => ed25519_sign(&self.secret_key, message)?,
            KeyAlgorithm::Secp256k1 => secp256k1_sign(&self.secret_key, message)?,
            KeyAlgorithm::Dilithium5 => dilithium_sign(&self.secret_key, message)?,
        };
        Ok(Signature::new(bytes, self.algorithm))
    }

    /// Get the public key
    pub fn public_key(&self) -> &PublicKey {
        &self.public_key
    }

    /// Get the algorithm
    pub fn algorithm(&self) -> KeyAlgorithm {
        self.algorithm
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("public_key", &self.public_key)
            .field("algorithm", &self.algorithm)
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_bytes() {
        let bytes1 = random_bytes(32).unwrap();
        let bytes2 = random_bytes(32).unwrap();
        assert_eq!(bytes1.len(), 32);
        assert_ne!(bytes1, bytes2);
    }

    #[test]
    fn test_correlation_ids_unique() {
        let a = correlation_id().unwrap();
        let b = correlation_id().unwrap();
        assert_eq!(a.len(), 32);
        assert_ne!(a, b);
    }

    #[test]
    fn test_secure_compare() {
        assert!(secure_compare(b"hello world", b"hello world"));
        assert!(!secure_compare(b"hello world", b"hello worle"));
        assert!(!secure_compare(b"short", b"longer"));
    }

    #[test]
    fn test_keypair_sizes_per_algorithm() {
        for algorithm in [KeyAlgorithm::Ed25519, KeyAlgorithm::Secp256k1, KeyAlgorithm::Dilithium5] {
            let kp = KeyPair::generate(algorithm).unwrap();
            assert_eq!(kp.public_key().bytes.len(), algorithm.public_key_len());

            let sig = kp.sign(b"operation digest").unwrap();
            assert_eq!(sig.bytes.len(), algorithm.signature_len());
            assert!(verify_signature(kp.public_key(), b"operation digest", &sig).unwrap());
        }
    }

    #[test]
    fn test_verify_rejects_algorithm_mismatch() {
        let kp = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        let mut sig = kp.sign(b"m").unwrap();
        sig.algorithm = KeyAlgorithm::Secp256k1;
        assert!(!verify_signature(kp.public_key(), b"m", &sig).unwrap());
    }

    #[test]
    fn test_debug_redacts_secret() {
        let kp = KeyPair::generate(KeyAlgorithm::Ed25519).unwrap();
        assert!(format!("{:?}", kp).contains("[REDACTED]"));
    }
}
