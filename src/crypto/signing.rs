//! Digital signature primitives
//!
//! Each chain's enclave signs with a fixed scheme whose encoded sizes
//! downstream verifiers depend on:
//!
//! | Scheme      | Public key | Signature |
//! |-------------|-----------:|----------:|
//! | secp256k1   | 33 (SEC1 compressed) | 65 (`r ‖ s ‖ v`) |
//! | ed25519     | 32         | 64        |
//! | Dilithium5  | 2592       | 4595 (detached) |

use crate::error::{TrinityError, TrinityResult};

fn fixed<const N: usize>(bytes: &[u8], what: &str) -> TrinityResult<[u8; N]> {
    bytes
        .try_into()
        .map_err(|_| TrinityError::CryptoError(format!("{} must be {} bytes", what, N)))
}

/// Derive an Ed25519 public key from a 32-byte seed
pub fn ed25519_public_key(seed: &[u8]) -> TrinityResult<[u8; 32]> {
    use ed25519_dalek::SigningKey;

    let signing_key = SigningKey::from_bytes(&fixed::<32>(seed, "ed25519 seed")?);
    Ok(signing_key.verifying_key().to_bytes())
}

/// Sign message with Ed25519
pub fn ed25519_sign(seed: &[u8], message: &[u8]) -> TrinityResult<Vec<u8>> {
    use ed25519_dalek::{Signer, SigningKey};

    let signing_key = SigningKey::from_bytes(&fixed::<32>(seed, "ed25519 seed")?);
    Ok(signing_key.sign(message).to_bytes().to_vec())
}

/// Verify Ed25519 signature
pub fn ed25519_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> TrinityResult<bool> {
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};

    let Ok(sig_bytes) = <[u8; 64]>::try_from(signature) else {
        return Ok(false);
    };
    let verifying_key = VerifyingKey::from_bytes(&fixed::<32>(public_key, "ed25519 public key")?)
        .map_err(|e| TrinityError::CryptoError(e.to_string()))?;

    Ok(verifying_key
        .verify(message, &Signature::from_bytes(&sig_bytes))
        .is_ok())
}

/// Compressed SEC1 public key for a secp256k1 secret
pub fn secp256k1_public_key(secret_key: &[u8]) -> TrinityResult<Vec<u8>> {
    use k256::ecdsa::SigningKey;

    let signing_key = SigningKey::from_slice(secret_key)
        .map_err(|_| TrinityError::CryptoError("Invalid secp256k1 key".into()))?;
    Ok(signing_key
        .verifying_key()
        .to_encoded_point(true)
        .as_bytes()
        .to_vec())
}

/// Sign message with secp256k1 over its Keccak-256 hash
///
/// Produces the 65-byte recoverable form `r ‖ s ‖ v` with `v = 27 + recovery id`.
pub fn secp256k1_sign(secret_key: &[u8], message: &[u8]) -> TrinityResult<Vec<u8>> {
    use k256::ecdsa::SigningKey;

    let signing_key = SigningKey::from_slice(secret_key)
        .map_err(|_| TrinityError::CryptoError("Invalid secp256k1 key".into()))?;
    let digest = crate::crypto::keccak256(message);
    let (signature, recovery_id) = signing_key
        .sign_prehash_recoverable(&digest)
        .map_err(|e| TrinityError::CryptoError(e.to_string()))?;

    let mut out = Vec::with_capacity(65);
    out.extend_from_slice(&signature.to_bytes());
    out.push(27 + recovery_id.to_byte());
    Ok(out)
}

/// Verify a 65-byte recoverable secp256k1 signature against a compressed public key
pub fn secp256k1_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> TrinityResult<bool> {
    use k256::ecdsa::{RecoveryId, Signature, VerifyingKey};

    if signature.len() != 65 {
        return Ok(false);
    }
    let expected = VerifyingKey::from_sec1_bytes(public_key)
        .map_err(|_| TrinityError::CryptoError("Invalid secp256k1 public key".into()))?;
    let Ok(sig) = Signature::from_slice(&signature[..64]) else {
        return Ok(false);
    };
    let Some(recovery_id) = signature[64].checked_sub(27).and_then(RecoveryId::from_byte) else {
        return Ok(false);
    };

    let digest = crate::crypto::keccak256(message);
    match VerifyingKey::recover_from_prehash(&digest, &sig, recovery_id) {
        Ok(recovered) => Ok(recovered == expected),
        Err(_) => Ok(false),
    }
}

/// Generate a CRYSTALS-Dilithium5 key pair, returned as (public, secret)
pub fn dilithium_keypair() -> (Vec<u8>, Vec<u8>) {
    use pqcrypto_dilithium::dilithium5;
    use pqcrypto_traits::sign::{PublicKey as _, SecretKey as _};

    let (pk, sk) = dilithium5::keypair();
    (pk.as_bytes().to_vec(), sk.as_bytes().to_vec())
}

/// Detached Dilithium5 signature
pub fn dilithium_sign(secret_key: &[u8], message: &[u8]) -> TrinityResult<Vec<u8>> {
    use pqcrypto_dilithium::dilithium5;
    use pqcrypto_traits::sign::{DetachedSignature as _, SecretKey as _};

    let sk = dilithium5::SecretKey::from_bytes(secret_key)
        .map_err(|_| TrinityError::CryptoError("Invalid Dilithium key".into()))?;
    Ok(dilithium5::detached_sign(message, &sk).as_bytes().to_vec())
}

/// Verify a detached Dilithium5 signature
pub fn dilithium_verify(public_key: &[u8], message: &[u8], signature: &[u8]) -> TrinityResult<bool> {
    use pqcrypto_dilithium::dilithium5;
    use pqcrypto_traits::sign::{DetachedSignature as _, PublicKey as _};

    let pk = dilithium5::PublicKey::from_bytes(public_key)
        .map_err(|_| TrinityError::CryptoError("Invalid Dilithium public key".into()))?;
    let Ok(sig) = dilithium5::DetachedSignature::from_bytes(signature) else {
        return Ok(false);
    };
    Ok(dilithium5::verify_detached_signature(&sig, message, &pk).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::random_bytes;

    #[test]
    fn test_ed25519_sign_verify() {
        let seed = random_bytes(32).unwrap();
        let pk = ed25519_public_key(&seed).unwrap();

        let signature = ed25519_sign(&seed, b"vote").unwrap();
        assert_eq!(signature.len(), 64);
        assert!(ed25519_verify(&pk, b"vote", &signature).unwrap());
        assert!(!ed25519_verify(&pk, b"other vote", &signature).unwrap());
    }

    #[test]
    fn test_secp256k1_recoverable_signature() {
        let secret = random_bytes(32).unwrap();
        let pk = secp256k1_public_key(&secret).unwrap();
        assert_eq!(pk.len(), 33);

        let signature = secp256k1_sign(&secret, b"vote").unwrap();
        assert_eq!(signature.len(), 65);
        assert!(signature[64] == 27 || signature[64] == 28);
        assert!(secp256k1_verify(&pk, b"vote", &signature).unwrap());
        assert!(!secp256k1_verify(&pk, b"forged", &signature).unwrap());
    }

    #[test]
    fn test_secp256k1_rejects_other_key() {
        let secret = random_bytes(32).unwrap();
        let other = secp256k1_public_key(&random_bytes(32).unwrap()).unwrap();
        let signature = secp256k1_sign(&secret, b"vote").unwrap();
        assert!(!secp256k1_verify(&other, b"vote", &signature).unwrap());
    }

    #[test]
    fn test_dilithium_sizes() {
        let (pk, sk) = dilithium_keypair();
        assert_eq!(pk.len(), 2592);

        let signature = dilithium_sign(&sk, b"vote").unwrap();
        assert_eq!(signature.len(), 4595);
        assert!(dilithium_verify(&pk, b"vote", &signature).unwrap());
        assert!(!dilithium_verify(&pk, b"forged", &signature).unwrap());
    }

    #[test]
    fn test_ed25519_wrong_length_signature() {
        let seed = random_bytes(32).unwrap();
        let pk = ed25519_public_key(&seed).unwrap();
        assert!(!ed25519_verify(&pk, b"message", &[0u8; 10]).unwrap());
    }
}
