//! Symmetric encryption

use crate::error::{TrinityError, TrinityResult};
use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

/// Length of the AES-GCM authentication tag
pub const TAG_LEN: usize = 16;

/// Length of the AES-GCM nonce
pub const NONCE_LEN: usize = 12;

/// Encrypt data using AES-256-GCM
///
/// Returns the ciphertext with the 16-byte authentication tag appended.
pub fn aes256_gcm_encrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    plaintext: &[u8],
    aad: &[u8],
) -> TrinityResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TrinityError::EncryptionFailed)?;
    cipher
        .encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad })
        .map_err(|_| TrinityError::EncryptionFailed)
}

/// Decrypt data using AES-256-GCM
///
/// `ciphertext` must carry the tag appended, as produced by [`aes256_gcm_encrypt`].
pub fn aes256_gcm_decrypt(
    key: &[u8; 32],
    nonce: &[u8; NONCE_LEN],
    ciphertext: &[u8],
    aad: &[u8],
) -> TrinityResult<Vec<u8>> {
    let cipher = Aes256Gcm::new_from_slice(key).map_err(|_| TrinityError::DecryptionFailed)?;
    cipher
        .decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad })
        .map_err(|_| TrinityError::DecryptionFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let mut sealed = aes256_gcm_encrypt(&key, &nonce, b"vault secret", b"aad").unwrap();
        assert_eq!(sealed.len(), 12 + TAG_LEN);
        assert_eq!(
            aes256_gcm_decrypt(&key, &nonce, &sealed, b"aad").unwrap(),
            b"vault secret"
        );

        sealed[0] ^= 0xff;
        assert_eq!(
            aes256_gcm_decrypt(&key, &nonce, &sealed, b"aad"),
            Err(TrinityError::DecryptionFailed)
        );
    }

    #[test]
    fn test_wrong_aad_rejected() {
        let key = [1u8; 32];
        let nonce = [2u8; 12];
        let sealed = aes256_gcm_encrypt(&key, &nonce, b"data", b"chain-1").unwrap();
        assert!(aes256_gcm_decrypt(&key, &nonce, &sealed, b"chain-2").is_err());
    }
}
