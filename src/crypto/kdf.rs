//! HKDF-SHA256 key derivation

use crate::error::{TrinityError, TrinityResult};
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

fn mac(key: &[u8]) -> TrinityResult<HmacSha256> {
    HmacSha256::new_from_slice(key).map_err(|e| TrinityError::CryptoError(e.to_string()))
}

/// HKDF-SHA256 Extract
pub fn hkdf_extract(salt: &[u8], ikm: &[u8]) -> TrinityResult<[u8; 32]> {
    let salt: &[u8] = if salt.is_empty() { &[0u8; 32] } else { salt };
    let mut mac = mac(salt)?;
    mac.update(ikm);
    Ok(mac.finalize().into_bytes().into())
}

/// HKDF-SHA256 Expand
pub fn hkdf_expand(prk: &[u8; 32], info: &[u8], length: usize) -> TrinityResult<Vec<u8>> {
    if length > 255 * 32 {
        return Err(TrinityError::CryptoError("HKDF output too long".into()));
    }

    let blocks = length.div_ceil(32);
    let mut output = Vec::with_capacity(length);
    let mut t = Vec::new();

    for i in 1..=blocks {
        let mut mac = mac(prk)?;
        mac.update(&t);
        mac.update(info);
        mac.update(&[i as u8]);
        t = mac.finalize().into_bytes().to_vec();
        output.extend_from_slice(&t);
    }

    output.truncate(length);
    Ok(output)
}

/// Derive a 32-byte key bound to a chain and a purpose label
pub fn derive_chain_key(master: &[u8], chain_id: u8, purpose: &str) -> TrinityResult<[u8; 32]> {
    let prk = hkdf_extract(b"trinity-coordinator", master)?;
    let info = [&[chain_id][..], purpose.as_bytes()].concat();
    let derived = hkdf_expand(&prk, &info, 32)?;
    let mut key = [0u8; 32];
    key.copy_from_slice(&derived);
    Ok(key)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hkdf_expand_prefix_stable() {
        let prk = [0x42u8; 32];
        let key32 = hkdf_expand(&prk, b"context", 32).unwrap();
        let key64 = hkdf_expand(&prk, b"context", 64).unwrap();
        assert_eq!(&key32[..], &key64[..32]);
    }

    #[test]
    fn test_chain_keys_are_separated() {
        let master = [7u8; 32];
        let a = derive_chain_key(&master, 1, "seal").unwrap();
        let b = derive_chain_key(&master, 2, "seal").unwrap();
        let c = derive_chain_key(&master, 1, "attest").unwrap();
        assert_ne!(a, b);
        assert_ne!(a, c);
        assert_eq!(a, derive_chain_key(&master, 1, "seal").unwrap());
    }
}
