//! Sub-key derivation: secret key → store key, name key

use hkdf::Hkdf;
use sha2::Sha256;

use cloak_core::{CloakError, CloakResult};

use crate::kdf::SecretKey;
use crate::KEY_SIZE;

/// Derive the metadata document key from the secret key via HKDF-SHA256.
pub fn derive_store_key(secret: &SecretKey) -> CloakResult<SecretKey> {
    hkdf_derive(secret.as_bytes(), b"cloak-store")
}

/// Derive the name sealing key from the secret key via HKDF-SHA256.
pub fn derive_name_key(secret: &SecretKey) -> CloakResult<SecretKey> {
    hkdf_derive(secret.as_bytes(), b"cloak-names")
}

/// HKDF-SHA256 key derivation with a domain-specific info string.
fn hkdf_derive(ikm: &[u8; KEY_SIZE], info: &[u8]) -> CloakResult<SecretKey> {
    let hkdf = Hkdf::<Sha256>::new(None, ikm);
    let mut okm = [0u8; KEY_SIZE];
    hkdf.expand(info, &mut okm)
        .map_err(|e| CloakError::Crypto(format!("HKDF expand failed: {e}")))?;
    Ok(SecretKey::from_bytes(okm))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_secret_key() -> SecretKey {
        SecretKey::from_bytes([42u8; KEY_SIZE])
    }

    #[test]
    fn test_hkdf_derive_different_domains() {
        let secret = test_secret_key();
        let store_key = derive_store_key(&secret).unwrap();
        let name_key = derive_name_key(&secret).unwrap();

        assert_ne!(
            store_key.as_bytes(),
            name_key.as_bytes(),
            "different domains must produce different keys"
        );
        assert_ne!(store_key.as_bytes(), secret.as_bytes());
    }

    #[test]
    fn test_hkdf_is_deterministic() {
        let a = derive_store_key(&test_secret_key()).unwrap();
        let b = derive_store_key(&test_secret_key()).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }
}
