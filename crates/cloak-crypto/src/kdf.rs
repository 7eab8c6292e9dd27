//! Key derivation: Argon2id passphrase → secret key

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use zeroize::Zeroize;

use cloak_core::config::KdfConfig;
use cloak_core::{CloakError, CloakResult};

use crate::{KEY_SIZE, SALT_SIZE};

/// A 256-bit symmetric key. Held by one engine instance, never persisted.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct SecretKey {
    bytes: [u8; KEY_SIZE],
}

impl SecretKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for SecretKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecretKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Argon2id parameters for KDF
#[derive(Debug, Clone)]
pub struct KdfParams {
    /// Memory cost in KiB (default: 65536 = 64 MiB)
    pub mem_cost_kib: u32,
    /// Time cost / iterations (default: 3)
    pub time_cost: u32,
    /// Parallelism (default: 4)
    pub parallelism: u32,
}

impl Default for KdfParams {
    fn default() -> Self {
        Self {
            mem_cost_kib: 65536,
            time_cost: 3,
            parallelism: 4,
        }
    }
}

impl From<&KdfConfig> for KdfParams {
    fn from(cfg: &KdfConfig) -> Self {
        Self {
            mem_cost_kib: cfg.mem_cost_kib,
            time_cost: cfg.time_cost,
            parallelism: cfg.parallelism,
        }
    }
}

/// Random salt for a new store.
pub fn generate_salt() -> [u8; SALT_SIZE] {
    let mut salt = [0u8; SALT_SIZE];
    rand::thread_rng().fill_bytes(&mut salt);
    salt
}

/// Derive the 256-bit secret key from a passphrase and salt using Argon2id.
///
/// The salt lives in the store envelope header (it does not need to be
/// secret), so the same passphrase always re-derives the same key.
pub fn derive_secret_key(
    passphrase: &SecretString,
    salt: &[u8; SALT_SIZE],
    params: &KdfParams,
) -> CloakResult<SecretKey> {
    let argon2_params = Params::new(
        params.mem_cost_kib,
        params.time_cost,
        params.parallelism,
        Some(KEY_SIZE),
    )
    .map_err(|e| CloakError::Config(format!("invalid Argon2id params: {e}")))?;

    let argon2 = Argon2::new(Algorithm::Argon2id, Version::V0x13, argon2_params);

    let mut key = [0u8; KEY_SIZE];
    argon2
        .hash_password_into(passphrase.expose_secret().as_bytes(), salt, &mut key)
        .map_err(|e| CloakError::Crypto(format!("Argon2id KDF failed: {e}")))?;

    tracing::debug!(
        mem_cost_kib = params.mem_cost_kib,
        time_cost = params.time_cost,
        "derived secret key"
    );
    Ok(SecretKey::from_bytes(key))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_params() -> KdfParams {
        KdfParams {
            mem_cost_kib: 1024,
            time_cost: 1,
            parallelism: 1,
        }
    }

    #[test]
    fn test_kdf_deterministic() {
        let passphrase = SecretString::from("test-passphrase-123");
        let salt = [1u8; SALT_SIZE];

        let key1 = derive_secret_key(&passphrase, &salt, &fast_params()).unwrap();
        let key2 = derive_secret_key(&passphrase, &salt, &fast_params()).unwrap();

        assert_eq!(key1.as_bytes(), key2.as_bytes(), "KDF must be deterministic");
    }

    #[test]
    fn test_kdf_different_passphrases() {
        let salt = [1u8; SALT_SIZE];
        let key1 =
            derive_secret_key(&SecretString::from("passphrase-a"), &salt, &fast_params()).unwrap();
        let key2 =
            derive_secret_key(&SecretString::from("passphrase-b"), &salt, &fast_params()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_kdf_different_salts() {
        let passphrase = SecretString::from("same-passphrase");
        let key1 = derive_secret_key(&passphrase, &[1u8; SALT_SIZE], &fast_params()).unwrap();
        let key2 = derive_secret_key(&passphrase, &[2u8; SALT_SIZE], &fast_params()).unwrap();

        assert_ne!(key1.as_bytes(), key2.as_bytes());
    }

    #[test]
    fn test_invalid_params_are_config_errors() {
        let params = KdfParams {
            mem_cost_kib: 1,
            time_cost: 0,
            parallelism: 0,
        };
        let err = derive_secret_key(&SecretString::from("x"), &[0u8; SALT_SIZE], &params)
            .unwrap_err();
        assert!(matches!(err, CloakError::Config(_)));
    }

    #[test]
    fn test_debug_is_redacted() {
        let key = SecretKey::from_bytes([9u8; KEY_SIZE]);
        let shown = format!("{key:?}");
        assert!(shown.contains("REDACTED"));
        assert!(!shown.contains('9'));
    }

    #[test]
    fn test_salts_are_random() {
        assert_ne!(generate_salt(), generate_salt());
    }
}
