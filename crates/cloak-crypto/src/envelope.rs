//! Metadata store envelope
//!
//! The store file is one opaque blob:
//! ```text
//! [8 bytes: "CLOAKDB1"][16 bytes: Argon2id salt][one sealed frame: JSON document]
//! ```
//! The salt is readable before any key exists so the engine can re-derive the
//! secret key from the passphrase; everything after it is authenticated.

use cloak_core::{CloakError, CloakResult};

use crate::chunk::{open, seal};
use crate::kdf::SecretKey;
use crate::SALT_SIZE;

pub const STORE_MAGIC: &[u8; 8] = b"CLOAKDB1";

pub const ENVELOPE_HEADER_SIZE: usize = STORE_MAGIC.len() + SALT_SIZE;

/// Extract the KDF salt from a store blob.
pub fn read_salt(blob: &[u8]) -> CloakResult<[u8; SALT_SIZE]> {
    if blob.len() < ENVELOPE_HEADER_SIZE || &blob[..STORE_MAGIC.len()] != STORE_MAGIC {
        return Err(CloakError::Store("not a cloak metadata store".into()));
    }
    let mut salt = [0u8; SALT_SIZE];
    salt.copy_from_slice(&blob[STORE_MAGIC.len()..ENVELOPE_HEADER_SIZE]);
    Ok(salt)
}

/// Seal the serialized document under the store key.
pub fn seal_document(
    store_key: &SecretKey,
    salt: &[u8; SALT_SIZE],
    document: &[u8],
) -> CloakResult<Vec<u8>> {
    let frame = seal(store_key, document)?;
    let mut blob = Vec::with_capacity(ENVELOPE_HEADER_SIZE + frame.len());
    blob.extend_from_slice(STORE_MAGIC);
    blob.extend_from_slice(salt);
    blob.extend_from_slice(&frame);
    Ok(blob)
}

/// Authenticate and open a store blob, returning the serialized document.
pub fn open_document(store_key: &SecretKey, blob: &[u8]) -> CloakResult<Vec<u8>> {
    read_salt(blob)?;
    open(store_key, &blob[ENVELOPE_HEADER_SIZE..])
}
