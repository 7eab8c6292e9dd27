//! Sealed original names
//!
//! A name is sealed as a single chunk frame under the name key and rendered as
//! text (base64 or hex, per config) so it can live in the JSON metadata
//! document. Sealing is randomized: the same name yields different blobs.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;

use cloak_core::config::NameEncoding;
use cloak_core::{CloakError, CloakResult};

use crate::chunk::{open, seal};
use crate::kdf::SecretKey;

/// Seal `plaintext_name` and encode the frame as text.
pub fn encrypt_name(
    name_key: &SecretKey,
    plaintext_name: &str,
    encoding: NameEncoding,
) -> CloakResult<String> {
    let frame = seal(name_key, plaintext_name.as_bytes())?;
    Ok(match encoding {
        NameEncoding::Base64 => STANDARD.encode(&frame),
        NameEncoding::Hex => hex::encode(&frame),
    })
}

/// Decode and open a name produced by [`encrypt_name`].
pub fn decrypt_name(
    name_key: &SecretKey,
    encrypted: &str,
    encoding: NameEncoding,
) -> CloakResult<String> {
    let frame = match encoding {
        NameEncoding::Base64 => STANDARD.decode(encrypted).map_err(|_| CloakError::Authentication)?,
        NameEncoding::Hex => hex::decode(encrypted).map_err(|_| CloakError::Authentication)?,
    };
    let plaintext = open(name_key, &frame)?;
    String::from_utf8(plaintext)
        .map_err(|e| CloakError::Crypto(format!("decrypted name is not UTF-8: {e}")))
}
