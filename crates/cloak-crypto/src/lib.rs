//! cloak-crypto: the chunk cipher behind cloak's at-rest encryption
//!
//! Architecture: independent XChaCha20-Poly1305 frames, one per plaintext chunk
//!
//! Frame format (binary, repeated until EOF):
//! ```text
//! [24 bytes: random nonce][4 bytes: payload length, u32 BE][payload: ciphertext + 16-byte tag]
//! ```
//!
//! Key hierarchy:
//! ```text
//! SecretKey (256-bit, Argon2id from passphrase + salt)
//!   ├── File contents: chunk frames keyed directly by the SecretKey
//!   ├── Store Key (HKDF, domain="cloak-store"): seals the metadata document
//!   └── Name Key  (HKDF, domain="cloak-names"): seals original file/folder names
//! ```

pub mod chunk;
pub mod envelope;
pub mod kdf;
pub mod keys;
pub mod names;

pub use chunk::{decrypt_chunk, encrypt_chunk, open, seal, FrameDecoder};
pub use envelope::{open_document, read_salt, seal_document};
pub use kdf::{derive_secret_key, generate_salt, KdfParams, SecretKey};
pub use keys::{derive_name_key, derive_store_key};
pub use names::{decrypt_name, encrypt_name};

/// Size of a secret key in bytes (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an XChaCha20-Poly1305 nonce (192-bit)
pub const NONCE_SIZE: usize = 24;

/// Size of a Poly1305 authentication tag
pub const TAG_SIZE: usize = 16;

/// Size of the big-endian payload length field
pub const LENGTH_SIZE: usize = 4;

/// Size of the KDF salt stored in the store envelope
pub const SALT_SIZE: usize = 16;
