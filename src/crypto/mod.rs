//! Cryptographic primitives for the channel layer
//!
//! This module provides:
//! - ChaCha20-Poly1305 sealing of chunk headers (and optionally payloads)
//! - AES-256-GCM per-session keys for the shared UDP socket
//! - HKDF-SHA256 derivation of per-direction chunk keys
//! - The process-scoped UDP send sequence counter
//! - Secure random number generation

mod aead;
mod kdf;
mod sequence;

pub use aead::{HeaderCipher, SessionKey};
pub use kdf::{derive_chunk_keys, derive_connection_key, ChunkKeys, Hkdf, CONNECTION_SALT_LEN};
pub use sequence::SequenceCounter;

use thiserror::Error;

/// Length of symmetric key in bytes
pub const KEY_LEN: usize = 32;

/// Length of nonce in bytes
pub const NONCE_LEN: usize = 12;

/// Length of authentication tag in bytes
pub const TAG_LEN: usize = 16;

/// Cryptographic errors
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Key generation failed: {0}")]
    KeyGeneration(String),

    #[error("Encryption failed: {0}")]
    Encryption(String),

    #[error("Decryption failed: {0}")]
    Decryption(String),

    #[error("Invalid key length")]
    InvalidKeyLength,

    #[error("Nonce space exhausted")]
    NonceExhausted,

    #[error("Random generator failure")]
    Random,
}

/// Fill `buf` with cryptographically secure random bytes
pub fn random_bytes(buf: &mut [u8]) -> Result<(), CryptoError> {
    use ring::rand::{SecureRandom, SystemRandom};
    let rng = SystemRandom::new();
    rng.fill(buf).map_err(|_| CryptoError::Random)
}

/// Random 64-bit value
pub fn random_u64() -> Result<u64, CryptoError> {
    let mut buf = [0u8; 8];
    random_bytes(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

/// Generate a random version-4 GUID in its canonical hyphenated form
pub fn random_guid() -> Result<String, CryptoError> {
    let mut b = [0u8; 16];
    random_bytes(&mut b)?;
    b[6] = (b[6] & 0x0f) | 0x40;
    b[8] = (b[8] & 0x3f) | 0x80;

    let hex: String = b.iter().map(|byte| format!("{:02x}", byte)).collect();
    Ok(format!(
        "{}-{}-{}-{}-{}",
        &hex[0..8],
        &hex[8..12],
        &hex[12..16],
        &hex[16..20],
        &hex[20..32]
    ))
}
