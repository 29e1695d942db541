//! AEAD ciphers of the chunk framing and the UDP sessions
//!
//! Two ciphers live here:
//! - [`HeaderCipher`]: ChaCha20-Poly1305 with an implicit counter nonce, used
//!   by the binary chunk framing to hide chunk lengths (and optionally
//!   payloads) from length-based fingerprinting.
//! - [`SessionKey`]: AES-256-GCM with caller-supplied nonces, used per UDP
//!   session on the shared socket.

use super::{random_bytes, CryptoError, KEY_LEN, NONCE_LEN, TAG_LEN};
use ring::aead::{Aad, LessSafeKey, Nonce, UnboundKey, AES_256_GCM, CHACHA20_POLY1305};
use std::fmt;

/// One direction of chunk header encryption
///
/// Each direction of a stream owns its own key and counter, so the sealing
/// side and the opening side advance in lockstep.
pub struct HeaderCipher {
    key: LessSafeKey,
    nonce_counter: u64,
}

impl HeaderCipher {
    /// Cipher for one direction; the counter starts at zero
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        let key = UnboundKey::new(&CHACHA20_POLY1305, key)
            .map(LessSafeKey::new)
            .map_err(|_| CryptoError::InvalidKeyLength)?;
        Ok(Self {
            key,
            nonce_counter: 0,
        })
    }

    /// Encrypt `data` in place and return the detached tag
    pub fn seal_in_place(&mut self, data: &mut [u8]) -> Result<[u8; TAG_LEN], CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);

        let tag = self
            .key
            .seal_in_place_separate_tag(nonce, Aad::empty(), data)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Decrypt `data` (ciphertext followed by tag) in place
    ///
    /// Returns the plaintext prefix of `data`.
    pub fn open_in_place<'a>(&mut self, data: &'a mut [u8]) -> Result<&'a mut [u8], CryptoError> {
        let nonce = Nonce::assume_unique_for_key(self.next_nonce()?);

        self.key
            .open_in_place(nonce, Aad::empty(), data)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))
    }

    fn next_nonce(&mut self) -> Result<[u8; NONCE_LEN], CryptoError> {
        if self.nonce_counter == u64::MAX {
            return Err(CryptoError::NonceExhausted);
        }

        let mut nonce = [0u8; NONCE_LEN];
        // 4 zero bytes, then the LE counter
        nonce[4..12].copy_from_slice(&self.nonce_counter.to_le_bytes());
        self.nonce_counter += 1;
        Ok(nonce)
    }

    /// Chunks sealed or opened so far in this direction
    pub fn nonce_counter(&self) -> u64 {
        self.nonce_counter
    }
}

impl fmt::Debug for HeaderCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HeaderCipher")
            .field("nonce_counter", &self.nonce_counter)
            .finish_non_exhaustive()
    }
}

/// Symmetric AES-256-GCM key of one UDP session
///
/// Nonces are supplied by the caller; uniqueness is the transmitter's job.
pub struct SessionKey {
    key: LessSafeKey,
}

impl SessionKey {
    pub fn new(key: &[u8; KEY_LEN]) -> Result<Self, CryptoError> {
        UnboundKey::new(&AES_256_GCM, key)
            .map(|key| Self {
                key: LessSafeKey::new(key),
            })
            .map_err(|_| CryptoError::InvalidKeyLength)
    }

    /// Create a session key from a slice, checking its length
    pub fn from_slice(key: &[u8]) -> Result<Self, CryptoError> {
        let key: &[u8; KEY_LEN] = key.try_into().map_err(|_| CryptoError::InvalidKeyLength)?;
        Self::new(key)
    }

    /// Fresh random key
    pub fn generate() -> Result<Self, CryptoError> {
        let mut material = [0u8; KEY_LEN];
        random_bytes(&mut material)?;
        Self::new(&material)
    }

    /// Encrypt `data` in place under `nonce` and return the detached tag
    pub fn seal_in_place(
        &self,
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        data: &mut [u8],
    ) -> Result<[u8; TAG_LEN], CryptoError> {
        let tag = self
            .key
            .seal_in_place_separate_tag(Nonce::assume_unique_for_key(nonce), Aad::from(aad), data)
            .map_err(|_| CryptoError::Encryption("seal failed".to_string()))?;

        let mut out = [0u8; TAG_LEN];
        out.copy_from_slice(tag.as_ref());
        Ok(out)
    }

    /// Decrypt `data` (ciphertext followed by tag) in place
    pub fn open_in_place<'a>(
        &self,
        nonce: [u8; NONCE_LEN],
        aad: &[u8],
        data: &'a mut [u8],
    ) -> Result<&'a mut [u8], CryptoError> {
        self.key
            .open_in_place(Nonce::assume_unique_for_key(nonce), Aad::from(aad), data)
            .map_err(|_| CryptoError::Decryption("open failed".to_string()))
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(..)")
    }
}
