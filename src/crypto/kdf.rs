//! Chunk key derivation
//!
//! Both peers hold the same secret; HKDF-SHA256 turns it into one key per
//! direction so the two header ciphers never share a nonce space. Each
//! connection then mixes in a random salt chosen by the sending side, so
//! no two connections seal under the same key.

use super::{CryptoError, KEY_LEN};
use ring::hkdf::{KeyType, Prk, Salt, HKDF_SHA256};

const CHUNK_KEY_SALT: &[u8] = b"vpn_channel_chunk_salt";
const CLIENT_TO_SERVER_LABEL: &[u8] = b"vpn_channel_chunk_client_to_server";
const SERVER_TO_CLIENT_LABEL: &[u8] = b"vpn_channel_chunk_server_to_client";
const CONNECTION_LABEL: &[u8] = b"vpn_channel_chunk_connection";

/// Random salt a sender puts ahead of its first sealed chunk
pub const CONNECTION_SALT_LEN: usize = 16;

/// Extracted HKDF-SHA256 state
pub struct Hkdf {
    prk: Prk,
}

impl Hkdf {
    pub fn new(salt: &[u8], secret: &[u8]) -> Self {
        Self {
            prk: Salt::new(HKDF_SHA256, salt).extract(secret),
        }
    }

    /// Fill `out` with key material bound to `label`
    pub fn expand(&self, label: &[u8], out: &mut [u8]) -> Result<(), CryptoError> {
        let labels = [label];
        self.prk
            .expand(&labels, OutputLen(out.len()))
            .and_then(|okm| okm.fill(out))
            .map_err(|_| {
                CryptoError::KeyGeneration(format!("cannot derive {} bytes", out.len()))
            })
    }

    pub fn expand_key(&self, label: &[u8]) -> Result<[u8; KEY_LEN], CryptoError> {
        let mut key = [0u8; KEY_LEN];
        self.expand(label, &mut key)?;
        Ok(key)
    }
}

struct OutputLen(usize);

impl KeyType for OutputLen {
    fn len(&self) -> usize {
        self.0
    }
}

/// Per-direction chunk header keys
#[derive(Clone)]
pub struct ChunkKeys {
    pub client_to_server: [u8; KEY_LEN],
    pub server_to_client: [u8; KEY_LEN],
}

impl ChunkKeys {
    /// Keys as `(send, receive)` for the given side
    pub fn for_side(&self, is_client: bool) -> ([u8; KEY_LEN], [u8; KEY_LEN]) {
        if is_client {
            (self.client_to_server, self.server_to_client)
        } else {
            (self.server_to_client, self.client_to_server)
        }
    }
}

/// Derive chunk header keys from the secret shared by both peers
pub fn derive_chunk_keys(secret: &[u8]) -> Result<ChunkKeys, CryptoError> {
    let hkdf = Hkdf::new(CHUNK_KEY_SALT, secret);
    Ok(ChunkKeys {
        client_to_server: hkdf.expand_key(CLIENT_TO_SERVER_LABEL)?,
        server_to_client: hkdf.expand_key(SERVER_TO_CLIENT_LABEL)?,
    })
}

/// Key for one direction of one connection
pub fn derive_connection_key(
    direction_key: &[u8; KEY_LEN],
    salt: &[u8],
) -> Result<[u8; KEY_LEN], CryptoError> {
    Hkdf::new(salt, direction_key).expand_key(CONNECTION_LABEL)
}
