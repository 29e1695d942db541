//! Binary chunk framing
//!
//! Cleartext frame format:
//! ```text
//! +--------+--------+--------+--------+
//! |          Length (4B, LE)          |
//! +--------+--------+--------+--------+
//! |              Payload              |
//! +--------+--------+--------+--------+
//! ```
//!
//! Sealed frame format:
//! ```text
//! +--------+--------+--------+--------+--------+
//! |    seal(Length (4B, LE) | Flags (1B))      |
//! +--------+--------+--------+--------+--------+
//! |               Tag (16B)                    |
//! +--------+--------+--------+--------+--------+
//! |    Payload, or seal(Payload) | Tag         |
//! +--------+--------+--------+--------+--------+
//! ```
//! A zero length terminates the message in both forms.
//!
//! A sealed stream opens with the sender's 16-byte connection salt, once
//! per connection and not per message. The header key of that direction
//! is derived from the direction key and the salt, and its nonce counter
//! carries over when the socket is reused.

use super::{ChunkDecoder, ChunkEncoder, ChunkError, ChunkHeader, Preamble};
use crate::crypto::{
    derive_connection_key, random_bytes, HeaderCipher, CONNECTION_SALT_LEN, KEY_LEN, TAG_LEN,
};
use bytes::{Buf, BufMut, BytesMut};

/// Cleartext header size in bytes
pub const BINARY_HEADER_SIZE: usize = 4;

/// Sealed header size in bytes
pub const SEALED_HEADER_SIZE: usize = BINARY_HEADER_SIZE + 1 + TAG_LEN;

/// Flag bit: the payload is sealed as well
const FLAG_ENCRYPTED_PAYLOAD: u8 = 0x01;

/// Header protection of one direction
#[derive(Default)]
enum Sealing {
    #[default]
    Clear,
    /// Connection salt not exchanged yet
    AwaitingSalt { direction_key: [u8; KEY_LEN] },
    Keyed(HeaderCipher),
}

impl Sealing {
    fn awaiting(direction_key: &[u8; KEY_LEN]) -> Self {
        Sealing::AwaitingSalt {
            direction_key: *direction_key,
        }
    }

    /// Switch to the connection key derived from `salt`
    fn key_with(&mut self, salt: &[u8]) -> Result<(), ChunkError> {
        if let Sealing::AwaitingSalt { direction_key } = self {
            let key = derive_connection_key(direction_key, salt)?;
            *self = Sealing::Keyed(HeaderCipher::new(&key)?);
        }
        Ok(())
    }
}

impl std::fmt::Debug for Sealing {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sealing::Clear => f.write_str("Clear"),
            Sealing::AwaitingSalt { .. } => f.write_str("AwaitingSalt"),
            Sealing::Keyed(cipher) => f.debug_tuple("Keyed").field(cipher).finish(),
        }
    }
}

/// Binary chunk encoder
#[derive(Debug, Default)]
pub struct BinaryEncoder {
    sealing: Sealing,
    encrypt_payload: bool,
}

impl BinaryEncoder {
    /// Cleartext encoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Encoder that seals headers under a connection key derived from `key`
    pub fn encrypted(key: &[u8; KEY_LEN], encrypt_payload: bool) -> Result<Self, ChunkError> {
        Ok(Self {
            sealing: Sealing::awaiting(key),
            encrypt_payload,
        })
    }

    /// Emit a fresh connection salt if none went out yet
    ///
    /// Returns the header cipher, or `None` for cleartext framing.
    fn cipher(&mut self, out: &mut BytesMut) -> Result<Option<&mut HeaderCipher>, ChunkError> {
        if matches!(self.sealing, Sealing::AwaitingSalt { .. }) {
            let mut salt = [0u8; CONNECTION_SALT_LEN];
            random_bytes(&mut salt)?;
            self.sealing.key_with(&salt)?;
            out.put_slice(&salt);
        }

        Ok(match &mut self.sealing {
            Sealing::Keyed(cipher) => Some(cipher),
            _ => None,
        })
    }

    fn put_sealed_header(
        cipher: &mut HeaderCipher,
        len: usize,
        flags: u8,
        out: &mut BytesMut,
    ) -> Result<(), ChunkError> {
        let len = u32::try_from(len).map_err(|_| ChunkError::ChunkTooLarge(len, u32::MAX as usize))?;

        let mut header = [0u8; BINARY_HEADER_SIZE + 1];
        header[..BINARY_HEADER_SIZE].copy_from_slice(&len.to_le_bytes());
        header[BINARY_HEADER_SIZE] = flags;

        let tag = cipher.seal_in_place(&mut header)?;
        out.put_slice(&header);
        out.put_slice(&tag);
        Ok(())
    }
}

impl ChunkEncoder for BinaryEncoder {
    fn encode_preamble(&mut self, _keep_alive: bool, out: &mut BytesMut) -> Result<(), ChunkError> {
        self.cipher(out)?;
        Ok(())
    }

    fn encode_chunk(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<(), ChunkError> {
        let encrypt_payload = self.encrypt_payload;
        let Some(cipher) = self.cipher(out)? else {
            let len = u32::try_from(payload.len())
                .map_err(|_| ChunkError::ChunkTooLarge(payload.len(), u32::MAX as usize))?;
            out.reserve(BINARY_HEADER_SIZE + payload.len());
            out.put_u32_le(len);
            out.put_slice(payload);
            return Ok(());
        };

        if !encrypt_payload {
            Self::put_sealed_header(cipher, payload.len(), 0, out)?;
            out.put_slice(payload);
            return Ok(());
        }

        Self::put_sealed_header(
            cipher,
            payload.len() + TAG_LEN,
            FLAG_ENCRYPTED_PAYLOAD,
            out,
        )?;
        let start = out.len();
        out.put_slice(payload);
        let tag = cipher.seal_in_place(&mut out[start..])?;
        out.put_slice(&tag);
        Ok(())
    }

    fn encode_terminal(&mut self, out: &mut BytesMut) -> Result<(), ChunkError> {
        match self.cipher(out)? {
            Some(cipher) => Self::put_sealed_header(cipher, 0, 0, out),
            None => {
                out.put_u32_le(0);
                Ok(())
            }
        }
    }
}

/// Binary chunk decoder
#[derive(Debug, Default)]
pub struct BinaryDecoder {
    sealing: Sealing,
}

impl BinaryDecoder {
    /// Cleartext decoder
    pub fn new() -> Self {
        Self::default()
    }

    /// Decoder for headers sealed under a connection key derived from `key`
    pub fn encrypted(key: &[u8; KEY_LEN]) -> Result<Self, ChunkError> {
        Ok(Self {
            sealing: Sealing::awaiting(key),
        })
    }
}

impl ChunkDecoder for BinaryDecoder {
    fn decode_preamble(&mut self, buf: &mut BytesMut) -> Result<Option<Preamble>, ChunkError> {
        if matches!(self.sealing, Sealing::AwaitingSalt { .. }) {
            if buf.len() < CONNECTION_SALT_LEN {
                return Ok(None);
            }
            let salt = buf.split_to(CONNECTION_SALT_LEN);
            self.sealing.key_with(&salt)?;
        }
        Ok(Some(Preamble { keep_alive: true }))
    }

    fn decode_header(&mut self, buf: &mut BytesMut) -> Result<Option<ChunkHeader>, ChunkError> {
        let cipher = match &mut self.sealing {
            Sealing::Keyed(cipher) => cipher,
            Sealing::AwaitingSalt { .. } => {
                return Err(ChunkError::InvalidHeader(
                    "sealed chunk before the connection salt".to_string(),
                ))
            }
            Sealing::Clear => {
                if buf.len() < BINARY_HEADER_SIZE {
                    return Ok(None);
                }
                let len = buf.get_u32_le() as usize;
                return Ok(Some(if len == 0 {
                    ChunkHeader::Terminal
                } else {
                    ChunkHeader::Data {
                        len,
                        encrypted: false,
                    }
                }));
            }
        };

        if buf.len() < SEALED_HEADER_SIZE {
            return Ok(None);
        }

        let mut sealed = buf.split_to(SEALED_HEADER_SIZE);
        let header = cipher.open_in_place(&mut sealed)?;
        let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
        let flags = header[BINARY_HEADER_SIZE];

        if flags & !FLAG_ENCRYPTED_PAYLOAD != 0 {
            return Err(ChunkError::InvalidHeader(format!("unknown flags {:#04x}", flags)));
        }

        if len == 0 {
            if flags != 0 {
                return Err(ChunkError::InvalidHeader(
                    "flags on terminal chunk".to_string(),
                ));
            }
            return Ok(Some(ChunkHeader::Terminal));
        }

        let encrypted = flags & FLAG_ENCRYPTED_PAYLOAD != 0;
        if encrypted && len <= TAG_LEN {
            return Err(ChunkError::InvalidHeader(format!(
                "sealed chunk of {} bytes",
                len
            )));
        }

        Ok(Some(ChunkHeader::Data { len, encrypted }))
    }

    fn open_payload(&mut self, body: &mut [u8]) -> Result<usize, ChunkError> {
        let Sealing::Keyed(cipher) = &mut self.sealing else {
            return Err(ChunkError::InvalidHeader(
                "encrypted chunk on a cleartext stream".to_string(),
            ));
        };
        Ok(cipher.open_in_place(body)?.len())
    }
}
