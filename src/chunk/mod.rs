//! Chunked message framing over ordered byte streams
//!
//! A [`ChunkStream`] turns a socket (or any duplex byte stream) into a
//! sequence of logical messages. Each message is a run of length-delimited
//! chunks closed by a zero-length terminal chunk; once both directions have
//! seen their terminal chunk the socket can carry a new message via
//! [`ChunkStream::create_reuse`].
//!
//! Wire variants:
//! ```text
//! binary          {len:u32 LE}{payload} ... {0:u32}
//! binary (sealed) seal({len:u32 LE, flags:u8}){payload | seal(payload)} ...
//! http            <request/status line + headers>\r\n
//!                 <hex len>\r\n<payload>\r\n ... 0\r\n\r\n
//! ```

mod binary;
mod http;
mod stream;

pub use binary::{BinaryDecoder, BinaryEncoder, SEALED_HEADER_SIZE};
pub use http::{HttpDecoder, HttpEncoder};
pub use stream::{ChunkStream, ReuseState};

use crate::crypto::{ChunkKeys, CryptoError};
use bytes::BytesMut;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Chunk framing errors
#[derive(Debug, Error)]
pub enum ChunkError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Invalid chunk header: {0}")]
    InvalidHeader(String),

    #[error("Header exceeds {0} bytes")]
    HeaderTooLarge(usize),

    #[error("Chunk too large: {0} > {1}")]
    ChunkTooLarge(usize, usize),

    #[error("Stream ended in the middle of a message")]
    UnexpectedEof,

    #[error("Message already finished")]
    WriteFinished,

    #[error("Stream can not be reused")]
    NotReusable,

    #[error("Stream is in error state")]
    Errored,

    #[error("Stream disposed")]
    Disposed,

    #[error("Timeout")]
    Timeout,
}

/// Maximum size of an HTTP envelope (request/status line and headers)
pub const MAX_HTTP_HEADER_SIZE: usize = 8192;

/// Maximum length of an HTTP chunk-size line
pub const MAX_CHUNK_LINE_LEN: usize = 64;

/// Default ceiling for a single chunk's payload
pub const DEFAULT_MAX_CHUNK_SIZE: usize = 0x10000;

/// Which end of the connection this stream is
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamRole {
    /// Opened the connection; sends HTTP requests
    Client,
    /// Accepted the connection; sends HTTP responses
    Server,
}

/// Decoded chunk header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkHeader {
    /// A payload chunk of `len` bytes on the wire
    Data { len: usize, encrypted: bool },
    /// End of the logical message
    Terminal,
}

/// Message-level metadata read ahead of the first chunk
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    /// False if the peer announced `Connection: close`
    pub keep_alive: bool,
}

/// Write half of a wire variant
pub trait ChunkEncoder: Send {
    /// Append whatever precedes the first chunk of a message
    fn encode_preamble(&mut self, keep_alive: bool, out: &mut BytesMut) -> Result<(), ChunkError>;

    /// Append one chunk carrying `payload`
    fn encode_chunk(&mut self, payload: &[u8], out: &mut BytesMut) -> Result<(), ChunkError>;

    /// Append the terminal chunk
    fn encode_terminal(&mut self, out: &mut BytesMut) -> Result<(), ChunkError>;

    /// Prepare for the next message on the same socket
    fn reset(&mut self) {}
}

/// Read half of a wire variant
///
/// Every `decode_*` method returns `Ok(None)` when `buf` does not yet hold
/// enough bytes, and consumes nothing in that case.
pub trait ChunkDecoder: Send {
    /// Consume the message preamble
    fn decode_preamble(&mut self, buf: &mut BytesMut) -> Result<Option<Preamble>, ChunkError>;

    /// Consume the next chunk header
    fn decode_header(&mut self, buf: &mut BytesMut) -> Result<Option<ChunkHeader>, ChunkError>;

    /// Consume the bytes that follow a chunk's payload
    fn decode_trailer(&mut self, _buf: &mut BytesMut) -> Result<Option<()>, ChunkError> {
        Ok(Some(()))
    }

    /// Decrypt an encrypted chunk body in place and return the plaintext length
    fn open_payload(&mut self, _body: &mut [u8]) -> Result<usize, ChunkError> {
        Err(ChunkError::InvalidHeader(
            "encrypted chunk on a cleartext stream".to_string(),
        ))
    }

    /// Prepare for the next message on the same socket
    fn reset(&mut self) {}
}

/// Wire variant selection
#[derive(Clone)]
pub enum ChunkFormat {
    /// Plain `{len:u32}` framing
    Binary,
    /// Binary framing with sealed headers and optionally sealed payloads
    EncryptedBinary {
        keys: ChunkKeys,
        encrypt_payload: bool,
    },
    /// Binary-equivalent chunking inside an HTTP/1.1 envelope
    Http { host: String },
}

impl ChunkFormat {
    /// Build the encoder/decoder pair for one side of a stream
    pub fn codecs(
        &self,
        role: StreamRole,
    ) -> Result<(Box<dyn ChunkEncoder>, Box<dyn ChunkDecoder>), ChunkError> {
        Ok(match self {
            ChunkFormat::Binary => (
                Box::new(BinaryEncoder::new()),
                Box::new(BinaryDecoder::new()),
            ),
            ChunkFormat::EncryptedBinary {
                keys,
                encrypt_payload,
            } => {
                let (send, recv) = keys.for_side(role == StreamRole::Client);
                (
                    Box::new(BinaryEncoder::encrypted(&send, *encrypt_payload)?),
                    Box::new(BinaryDecoder::encrypted(&recv)?),
                )
            }
            ChunkFormat::Http { host } => (
                Box::new(HttpEncoder::new(role, host.clone())),
                Box::new(HttpDecoder::new(role)),
            ),
        })
    }

    /// Name used in logs
    pub fn name(&self) -> &'static str {
        match self {
            ChunkFormat::Binary => "binary",
            ChunkFormat::EncryptedBinary { .. } => "encrypted-binary",
            ChunkFormat::Http { .. } => "http",
        }
    }
}

impl std::fmt::Debug for ChunkFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Timeouts and limits of a chunk stream
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    /// Bound on draining the peer's terminal chunk during close
    pub graceful_timeout: Duration,
    /// Bound on finalizing a message during reuse
    pub reuse_timeout: Duration,
    /// Largest payload accepted in one chunk
    pub max_chunk_size: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            graceful_timeout: Duration::from_secs(5),
            reuse_timeout: Duration::from_secs(5),
            max_chunk_size: DEFAULT_MAX_CHUNK_SIZE,
        }
    }
}

/// Position of the first `\r\n` in `buf`
pub(crate) fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}
