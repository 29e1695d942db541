//! Session-multiplexed AEAD datagram transport
//!
//! One UDP socket carries many sessions. Every datagram is sealed under its
//! session's AES-256-GCM key:
//! ```text
//! +----------------+----------------+-----------+--------------+
//! | session id (8) |    seq (8)     |  tag (16) |  ciphertext  |
//! |     LE         |     LE         |           |              |
//! +----------------+----------------+-----------+--------------+
//! |<---------- AAD --------------->|
//! ```
//! The nonce is `seq (8, LE) || salt (4)` with
//! `salt = low32(session id) ^ high32(session id)`. `seq` comes from one
//! [`SequenceCounter`](crate::crypto::SequenceCounter) shared by every
//! session on every transmitter built from it, so a nonce never repeats.

mod channel;
mod transmitter;

pub use channel::{UdpChannel, UdpSessionMap};
pub use transmitter::{TransmitterStats, UdpChannelTransmitter, UdpSessionHandler};

use crate::crypto::{CryptoError, NONCE_LEN, TAG_LEN};
use std::io;
use thiserror::Error;

/// UDP transport errors
#[derive(Debug, Error)]
pub enum UdpError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("Datagram too large: {0} > {1}")]
    DatagramTooLarge(usize, usize),

    #[error("Datagram too short: {0} bytes")]
    DatagramTooShort(usize),

    #[error("Unknown session: {0:#018x}")]
    UnknownSession(u64),

    #[error("Transmitter disposed")]
    Disposed,
}

/// Session id field length
pub const SESSION_ID_LEN: usize = 8;

/// Sequence field length
pub const SEQ_LEN: usize = 8;

/// Associated data: session id and sequence
pub const AAD_LEN: usize = SESSION_ID_LEN + SEQ_LEN;

/// Fixed datagram header: session id, sequence and tag
pub const UDP_HEADER_LEN: usize = AAD_LEN + TAG_LEN;

/// Default datagram ceiling, an Ethernet MTU minus IPv4 and UDP headers
pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 1472;

/// Largest datagram the receive loop accepts
pub const MAX_RECV_DATAGRAM_SIZE: usize = 65535;

/// Limits of a transmitter
#[derive(Debug, Clone)]
pub struct TransmitterOptions {
    /// Ceiling for a whole datagram, header included
    pub max_datagram_size: usize,
}

impl Default for TransmitterOptions {
    fn default() -> Self {
        Self {
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
        }
    }
}

/// Per-datagram nonce
pub fn datagram_nonce(session_id: u64, seq: u64) -> [u8; NONCE_LEN] {
    let salt = (session_id as u32) ^ ((session_id >> 32) as u32);
    let mut nonce = [0u8; NONCE_LEN];
    nonce[..8].copy_from_slice(&seq.to_le_bytes());
    nonce[8..].copy_from_slice(&salt.to_le_bytes());
    nonce
}

/// Session id and sequence of a datagram
pub fn parse_header(datagram: &[u8]) -> Result<(u64, u64), UdpError> {
    if datagram.len() < UDP_HEADER_LEN {
        return Err(UdpError::DatagramTooShort(datagram.len()));
    }
    let mut session_id = [0u8; SESSION_ID_LEN];
    let mut seq = [0u8; SEQ_LEN];
    session_id.copy_from_slice(&datagram[..SESSION_ID_LEN]);
    seq.copy_from_slice(&datagram[SESSION_ID_LEN..AAD_LEN]);
    Ok((u64::from_le_bytes(session_id), u64::from_le_bytes(seq)))
}

/// Socket errors after which the socket is unusable
pub(crate) fn is_socket_fatal(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::InvalidInput | io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe
    )
}
