//! # VPN Channel
//!
//! Transport core of a VPN client/server: moves captured network packets
//! between peers over TCP or UDP, multiplexing many logical sessions onto
//! few physical sockets, optionally disguised as ordinary HTTP.
//!
//! ## Features
//!
//! - **Chunked framing** with a reusable socket across logical messages
//! - **HTTP/1.1 disguise**: chunked transfer coding in a literal request/response envelope
//! - **Sealed binary headers** (ChaCha20-Poly1305) with optional payload sealing
//! - **Packet channels** with traffic accounting, lifespan expiry and an in-band close handshake
//! - **Shared UDP socket** with per-session AES-256-GCM and process-wide nonce discipline
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │                  Packet Channels                    │
//! │   (lifecycle, traffic, close handshake, batching)   │
//! ├──────────────────────────┬──────────────────────────┤
//! │      Chunk Streams       │      UDP Transmitter     │
//! │ (binary, sealed, http)   │ (session demux, AEAD)    │
//! ├──────────────────────────┼──────────────────────────┤
//! │           TCP            │           UDP            │
//! └──────────────────────────┴──────────────────────────┘
//! ```

pub mod channel;
pub mod chunk;
pub mod config;
pub mod crypto;
pub mod packet;
pub mod transport;
pub mod udp;

pub use channel::{ChannelState, PacketChannel, StreamPacketChannel, Traffic};
pub use chunk::{ChunkFormat, ChunkStream};
pub use config::TunnelConfig;
pub use packet::{IpPacketCodec, PacketCodec};
pub use udp::{UdpChannel, UdpChannelTransmitter, UdpSessionMap};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Crypto error: {0}")]
    Crypto(#[from] crypto::CryptoError),

    #[error("Packet error: {0}")]
    Packet(#[from] packet::PacketError),

    #[error("Chunk error: {0}")]
    Chunk(#[from] chunk::ChunkError),

    #[error("Channel error: {0}")]
    Channel(#[from] channel::ChannelError),

    #[error("UDP error: {0}")]
    Udp(#[from] udp::UdpError),

    #[error("Transport error: {0}")]
    Transport(#[from] transport::TransportError),

    #[error("Configuration error: {0}")]
    Config(String),
}
