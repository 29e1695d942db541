//! Physical stream transports
//!
//! Opens the ordered byte streams that chunk streams and stream packet
//! channels run over.

mod tcp;

pub use tcp::{TcpListenerTransport, TcpTransport};

use std::io;
use std::time::Duration;
use thiserror::Error;

/// Transport layer errors
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Chunk error: {0}")]
    Chunk(#[from] crate::chunk::ChunkError),

    #[error("Timeout")]
    Timeout,
}

/// Transport configuration
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Bound on establishing a connection
    pub connect_timeout: Duration,
    /// Disable Nagle's algorithm on new sockets
    pub nodelay: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            nodelay: true,
        }
    }
}
