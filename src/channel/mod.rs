//! Packet channels
//!
//! A packet channel moves whole network packets between two peers. Every
//! channel shares the same identity, traffic accounting, lifespan expiry
//! and close semantics through [`ChannelLifecycle`]; the concrete I/O lives
//! in the implementations of [`PacketChannel`]:
//! - [`StreamPacketChannel`] over a chunk-framed byte stream
//! - [`UdpChannel`](crate::udp::UdpChannel) over a shared UDP socket

mod lifecycle;
mod stream;

pub use lifecycle::ChannelLifecycle;
pub use stream::StreamPacketChannel;

use crate::chunk::ChunkError;
use crate::packet::PacketError;
use crate::udp::UdpError;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::ops::{Add, AddAssign};
use std::time::{Duration, Instant};
use thiserror::Error;

/// Channel layer errors
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("Channel already started")]
    AlreadyStarted,

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Channel disposed")]
    Disposed,

    #[error("Chunk error: {0}")]
    Chunk(#[from] ChunkError),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("UDP error: {0}")]
    Udp(#[from] UdpError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Capacity of the queue between a channel's read side and its consumer
pub const PACKET_QUEUE_SIZE: usize = 256;

/// Default stream send buffer, one Ethernet MTU
pub const DEFAULT_BUFFER_SIZE: usize = 1500;

/// Channel lifecycle state
///
/// Transitions are monotonic; `Disposed` is terminal and reachable from any
/// other state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum ChannelState {
    NotStarted = 0,
    Connected = 1,
    Disconnecting = 2,
    Disposed = 3,
}

impl ChannelState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            0 => ChannelState::NotStarted,
            1 => ChannelState::Connected,
            2 => ChannelState::Disconnecting,
            _ => ChannelState::Disposed,
        }
    }
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::NotStarted => "not-started",
            ChannelState::Connected => "connected",
            ChannelState::Disconnecting => "disconnecting",
            ChannelState::Disposed => "disposed",
        };
        f.write_str(name)
    }
}

/// Byte counters of a channel
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Traffic {
    pub sent: u64,
    pub received: u64,
}

impl Traffic {
    pub fn new(sent: u64, received: u64) -> Self {
        Self { sent, received }
    }

    /// Bytes in both directions
    pub fn total(&self) -> u64 {
        self.sent.saturating_add(self.received)
    }
}

impl Add for Traffic {
    type Output = Traffic;

    fn add(self, rhs: Traffic) -> Traffic {
        Traffic {
            sent: self.sent.saturating_add(rhs.sent),
            received: self.received.saturating_add(rhs.received),
        }
    }
}

impl AddAssign for Traffic {
    fn add_assign(&mut self, rhs: Traffic) {
        *self = *self + rhs;
    }
}

impl fmt::Display for Traffic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sent={} received={}", self.sent, self.received)
    }
}

/// Timing and buffering of a packet channel
#[derive(Debug, Clone)]
pub struct ChannelOptions {
    /// Channel closes itself this long after creation
    pub lifespan: Option<Duration>,
    /// Bound on waiting for the peer's close-control packet
    pub graceful_timeout: Duration,
    /// Period of the lifespan check
    pub expiry_check_interval: Duration,
    /// Stream send buffer size, the ceiling for a batched write
    pub buffer_size: usize,
}

impl Default for ChannelOptions {
    fn default() -> Self {
        Self {
            lifespan: None,
            graceful_timeout: Duration::from_secs(5),
            expiry_check_interval: Duration::from_secs(1),
            buffer_size: DEFAULT_BUFFER_SIZE,
        }
    }
}

/// Packet-oriented channel
///
/// Received packets are handed to the consumer through the queue returned
/// when the channel is built; close-control packets never reach it.
#[async_trait]
pub trait PacketChannel: Send + Sync {
    /// Shared lifecycle state
    fn lifecycle(&self) -> &ChannelLifecycle;

    /// Opaque channel id
    fn id(&self) -> &str {
        self.lifecycle().id()
    }

    fn state(&self) -> ChannelState {
        self.lifecycle().state()
    }

    /// Byte counters, frozen once the channel is disposed
    fn traffic(&self) -> Traffic {
        self.lifecycle().traffic()
    }

    /// Time of the most recent send or receive
    fn last_activity(&self) -> Instant {
        self.lifecycle().last_activity()
    }

    /// Move to `Connected` and start the background tasks
    fn start(&self) -> Result<(), ChannelError>;

    /// Send whole packets, in order
    async fn send_packets(&self, packets: &[Bytes]) -> Result<(), ChannelError>;

    /// Announce shutdown to the peer and dispose once it answers or the
    /// graceful timeout elapses
    async fn close(&self);

    /// Tear down immediately; repeated or concurrent calls are no-ops
    async fn dispose(&self);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_traffic_arithmetic() {
        let mut total = Traffic::new(10, 20);
        total += Traffic::new(1, 2);
        assert_eq!(total, Traffic::new(11, 22));
        assert_eq!(total.total(), 33);
        assert_eq!((total + Traffic::default()).sent, 11);
        assert_eq!(Traffic::new(u64::MAX, 0).total(), u64::MAX);
    }

    #[test]
    fn test_state_order() {
        assert!(ChannelState::NotStarted < ChannelState::Connected);
        assert!(ChannelState::Disconnecting < ChannelState::Disposed);
        assert_eq!(ChannelState::from_u8(2), ChannelState::Disconnecting);
        assert_eq!(ChannelState::Disposed.to_string(), "disposed");
    }
}
