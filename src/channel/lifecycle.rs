//! Shared channel state machine

use super::{ChannelError, ChannelState, Traffic};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Identity, accounting and close-handshake state of one channel
///
/// Every field is safe to read from any thread while traffic flows.
#[derive(Debug)]
pub struct ChannelLifecycle {
    id: String,
    state: AtomicU8,
    close_sent: AtomicBool,
    close_received: AtomicBool,
    disposed: AtomicBool,
    sent: AtomicU64,
    received: AtomicU64,
    created_at: Instant,
    last_activity: Mutex<Instant>,
    lifespan: Option<Duration>,
    cancel: CancellationToken,
}

impl ChannelLifecycle {
    pub fn new(id: impl Into<String>, lifespan: Option<Duration>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            state: AtomicU8::new(ChannelState::NotStarted as u8),
            close_sent: AtomicBool::new(false),
            close_received: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
            sent: AtomicU64::new(0),
            received: AtomicU64::new(0),
            created_at: now,
            last_activity: Mutex::new(now),
            lifespan,
            cancel: CancellationToken::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ChannelState {
        ChannelState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn lifespan(&self) -> Option<Duration> {
        self.lifespan
    }

    /// Token cancelled on dispose
    pub fn cancel_token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// `NotStarted -> Connected`
    pub fn start(&self) -> Result<(), ChannelError> {
        match self.state.compare_exchange(
            ChannelState::NotStarted as u8,
            ChannelState::Connected as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => {
                debug!(channel_id = %self.id, "Channel connected");
                Ok(())
            }
            Err(current) if current == ChannelState::Disposed as u8 => Err(ChannelError::Disposed),
            Err(_) => Err(ChannelError::AlreadyStarted),
        }
    }

    /// Move forward to `next`; never moves backwards
    ///
    /// Returns true if the state changed.
    pub fn advance(&self, next: ChannelState) -> bool {
        let next = next as u8;
        self.state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < next).then_some(next)
            })
            .is_ok()
    }

    /// Fail unless the channel is `Connected`
    pub fn ensure_connected(&self) -> Result<(), ChannelError> {
        match self.state() {
            ChannelState::Connected => Ok(()),
            ChannelState::Disposed => Err(ChannelError::Disposed),
            _ => Err(ChannelError::NotConnected),
        }
    }

    /// Whether the configured lifespan has elapsed
    pub fn is_expired(&self) -> bool {
        self.lifespan
            .is_some_and(|lifespan| self.created_at.elapsed() >= lifespan)
    }

    /// Record that our close-control packet went out
    ///
    /// Returns false if it had already been recorded.
    pub fn mark_close_sent(&self) -> bool {
        let first = !self.close_sent.swap(true, Ordering::AcqRel);
        if first {
            self.advance(ChannelState::Disconnecting);
        }
        first
    }

    /// Record the peer's close-control packet
    ///
    /// Returns false if one had already been received.
    pub fn mark_close_received(&self) -> bool {
        let first = !self.close_received.swap(true, Ordering::AcqRel);
        if first {
            self.advance(ChannelState::Disconnecting);
        }
        first
    }

    pub fn close_sent(&self) -> bool {
        self.close_sent.load(Ordering::Acquire)
    }

    pub fn close_received(&self) -> bool {
        self.close_received.load(Ordering::Acquire)
    }

    /// Both close-control packets have been exchanged
    pub fn handshake_complete(&self) -> bool {
        self.close_sent() && self.close_received()
    }

    /// Claim the teardown
    ///
    /// Only the first caller gets true; it moves the channel to `Disposed`
    /// and cancels the token. Traffic counters freeze from here on.
    pub fn begin_dispose(&self) -> bool {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.advance(ChannelState::Disposed);
        self.cancel.cancel();
        true
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    pub fn record_sent(&self, bytes: usize) {
        if self.is_disposed() {
            return;
        }
        self.sent.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn record_received(&self, bytes: usize) {
        if self.is_disposed() {
            return;
        }
        self.received.fetch_add(bytes as u64, Ordering::Relaxed);
        *self.last_activity.lock() = Instant::now();
    }

    pub fn traffic(&self) -> Traffic {
        Traffic {
            sent: self.sent.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
        }
    }

    pub fn last_activity(&self) -> Instant {
        *self.last_activity.lock()
    }
}
