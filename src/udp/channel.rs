//! Per-session datagram channel and the session registry

use super::{UdpChannelTransmitter, UdpError, UdpSessionHandler};
use crate::channel::{
    ChannelError, ChannelLifecycle, ChannelOptions, PacketChannel, PACKET_QUEUE_SIZE,
};
use crate::crypto::SessionKey;
use crate::packet::{split_packets, PacketCodec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::{debug, info, trace, warn};

/// One session on a shared [`UdpChannelTransmitter`]
///
/// `Connected` only gates sending; datagrams for the session are accepted
/// until the channel is disposed. There is no close handshake: a received
/// close-control packet disposes the channel at once.
#[derive(Clone)]
pub struct UdpChannel {
    inner: Arc<Inner>,
}

struct Inner {
    lifecycle: ChannelLifecycle,
    session_id: u64,
    key: Arc<SessionKey>,
    transmitter: Arc<UdpChannelTransmitter>,
    remote: RwLock<SocketAddr>,
    codec: Arc<dyn PacketCodec>,
    options: ChannelOptions,
    packet_tx: mpsc::Sender<Bytes>,
    registry: Mutex<Option<Weak<UdpSessionMap>>>,
}

impl UdpChannel {
    /// Build the channel of `session_id`
    ///
    /// Returns the channel and the queue its received packets arrive on.
    pub fn new(
        session_id: u64,
        key: SessionKey,
        remote: SocketAddr,
        transmitter: Arc<UdpChannelTransmitter>,
        codec: Arc<dyn PacketCodec>,
        options: ChannelOptions,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_SIZE);
        let inner = Inner {
            lifecycle: ChannelLifecycle::new(format!("udp-{:016x}", session_id), options.lifespan),
            session_id,
            key: Arc::new(key),
            transmitter,
            remote: RwLock::new(remote),
            codec,
            options,
            packet_tx,
            registry: Mutex::new(None),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            packet_rx,
        )
    }

    pub fn session_id(&self) -> u64 {
        self.inner.session_id
    }

    pub fn key(&self) -> Arc<SessionKey> {
        self.inner.key.clone()
    }

    /// Endpoint of the most recent authenticated datagram
    pub fn remote(&self) -> SocketAddr {
        *self.inner.remote.read()
    }

    /// Consume the plaintext of one authenticated datagram of this session
    pub fn handle_datagram(&self, plaintext: &[u8], remote: SocketAddr) {
        self.inner.handle_datagram(plaintext, remote);
    }

    fn same_channel(&self, other: &UdpChannel) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

#[async_trait]
impl PacketChannel for UdpChannel {
    fn lifecycle(&self) -> &ChannelLifecycle {
        &self.inner.lifecycle
    }

    fn start(&self) -> Result<(), ChannelError> {
        self.inner.lifecycle.start()?;
        info!(
            channel_id = %self.inner.lifecycle.id(),
            remote = %self.remote(),
            "UDP channel started"
        );

        if self.inner.lifecycle.lifespan().is_some() {
            tokio::spawn(self.inner.clone().expiry_loop());
        }
        Ok(())
    }

    async fn send_packets(&self, packets: &[Bytes]) -> Result<(), ChannelError> {
        self.inner.lifecycle.ensure_connected()?;

        if let [packet] = packets {
            return self.inner.send_datagram(packet, packet.len()).await;
        }

        let limit = self.inner.transmitter.max_payload();
        let mut batch = BytesMut::with_capacity(limit);
        for packet in packets {
            if !batch.is_empty() && batch.len() + packet.len() > limit {
                self.inner.send_datagram(&batch, batch.len()).await?;
                batch.clear();
            }
            if packet.len() > limit {
                // Rejected by the transmitter with the exact sizes
                self.inner.send_datagram(packet, packet.len()).await?;
                continue;
            }
            batch.extend_from_slice(packet);
        }

        if !batch.is_empty() {
            self.inner.send_datagram(&batch, batch.len()).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        self.inner.close().await;
    }

    async fn dispose(&self) {
        self.inner.dispose();
    }
}

impl Inner {
    async fn send_datagram(&self, payload: &[u8], packet_bytes: usize) -> Result<(), ChannelError> {
        if payload.is_empty() {
            return Ok(());
        }

        let remote = *self.remote.read();
        match self
            .transmitter
            .send(self.session_id, remote, payload, &self.key)
            .await
        {
            Ok(_) => {
                self.lifecycle.record_sent(packet_bytes);
                Ok(())
            }
            Err(UdpError::Disposed) => {
                self.dispose();
                Err(ChannelError::Disposed)
            }
            Err(e) => {
                if self.transmitter.is_disposed() {
                    self.dispose();
                }
                Err(e.into())
            }
        }
    }

    fn handle_datagram(&self, plaintext: &[u8], remote: SocketAddr) {
        if self.lifecycle.is_disposed() {
            return;
        }

        if *self.remote.read() != remote {
            let mut current = self.remote.write();
            if *current != remote {
                debug!(
                    channel_id = %self.lifecycle.id(),
                    from = %*current,
                    to = %remote,
                    "Session endpoint moved"
                );
                *current = remote;
            }
        }

        let mut buf = BytesMut::from(plaintext);
        let packets = match split_packets(self.codec.as_ref(), &mut buf) {
            Ok(packets) => packets,
            Err(e) => {
                debug!(channel_id = %self.lifecycle.id(), error = %e, "Dropping malformed datagram");
                return;
            }
        };
        if !buf.is_empty() {
            debug!(
                channel_id = %self.lifecycle.id(),
                bytes = buf.len(),
                "Dropping partial packet at the end of a datagram"
            );
        }

        for packet in packets {
            if self.codec.is_close_control(&packet) {
                if self.lifecycle.mark_close_received() {
                    debug!(channel_id = %self.lifecycle.id(), "Close-control packet received");
                    self.dispose();
                }
                return;
            }

            self.lifecycle.record_received(packet.len());
            if self.packet_tx.try_send(packet).is_err() {
                trace!(channel_id = %self.lifecycle.id(), "Packet queue full or closed, dropping packet");
            }
        }
    }

    /// Send the close-control packet once, best effort, then dispose
    async fn close(&self) {
        if self.lifecycle.mark_close_sent() && !self.lifecycle.is_disposed() {
            let packet = self.codec.close_control_packet();
            let remote = *self.remote.read();
            if let Err(e) = self
                .transmitter
                .send(self.session_id, remote, &packet, &self.key)
                .await
            {
                warn!(
                    channel_id = %self.lifecycle.id(),
                    error = %e,
                    "Failed to send close-control packet"
                );
            }
        }
        self.dispose();
    }

    async fn expiry_loop(self: Arc<Self>) {
        let cancel = self.lifecycle.cancel_token().clone();
        let mut ticker = tokio::time::interval(self.options.expiry_check_interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = cancel.cancelled() => return,
            }

            if self.lifecycle.is_expired() {
                info!(channel_id = %self.lifecycle.id(), "Channel lifespan expired");
                self.close().await;
                return;
            }
        }
    }

    fn dispose(&self) {
        if !self.lifecycle.begin_dispose() {
            return;
        }

        if let Some(map) = self.registry.lock().take().and_then(|weak| weak.upgrade()) {
            map.remove_if(self.session_id, |channel| std::ptr::eq(Arc::as_ptr(&channel.inner), self));
        }
        info!(
            channel_id = %self.lifecycle.id(),
            traffic = %self.lifecycle.traffic(),
            "UDP channel disposed"
        );
    }
}

/// Registry of the sessions served by one transmitter
///
/// Serves as the transmitter's [`UdpSessionHandler`]: keys are looked up
/// and datagrams dispatched by session id. Channels leave the map when
/// they are disposed.
#[derive(Default)]
pub struct UdpSessionMap {
    sessions: RwLock<HashMap<u64, UdpChannel>>,
}

impl UdpSessionMap {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add `channel`, replacing and disposing any channel with the same id
    pub fn register(self: &Arc<Self>, channel: &UdpChannel) {
        *channel.inner.registry.lock() = Some(Arc::downgrade(self));
        let previous = self
            .sessions
            .write()
            .insert(channel.session_id(), channel.clone());

        if let Some(previous) = previous {
            if !previous.same_channel(channel) {
                warn!(session_id = channel.session_id(), "Replacing registered session");
                previous.inner.registry.lock().take();
                previous.inner.dispose();
            }
        }
    }

    pub fn get(&self, session_id: u64) -> Option<UdpChannel> {
        self.sessions.read().get(&session_id).cloned()
    }

    pub fn remove(&self, session_id: u64) -> Option<UdpChannel> {
        self.sessions.write().remove(&session_id)
    }

    fn remove_if(&self, session_id: u64, predicate: impl FnOnce(&UdpChannel) -> bool) {
        let mut sessions = self.sessions.write();
        if sessions.get(&session_id).is_some_and(predicate) {
            sessions.remove(&session_id);
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.read().is_empty()
    }
}

impl UdpSessionHandler for UdpSessionMap {
    fn session_key(&self, session_id: u64) -> Option<Arc<SessionKey>> {
        self.sessions.read().get(&session_id).map(|c| c.key())
    }

    fn on_packet_decrypted(&self, session_id: u64, plaintext: &[u8], remote: SocketAddr) {
        // Dispatch outside the lock; disposing removes from the map
        let channel = self.get(session_id);
        if let Some(channel) = channel {
            channel.handle_datagram(plaintext, remote);
        }
    }
}
