//! Packet channel over a chunk-framed byte stream

use super::{
    ChannelError, ChannelLifecycle, ChannelOptions, PacketChannel, PACKET_QUEUE_SIZE,
};
use crate::chunk::{ChunkError, ChunkStream, ReuseState};
use crate::packet::{split_packets, PacketCodec};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, info, trace, warn};

const READ_SIZE: usize = 16 * 1024;

/// Moves whole packets over a [`ChunkStream`]
///
/// Small packets sent together are batched into one chunk up to the
/// configured buffer size. The read side rebuilds packets from the codec's
/// length field alone, so packets may straddle chunk boundaries.
pub struct StreamPacketChannel<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for StreamPacketChannel<S> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

struct Inner<S> {
    lifecycle: ChannelLifecycle,
    stream: ChunkStream<S>,
    codec: Arc<dyn PacketCodec>,
    options: ChannelOptions,
    /// Send buffer; the lock also serializes writers
    send_buf: Mutex<BytesMut>,
    packet_tx: mpsc::Sender<Bytes>,
}

impl<S> StreamPacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Build a channel over `stream`
    ///
    /// Returns the channel and the queue its received packets arrive on.
    pub fn new(
        id: impl Into<String>,
        stream: ChunkStream<S>,
        codec: Arc<dyn PacketCodec>,
        options: ChannelOptions,
    ) -> (Self, mpsc::Receiver<Bytes>) {
        let (packet_tx, packet_rx) = mpsc::channel(PACKET_QUEUE_SIZE);
        let inner = Inner {
            lifecycle: ChannelLifecycle::new(id, options.lifespan),
            send_buf: Mutex::new(BytesMut::with_capacity(options.buffer_size)),
            stream,
            codec,
            options,
            packet_tx,
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            packet_rx,
        )
    }

    /// Reuse eligibility of the underlying chunk stream
    pub fn reuse_state(&self) -> ReuseState {
        self.inner.stream.reuse_state()
    }

    pub fn options(&self) -> &ChannelOptions {
        &self.inner.options
    }
}

#[async_trait]
impl<S> PacketChannel for StreamPacketChannel<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    fn lifecycle(&self) -> &ChannelLifecycle {
        &self.inner.lifecycle
    }

    fn start(&self) -> Result<(), ChannelError> {
        self.inner.lifecycle.start()?;
        info!(
            channel_id = %self.inner.lifecycle.id(),
            format = self.inner.stream.format(),
            "Stream channel started"
        );

        tokio::spawn(self.inner.clone().read_loop());
        if self.inner.lifecycle.lifespan().is_some() {
            tokio::spawn(self.inner.clone().expiry_loop());
        }
        Ok(())
    }

    async fn send_packets(&self, packets: &[Bytes]) -> Result<(), ChannelError> {
        self.inner.lifecycle.ensure_connected()?;
        if packets.is_empty() {
            return Ok(());
        }

        let result = {
            let mut buf = self.inner.send_buf.lock().await;
            self.inner.write_batched(&mut buf, packets).await
        };

        if let Err(e) = &result {
            if !matches!(e, ChannelError::Chunk(ChunkError::ChunkTooLarge(..))) {
                warn!(channel_id = %self.inner.lifecycle.id(), error = %e, "Send failed");
                self.inner.dispose().await;
            }
        }
        result
    }

    async fn close(&self) {
        self.inner.clone().send_close().await;
    }

    async fn dispose(&self) {
        self.inner.dispose().await;
    }
}

impl<S> Inner<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn write_batched(
        &self,
        buf: &mut BytesMut,
        packets: &[Bytes],
    ) -> Result<(), ChannelError> {
        if let [packet] = packets {
            return self.write_direct(packet).await;
        }

        let limit = self.options.buffer_size;
        buf.clear();
        for packet in packets {
            if packet.len() > limit {
                self.flush(buf).await?;
                self.write_direct(packet).await?;
                continue;
            }
            if buf.len() + packet.len() > limit {
                self.flush(buf).await?;
            }
            buf.extend_from_slice(packet);
        }
        self.flush(buf).await
    }

    async fn flush(&self, buf: &mut BytesMut) -> Result<(), ChannelError> {
        if buf.is_empty() {
            return Ok(());
        }
        self.stream.write(buf).await?;
        self.lifecycle.record_sent(buf.len());
        buf.clear();
        Ok(())
    }

    async fn write_direct(&self, packet: &[u8]) -> Result<(), ChannelError> {
        // An empty chunk would end the message
        if packet.is_empty() {
            return Ok(());
        }
        self.stream.write(packet).await?;
        self.lifecycle.record_sent(packet.len());
        Ok(())
    }

    /// Send our close-control packet once and arm the graceful timeout
    async fn send_close(self: Arc<Self>) {
        if !self.lifecycle.mark_close_sent() {
            return;
        }
        debug!(channel_id = %self.lifecycle.id(), "Sending close-control packet");

        // Armed before the write so a stalled socket cannot hold the channel
        // in Disconnecting.
        let inner = self.clone();
        tokio::spawn(async move {
            let cancel = inner.lifecycle.cancel_token().clone();
            tokio::select! {
                _ = tokio::time::sleep(inner.options.graceful_timeout) => {
                    debug!(
                        channel_id = %inner.lifecycle.id(),
                        "Peer did not answer the close-control packet in time"
                    );
                    inner.dispose().await;
                }
                _ = cancel.cancelled() => {}
            }
        });

        let packet = self.codec.close_control_packet();
        let cancel = self.lifecycle.cancel_token().clone();
        let result = tokio::select! {
            res = async {
                let _guard = self.send_buf.lock().await;
                self.stream.write(&packet).await
            } => res,
            _ = cancel.cancelled() => return,
        };
        if let Err(e) = result {
            warn!(
                channel_id = %self.lifecycle.id(),
                error = %e,
                "Failed to send close-control packet"
            );
            self.dispose().await;
            return;
        }

        if self.lifecycle.handshake_complete() {
            self.dispose().await;
        }
    }

    async fn on_close_received(self: &Arc<Self>) {
        if !self.lifecycle.mark_close_received() {
            trace!(channel_id = %self.lifecycle.id(), "Duplicate close-control packet");
            return;
        }
        debug!(channel_id = %self.lifecycle.id(), "Close-control packet received");

        if self.lifecycle.close_sent() {
            self.dispose().await;
        } else {
            self.clone().send_close().await;
        }
    }

    async fn read_loop(self: Arc<Self>) {
        let cancel = self.lifecycle.cancel_token().clone();
        let mut pending = BytesMut::with_capacity(READ_SIZE);
        let mut scratch = vec![0u8; READ_SIZE];

        loop {
            let result = tokio::select! {
                res = self.stream.read(&mut scratch) => res,
                _ = cancel.cancelled() => break,
            };

            match result {
                Ok(0) => {
                    debug!(channel_id = %self.lifecycle.id(), "Peer ended the stream");
                    break;
                }
                Ok(n) => {
                    pending.extend_from_slice(&scratch[..n]);
                    match self.deliver(&mut pending).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => {
                            warn!(channel_id = %self.lifecycle.id(), error = %e, "Malformed packet stream");
                            break;
                        }
                    }
                }
                Err(e) => {
                    if !self.lifecycle.is_disposed() {
                        warn!(channel_id = %self.lifecycle.id(), error = %e, "Read failed");
                    }
                    break;
                }
            }
        }

        if !pending.is_empty() {
            debug!(
                channel_id = %self.lifecycle.id(),
                bytes = pending.len(),
                "Discarding partial packet"
            );
        }
        self.dispose().await;
    }

    /// Hand every whole packet in `pending` to the consumer
    ///
    /// Returns false once the channel should stop reading.
    async fn deliver(self: &Arc<Self>, pending: &mut BytesMut) -> Result<bool, ChannelError> {
        for packet in split_packets(self.codec.as_ref(), pending)? {
            if self.codec.is_close_control(&packet) {
                self.on_close_received().await;
                if self.lifecycle.is_disposed() {
                    return Ok(false);
                }
                continue;
            }

            self.lifecycle.record_received(packet.len());
            let cancel = self.lifecycle.cancel_token();
            tokio::select! {
                res = self.packet_tx.send(packet) => {
                    if res.is_err() {
                        trace!(channel_id = %self.lifecycle.id(), "Packet consumer is gone");
                    }
                }
                _ = cancel.cancelled() => return Ok(false),
            }
        }
        Ok(true)
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
                info!(
                    channel_id = %self.lifecycle.id(),
                    lifespan_secs = self.lifecycle.lifespan().map(|l| l.as_secs()).unwrap_or_default(),
                    "Channel lifespan expired"
                );
                self.send_close().await;
                return;
            }
        }
    }

    async fn dispose(&self) {
        if !self.lifecycle.begin_dispose() {
            return;
        }

        if let Err(e) = self.stream.close(true).await {
            debug!(channel_id = %self.lifecycle.id(), error = %e, "Chunk stream close failed");
        }
        info!(
            channel_id = %self.lifecycle.id(),
            traffic = %self.lifecycle.traffic(),
            close_sent = self.lifecycle.close_sent(),
            close_received = self.lifecycle.close_received(),
            "Stream channel disposed"
        );
    }
}
