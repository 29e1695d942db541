//! Chunk stream over a split duplex socket
//!
//! The read and write halves sit behind separate locks, so one read and one
//! write may be in flight at the same time. Overlapping reads (or writes)
//! are serialized rather than interleaved.

use super::{
    ChunkDecoder, ChunkEncoder, ChunkError, ChunkFormat, ChunkHeader, ChunkOptions, StreamRole,
};
use crate::crypto::TAG_LEN;
use bytes::{Buf, BytesMut};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

const READ_BUFFER_SIZE: usize = 16 * 1024;
const DRAIN_BUFFER_SIZE: usize = 4 * 1024;

/// Reuse eligibility of a chunk stream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReuseState {
    /// No error occurred and neither side asked to close the connection
    pub can_reuse: bool,
    /// How many messages preceded this one on the same socket
    pub reused_count: u32,
}

#[derive(Debug, Default)]
struct StreamFlags {
    errored: AtomicBool,
    disposed: AtomicBool,
    /// Local side wants (or announced) `Connection: close`
    close_connection: AtomicBool,
    /// Peer announced `Connection: close`
    close_received: AtomicBool,
    read_finished: AtomicBool,
    write_finished: AtomicBool,
}

struct ReadSide<S> {
    io: ReadHalf<S>,
    decoder: Box<dyn ChunkDecoder>,
    buf: BytesMut,
    preamble_done: bool,
    /// Cleartext payload bytes left in the current chunk
    remaining: usize,
    /// Wire length of a sealed chunk whose body has not arrived yet
    sealed_len: usize,
    /// A chunk's payload was consumed and its trailer is pending
    trailer_pending: bool,
    /// Decrypted payload not yet handed out
    opened: BytesMut,
}

enum Outgoing<'a> {
    Chunk(&'a [u8]),
    Terminal,
}

struct WriteSide<S> {
    io: WriteHalf<S>,
    encoder: Box<dyn ChunkEncoder>,
    out: BytesMut,
    preamble_done: bool,
}

/// One logical message's worth of framing over a socket
pub struct ChunkStream<S> {
    reader: Mutex<Option<ReadSide<S>>>,
    writer: Mutex<Option<WriteSide<S>>>,
    flags: StreamFlags,
    cancel: CancellationToken,
    options: ChunkOptions,
    format: &'static str,
    reused_count: u32,
}

impl<S> ChunkStream<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    /// Wrap `stream` as the first message on a fresh socket
    pub fn new(
        stream: S,
        format: &ChunkFormat,
        role: StreamRole,
        options: ChunkOptions,
    ) -> Result<Self, ChunkError> {
        let (encoder, decoder) = format.codecs(role)?;
        let (read_io, write_io) = tokio::io::split(stream);

        let reader = ReadSide {
            io: read_io,
            decoder,
            buf: BytesMut::with_capacity(READ_BUFFER_SIZE),
            preamble_done: false,
            remaining: 0,
            sealed_len: 0,
            trailer_pending: false,
            opened: BytesMut::new(),
        };
        let writer = WriteSide {
            io: write_io,
            encoder,
            out: BytesMut::with_capacity(READ_BUFFER_SIZE),
            preamble_done: false,
        };

        Ok(Self::from_sides(reader, writer, options, format.name(), 0))
    }

    fn from_sides(
        reader: ReadSide<S>,
        writer: WriteSide<S>,
        options: ChunkOptions,
        format: &'static str,
        reused_count: u32,
    ) -> Self {
        Self {
            reader: Mutex::new(Some(reader)),
            writer: Mutex::new(Some(writer)),
            flags: StreamFlags::default(),
            cancel: CancellationToken::new(),
            options,
            format,
            reused_count,
        }
    }

    /// Current reuse eligibility
    pub fn reuse_state(&self) -> ReuseState {
        ReuseState {
            can_reuse: self.can_reuse(),
            reused_count: self.reused_count,
        }
    }

    /// How many messages preceded this one on the same socket
    pub fn reused_count(&self) -> u32 {
        self.reused_count
    }

    /// Wire variant name
    pub fn format(&self) -> &'static str {
        self.format
    }

    /// Whether the stream hit an unrecoverable error
    pub fn is_errored(&self) -> bool {
        self.flags.errored.load(Ordering::Acquire)
    }

    /// Whether the stream was closed or handed over to a reuse
    pub fn is_disposed(&self) -> bool {
        self.flags.disposed.load(Ordering::Acquire)
    }

    /// Whether the peer's terminal chunk has been read
    pub fn is_read_finished(&self) -> bool {
        self.flags.read_finished.load(Ordering::Acquire)
    }

    /// Announce `Connection: close` in this message's envelope
    ///
    /// Only effective before the first chunk is written; in any case it
    /// rules out reuse.
    pub fn set_close_connection(&self) {
        self.flags.close_connection.store(true, Ordering::Release);
    }

    fn can_reuse(&self) -> bool {
        !self.flags.errored.load(Ordering::Acquire)
            && !self.flags.disposed.load(Ordering::Acquire)
            && !self.flags.close_connection.load(Ordering::Acquire)
            && !self.flags.close_received.load(Ordering::Acquire)
    }

    fn check_usable(&self) -> Result<(), ChunkError> {
        if self.flags.disposed.load(Ordering::Acquire) {
            return Err(ChunkError::Disposed);
        }
        if self.flags.errored.load(Ordering::Acquire) {
            return Err(ChunkError::Errored);
        }
        Ok(())
    }

    fn fail<T>(&self, err: ChunkError) -> Result<T, ChunkError> {
        if !matches!(err, ChunkError::Disposed) {
            debug!(format = self.format, error = %err, "Chunk stream entered error state");
            self.flags.errored.store(true, Ordering::Release);
        }
        Err(err)
    }

    /// Read payload bytes of the current message into `dst`
    ///
    /// Returns 0 once the terminal chunk has been seen, and keeps returning
    /// 0 afterwards. An empty `dst` is a no-op that also returns 0 without
    /// touching the socket; only [`is_read_finished`](Self::is_read_finished)
    /// tells it apart from the end of the message.
    pub async fn read(&self, dst: &mut [u8]) -> Result<usize, ChunkError> {
        self.check_usable()?;
        if self.flags.read_finished.load(Ordering::Acquire) || dst.is_empty() {
            return Ok(0);
        }

        let mut guard = self.reader.lock().await;
        let side = guard.as_mut().ok_or(ChunkError::Disposed)?;
        if self.flags.read_finished.load(Ordering::Acquire) {
            return Ok(0);
        }

        match side.read(dst, &self.flags, &self.cancel, &self.options).await {
            Ok(0) => {
                trace!(format = self.format, "Terminal chunk received");
                self.flags.read_finished.store(true, Ordering::Release);
                Ok(0)
            }
            Ok(n) => Ok(n),
            Err(e) => self.fail(e),
        }
    }

    /// Write `data` as exactly one chunk
    ///
    /// An empty `data` writes the terminal chunk instead; see
    /// [`finish`](Self::finish).
    pub async fn write(&self, data: &[u8]) -> Result<(), ChunkError> {
        if data.is_empty() {
            return self.finish().await;
        }

        self.check_usable()?;
        if data.len() > self.options.max_chunk_size {
            return Err(ChunkError::ChunkTooLarge(
                data.len(),
                self.options.max_chunk_size,
            ));
        }

        let mut guard = self.writer.lock().await;
        let side = guard.as_mut().ok_or(ChunkError::Disposed)?;
        if self.flags.write_finished.load(Ordering::Acquire) {
            return Err(ChunkError::WriteFinished);
        }

        let keep_alive = !self.flags.close_connection.load(Ordering::Acquire);
        let result = side
            .send(&self.cancel, keep_alive, Outgoing::Chunk(data))
            .await;

        match result {
            Ok(()) => Ok(()),
            Err(e) => self.fail(e),
        }
    }

    /// Write the terminal chunk of this message (idempotent)
    pub async fn finish(&self) -> Result<(), ChunkError> {
        self.check_usable()?;

        let mut guard = self.writer.lock().await;
        let side = guard.as_mut().ok_or(ChunkError::Disposed)?;
        if self.flags.write_finished.load(Ordering::Acquire) {
            return Ok(());
        }

        let keep_alive = !self.flags.close_connection.load(Ordering::Acquire);
        let result = side
            .send(&self.cancel, keep_alive, Outgoing::Terminal)
            .await;

        match result {
            Ok(()) => {
                trace!(format = self.format, "Terminal chunk sent");
                self.flags.write_finished.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => self.fail(e),
        }
    }

    /// Send our terminal chunk and consume the peer's
    async fn finalize(&self) -> Result<(), ChunkError> {
        self.finish().await?;

        let mut scratch = [0u8; DRAIN_BUFFER_SIZE];
        let mut discarded = 0usize;
        loop {
            let n = self.read(&mut scratch).await?;
            if n == 0 {
                break;
            }
            discarded += n;
        }

        if discarded > 0 {
            debug!(
                format = self.format,
                discarded, "Discarded unread payload while finalizing message"
            );
        }
        Ok(())
    }

    /// Finish the message and release the socket
    ///
    /// With `close_connection` the envelope announces `Connection: close` if
    /// it has not been sent yet. Draining the peer's terminal chunk is
    /// bounded by the graceful timeout; failures there are logged only.
    pub async fn close(&self, close_connection: bool) -> Result<(), ChunkError> {
        if self.flags.disposed.load(Ordering::Acquire) {
            return Ok(());
        }
        if close_connection {
            self.set_close_connection();
        }

        if !self.is_errored() {
            match tokio::time::timeout(self.options.graceful_timeout, self.finalize()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(format = self.format, error = %e, "Graceful chunk stream close failed")
                }
                Err(_) => warn!(
                    format = self.format,
                    timeout_ms = self.options.graceful_timeout.as_millis() as u64,
                    "Timed out waiting for the peer's terminal chunk"
                ),
            }
        }

        if self.flags.disposed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.cancel.cancel();

        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        if let Some(mut writer) = writer {
            if let Err(e) = writer.io.shutdown().await {
                trace!(error = %e, "Socket shutdown failed");
            }
        }
        drop(reader);
        Ok(())
    }

    /// Finish this message and return a new framing instance on the same socket
    ///
    /// Fails with [`ChunkError::NotReusable`] if an error occurred or either
    /// side asked to close the connection. On success this instance is
    /// disposed (without closing the socket) and every further operation on
    /// it fails.
    pub async fn create_reuse(&self) -> Result<ChunkStream<S>, ChunkError> {
        if !self.can_reuse() {
            return Err(ChunkError::NotReusable);
        }

        match tokio::time::timeout(self.options.reuse_timeout, self.finalize()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return self.fail(e),
            Err(_) => return self.fail(ChunkError::Timeout),
        }

        if !self.can_reuse() {
            return Err(ChunkError::NotReusable);
        }
        if self.flags.disposed.swap(true, Ordering::AcqRel) {
            return Err(ChunkError::Disposed);
        }

        let writer = self.writer.lock().await.take();
        let reader = self.reader.lock().await.take();
        let (Some(mut reader), Some(mut writer)) = (reader, writer) else {
            return Err(ChunkError::Disposed);
        };

        reader.reset();
        writer.reset();

        let reused_count = self.reused_count + 1;
        debug!(format = self.format, reused_count, "Chunk stream reused");
        Ok(Self::from_sides(
            reader,
            writer,
            self.options.clone(),
            self.format,
            reused_count,
        ))
    }
}

impl<S> ReadSide<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn read(
        &mut self,
        dst: &mut [u8],
        flags: &StreamFlags,
        cancel: &CancellationToken,
        options: &ChunkOptions,
    ) -> Result<usize, ChunkError> {
        loop {
            if !self.opened.is_empty() {
                let n = dst.len().min(self.opened.len());
                dst[..n].copy_from_slice(&self.opened[..n]);
                self.opened.advance(n);
                return Ok(n);
            }

            if self.remaining > 0 {
                if self.buf.is_empty() {
                    self.fill(cancel).await?;
                }
                let n = dst.len().min(self.remaining).min(self.buf.len());
                dst[..n].copy_from_slice(&self.buf[..n]);
                self.buf.advance(n);
                self.remaining -= n;
                return Ok(n);
            }

            // Sealed bodies are opened whole
            if self.sealed_len > 0 {
                while self.buf.len() < self.sealed_len {
                    self.fill(cancel).await?;
                }
                let mut body = self.buf.split_to(self.sealed_len);
                self.sealed_len = 0;
                let n = self.decoder.open_payload(&mut body)?;
                body.truncate(n);
                self.opened = body;
                continue;
            }

            if self.trailer_pending {
                while self.decoder.decode_trailer(&mut self.buf)?.is_none() {
                    self.fill(cancel).await?;
                }
                self.trailer_pending = false;
            }

            if !self.preamble_done {
                let preamble = loop {
                    if let Some(p) = self.decoder.decode_preamble(&mut self.buf)? {
                        break p;
                    }
                    self.fill(cancel).await?;
                };
                if !preamble.keep_alive {
                    flags.close_received.store(true, Ordering::Release);
                }
                self.preamble_done = true;
            }

            let header = loop {
                if let Some(h) = self.decoder.decode_header(&mut self.buf)? {
                    break h;
                }
                self.fill(cancel).await?;
            };

            match header {
                ChunkHeader::Terminal => return Ok(0),
                ChunkHeader::Data { len, encrypted } => {
                    let limit = options.max_chunk_size + if encrypted { TAG_LEN } else { 0 };
                    if len > limit {
                        return Err(ChunkError::ChunkTooLarge(len, limit));
                    }

                    self.trailer_pending = true;
                    if encrypted {
                        self.sealed_len = len;
                    } else {
                        self.remaining = len;
                    }
                }
            }
        }
    }

    async fn fill(&mut self, cancel: &CancellationToken) -> Result<(), ChunkError> {
        self.buf.reserve(READ_BUFFER_SIZE);
        let n = tokio::select! {
            res = self.io.read_buf(&mut self.buf) => res?,
            _ = cancel.cancelled() => return Err(ChunkError::Disposed),
        };

        if n == 0 {
            return Err(ChunkError::UnexpectedEof);
        }
        Ok(())
    }

    fn reset(&mut self) {
        self.decoder.reset();
        self.preamble_done = false;
        self.remaining = 0;
        self.sealed_len = 0;
        self.trailer_pending = false;
        self.opened.clear();
    }
}

impl<S> WriteSide<S>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    async fn send(
        &mut self,
        cancel: &CancellationToken,
        keep_alive: bool,
        outgoing: Outgoing<'_>,
    ) -> Result<(), ChunkError> {
        self.out.clear();
        if !self.preamble_done {
            self.encoder.encode_preamble(keep_alive, &mut self.out)?;
        }
        match outgoing {
            Outgoing::Chunk(data) => self.encoder.encode_chunk(data, &mut self.out)?,
            Outgoing::Terminal => self.encoder.encode_terminal(&mut self.out)?,
        }

        tokio::select! {
            res = async {
                self.io.write_all(&self.out).await?;
                self.io.flush().await
            } => res?,
            _ = cancel.cancelled() => return Err(ChunkError::Disposed),
        }

        self.preamble_done = true;
        Ok(())
    }

    fn reset(&mut self) {
        self.encoder.reset();
        self.preamble_done = false;
        self.out.clear();
    }
}
