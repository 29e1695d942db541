//! Shared UDP socket with per-session AEAD

use super::{
    datagram_nonce, is_socket_fatal, parse_header, TransmitterOptions, UdpError, AAD_LEN,
    MAX_RECV_DATAGRAM_SIZE, UDP_HEADER_LEN,
};
use crate::crypto::{SequenceCounter, SessionKey};
use bytes::{BufMut, BytesMut};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Minimum spacing between two drop warnings of the receive loop
pub const DROP_WARN_INTERVAL: Duration = Duration::from_secs(10);

/// Key lookup and dispatch target of the receive loop
pub trait UdpSessionHandler: Send + Sync {
    /// Key of `session_id`, if the session is known
    fn session_key(&self, session_id: u64) -> Option<Arc<SessionKey>>;

    /// Authenticated plaintext of one datagram
    ///
    /// `plaintext` borrows the loop's scratch buffer and is only valid for
    /// the duration of the call.
    fn on_packet_decrypted(&self, session_id: u64, plaintext: &[u8], remote: SocketAddr);
}

/// Counters of one transmitter
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransmitterStats {
    pub datagrams_sent: u64,
    pub datagrams_received: u64,
    pub dropped_short: u64,
    pub dropped_unknown_session: u64,
    pub dropped_auth_failed: u64,
}

#[derive(Debug, Default)]
struct StatsCounters {
    sent: AtomicU64,
    received: AtomicU64,
    short: AtomicU64,
    unknown_session: AtomicU64,
    auth_failed: AtomicU64,
}

impl StatsCounters {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn snapshot(&self) -> TransmitterStats {
        TransmitterStats {
            datagrams_sent: self.sent.load(Ordering::Relaxed),
            datagrams_received: self.received.load(Ordering::Relaxed),
            dropped_short: self.short.load(Ordering::Relaxed),
            dropped_unknown_session: self.unknown_session.load(Ordering::Relaxed),
            dropped_auth_failed: self.auth_failed.load(Ordering::Relaxed),
        }
    }
}

/// Rate limiter for the receive loop's drop warnings
struct DropWarnings {
    last: Option<Instant>,
    suppressed: u64,
}

impl DropWarnings {
    fn new() -> Self {
        Self {
            last: None,
            suppressed: 0,
        }
    }

    /// Returns the number of suppressed drops if a warning is due now
    fn due(&mut self) -> Option<u64> {
        let now = Instant::now();
        match self.last {
            Some(last) if now.duration_since(last) < DROP_WARN_INTERVAL => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}

/// One UDP socket shared by many sessions
///
/// Sends from all sessions are serialized by one lock around the send
/// buffer; a single background task receives and dispatches datagrams.
pub struct UdpChannelTransmitter {
    socket: UdpSocket,
    sequence: Arc<SequenceCounter>,
    options: TransmitterOptions,
    send_buf: Mutex<BytesMut>,
    stats: StatsCounters,
    cancel: CancellationToken,
    disposed: AtomicBool,
}

impl UdpChannelTransmitter {
    /// Bind a new socket
    pub async fn bind<A: ToSocketAddrs>(
        addr: A,
        sequence: Arc<SequenceCounter>,
        options: TransmitterOptions,
    ) -> Result<Self, UdpError> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Self::from_socket(socket, sequence, options))
    }

    /// Wrap an already bound socket
    pub fn from_socket(
        socket: UdpSocket,
        sequence: Arc<SequenceCounter>,
        options: TransmitterOptions,
    ) -> Self {
        let send_buf = BytesMut::with_capacity(options.max_datagram_size);
        Self {
            socket,
            sequence,
            options,
            send_buf: Mutex::new(send_buf),
            stats: StatsCounters::default(),
            cancel: CancellationToken::new(),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn local_addr(&self) -> Result<SocketAddr, UdpError> {
        Ok(self.socket.local_addr()?)
    }

    /// Largest payload one datagram can carry
    pub fn max_payload(&self) -> usize {
        self.options.max_datagram_size.saturating_sub(UDP_HEADER_LEN)
    }

    pub fn stats(&self) -> TransmitterStats {
        self.stats.snapshot()
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Start the receive loop
    pub fn start(self: Arc<Self>, handler: Arc<dyn UdpSessionHandler>) -> JoinHandle<()> {
        tokio::spawn(self.receive_loop(handler))
    }

    /// Seal `payload` for `session_id` and send it to `endpoint`
    ///
    /// Returns the sequence number the datagram was sealed with.
    pub async fn send(
        &self,
        session_id: u64,
        endpoint: SocketAddr,
        payload: &[u8],
        key: &SessionKey,
    ) -> Result<u64, UdpError> {
        let total = UDP_HEADER_LEN + payload.len();
        if total > self.options.max_datagram_size {
            return Err(UdpError::DatagramTooLarge(
                total,
                self.options.max_datagram_size,
            ));
        }
        if self.is_disposed() {
            return Err(UdpError::Disposed);
        }

        let mut buf = self.send_buf.lock().await;
        let seq = self.sequence.next()?;
        let nonce = datagram_nonce(session_id, seq);

        buf.clear();
        buf.put_u64_le(session_id);
        buf.put_u64_le(seq);
        buf.put_bytes(0, UDP_HEADER_LEN - AAD_LEN);
        buf.put_slice(payload);

        let (aad, rest) = buf.split_at_mut(AAD_LEN);
        let (tag_slot, body) = rest.split_at_mut(UDP_HEADER_LEN - AAD_LEN);
        let tag = key.seal_in_place(nonce, aad, body)?;
        tag_slot.copy_from_slice(&tag);

        let result = self.socket.send_to(&buf, endpoint).await;
        drop(buf);

        match result {
            Ok(_) => {
                StatsCounters::bump(&self.stats.sent);
                trace!(session_id, seq, %endpoint, len = total, "Datagram sent");
                Ok(seq)
            }
            Err(e) if is_socket_fatal(&e) => {
                warn!(session_id, %endpoint, error = %e, "UDP socket failed on send");
                self.dispose();
                Err(e.into())
            }
            Err(e) => {
                debug!(session_id, %endpoint, error = %e, "Datagram send failed");
                Err(e.into())
            }
        }
    }

    /// Stop the receive loop and refuse further sends (idempotent)
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        info!(stats = ?self.stats.snapshot(), "UDP transmitter disposed");
    }

    async fn receive_loop(self: Arc<Self>, handler: Arc<dyn UdpSessionHandler>) {
        let mut datagram = vec![0u8; MAX_RECV_DATAGRAM_SIZE];
        let mut scratch = BytesMut::with_capacity(MAX_RECV_DATAGRAM_SIZE);
        let mut warnings = DropWarnings::new();

        if let Ok(addr) = self.socket.local_addr() {
            debug!(%addr, "UDP receive loop started");
        }

        loop {
            let received = tokio::select! {
                res = self.socket.recv_from(&mut datagram) => res,
                _ = self.cancel.cancelled() => break,
            };

            let (len, remote) = match received {
                Ok(r) => r,
                Err(e) if is_socket_fatal(&e) => {
                    warn!(error = %e, "UDP socket failed on receive");
                    self.dispose();
                    break;
                }
                Err(e) => {
                    // e.g. ICMP port unreachable surfacing as a reset
                    debug!(error = %e, "Datagram receive failed");
                    continue;
                }
            };
            let datagram = &datagram[..len];

            let (session_id, seq) = match parse_header(datagram) {
                Ok(header) => header,
                Err(e) => {
                    StatsCounters::bump(&self.stats.short);
                    if let Some(suppressed) = warnings.due() {
                        warn!(%remote, error = %e, suppressed, "Dropping datagram");
                    }
                    continue;
                }
            };

            let key = match handler
                .session_key(session_id)
                .ok_or(UdpError::UnknownSession(session_id))
            {
                Ok(key) => key,
                Err(e) => {
                    StatsCounters::bump(&self.stats.unknown_session);
                    if let Some(suppressed) = warnings.due() {
                        warn!(%remote, error = %e, suppressed, "Dropping datagram");
                    }
                    continue;
                }
            };

            // ring expects the tag after the ciphertext
            scratch.clear();
            scratch.extend_from_slice(&datagram[UDP_HEADER_LEN..]);
            scratch.extend_from_slice(&datagram[AAD_LEN..UDP_HEADER_LEN]);

            let nonce = datagram_nonce(session_id, seq);
            match key.open_in_place(nonce, &datagram[..AAD_LEN], &mut scratch) {
                Ok(plaintext) => {
                    StatsCounters::bump(&self.stats.received);
                    trace!(session_id, seq, %remote, len = plaintext.len(), "Datagram received");
                    handler.on_packet_decrypted(session_id, plaintext, remote);
                }
                Err(_) => {
                    StatsCounters::bump(&self.stats.auth_failed);
                    if let Some(suppressed) = warnings.due() {
                        warn!(%remote, session_id, seq, suppressed, "Dropping datagram that failed authentication");
                    }
                }
            }
        }

        debug!("UDP receive loop stopped");
    }
}

impl std::fmt::Debug for UdpChannelTransmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpChannelTransmitter")
            .field("local_addr", &self.socket.local_addr().ok())
            .field("options", &self.options)
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
