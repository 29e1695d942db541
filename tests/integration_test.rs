//! Integration tests for the VPN channel layer
//!
//! Tests the full flow over real sockets including:
//! - Packet round trips over binary, sealed binary and HTTP chunk streams
//! - Chunk stream termination and socket reuse
//! - The in-band close handshake
//! - Shared-socket UDP sessions: nonce discipline, tamper detection, demultiplexing

use bytes::{BufMut, Bytes, BytesMut};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;
use vpn_channel::channel::{ChannelOptions, ChannelState, PacketChannel, StreamPacketChannel};
use vpn_channel::chunk::{
    ChunkError, ChunkFormat, ChunkOptions, ChunkStream, StreamRole, SEALED_HEADER_SIZE,
};
use vpn_channel::config::TunnelConfig;
use vpn_channel::crypto::{derive_chunk_keys, SequenceCounter, SessionKey, CONNECTION_SALT_LEN};
use vpn_channel::packet::{IpPacketCodec, PacketCodec};
use vpn_channel::transport::{TcpListenerTransport, TcpTransport, TransportConfig};
use vpn_channel::udp::{
    TransmitterOptions, UdpChannel, UdpChannelTransmitter, UdpSessionMap, UDP_HEADER_LEN,
};

const WAIT: Duration = Duration::from_secs(5);

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// IPv4/UDP packet 10.8.0.1:40000 -> 10.8.0.2:53 carrying `payload`
fn ip_packet(id: u16, payload: &[u8]) -> Bytes {
    let total = 28 + payload.len();
    let mut buf = BytesMut::with_capacity(total);
    buf.put_u8(0x45);
    buf.put_u8(0);
    buf.put_u16(total as u16);
    buf.put_u16(id);
    buf.put_u16(0x4000);
    buf.put_u8(64);
    buf.put_u8(17);
    buf.put_u16(0);
    buf.put_slice(&[10, 8, 0, 1, 10, 8, 0, 2]);
    buf.put_u16(40000);
    buf.put_u16(53);
    buf.put_u16((8 + payload.len()) as u16);
    buf.put_u16(0);
    buf.put_slice(payload);
    IpPacketCodec::new()
        .update_checksums(&mut buf)
        .expect("well-formed packet");
    buf.freeze()
}

fn codec() -> Arc<dyn PacketCodec> {
    Arc::new(IpPacketCodec::new())
}

fn chunk_options() -> ChunkOptions {
    ChunkOptions {
        graceful_timeout: Duration::from_secs(1),
        ..ChunkOptions::default()
    }
}

async fn tcp_chunk_pair(format: &ChunkFormat) -> (ChunkStream<TcpStream>, ChunkStream<TcpStream>) {
    let listener = TcpListenerTransport::bind("127.0.0.1:0", TransportConfig::default())
        .await
        .expect("Failed to bind listener");
    let addr = listener.local_addr().unwrap();

    let transport = TcpTransport::default();
    let (client, server) = tokio::join!(
        transport.connect_chunked(addr, format, chunk_options()),
        listener.accept_chunked(format, chunk_options()),
    );
    (client.expect("connect failed"), server.expect("accept failed").0)
}

type Side = (StreamPacketChannel<TcpStream>, mpsc::Receiver<Bytes>);

async fn tcp_channel_pair(
    format: &ChunkFormat,
    client_options: ChannelOptions,
    server_options: ChannelOptions,
) -> (Side, Side) {
    let (client, server) = tcp_chunk_pair(format).await;
    (
        StreamPacketChannel::new("client", client, codec(), client_options),
        StreamPacketChannel::new("server", server, codec(), server_options),
    )
}

async fn wait_disposed(channels: &[&dyn PacketChannel]) {
    tokio::time::timeout(WAIT, async {
        while channels.iter().any(|c| c.state() != ChannelState::Disposed) {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("channels did not reach Disposed");
}

async fn round_trip(format: ChunkFormat) {
    init_tracing();
    let options = ChannelOptions {
        buffer_size: 256,
        ..ChannelOptions::default()
    };
    let ((client, mut client_rx), (server, mut server_rx)) =
        tcp_channel_pair(&format, options.clone(), options).await;
    client.start().unwrap();
    server.start().unwrap();

    let packets: Vec<Bytes> = (0..40u16)
        .map(|i| ip_packet(i, &vec![i as u8; (i as usize * 37) % 700]))
        .collect();

    // Several batches, so packets straddle chunks
    for batch in packets.chunks(7) {
        client.send_packets(batch).await.unwrap();
    }
    for expected in &packets {
        let got = tokio::time::timeout(WAIT, server_rx.recv())
            .await
            .expect("timed out")
            .expect("queue closed");
        assert_eq!(&got, expected);
    }

    // And back the other way, one packet per call
    for packet in &packets[..5] {
        server.send_packets(std::slice::from_ref(packet)).await.unwrap();
    }
    for expected in &packets[..5] {
        let got = tokio::time::timeout(WAIT, client_rx.recv()).await.unwrap().unwrap();
        assert_eq!(&got, expected);
    }

    let sent: u64 = packets.iter().map(|p| p.len() as u64).sum();
    assert_eq!(client.traffic().sent, sent);
    assert_eq!(server.traffic().received, sent);

    client.close().await;
    wait_disposed(&[&client, &server]).await;
}

// ============================================================================
// Stream packet channels
// ============================================================================

#[tokio::test]
async fn test_round_trip_binary() {
    round_trip(ChunkFormat::Binary).await;
}

#[tokio::test]
async fn test_round_trip_http() {
    round_trip(ChunkFormat::Http {
        host: "updates.example.com".to_string(),
    })
    .await;
}

#[tokio::test]
async fn test_round_trip_sealed_binary() {
    round_trip(ChunkFormat::EncryptedBinary {
        keys: derive_chunk_keys(b"integration secret").unwrap(),
        encrypt_payload: true,
    })
    .await;
}

#[tokio::test]
async fn test_close_handshake_on_lifespan_expiry() {
    init_tracing();
    let expiring = ChannelOptions {
        lifespan: Some(Duration::from_millis(200)),
        expiry_check_interval: Duration::from_millis(20),
        graceful_timeout: Duration::from_secs(2),
        ..ChannelOptions::default()
    };
    let ((client, _client_rx), (server, mut server_rx)) =
        tcp_channel_pair(&ChunkFormat::Binary, expiring, ChannelOptions::default()).await;
    client.start().unwrap();
    server.start().unwrap();

    client.send_packets(&[ip_packet(1, b"last words")]).await.unwrap();
    assert_eq!(server_rx.recv().await.unwrap(), ip_packet(1, b"last words"));

    wait_disposed(&[&client, &server]).await;
    assert!(client.lifecycle().handshake_complete());
    assert!(server.lifecycle().handshake_complete());
    assert!(server_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_close_handshake_when_both_sides_expire() {
    init_tracing();
    let expiring = ChannelOptions {
        lifespan: Some(Duration::from_millis(100)),
        expiry_check_interval: Duration::from_millis(10),
        graceful_timeout: Duration::from_secs(2),
        ..ChannelOptions::default()
    };
    let ((client, _c), (server, _s)) =
        tcp_channel_pair(&ChunkFormat::Binary, expiring.clone(), expiring).await;
    client.start().unwrap();
    server.start().unwrap();

    wait_disposed(&[&client, &server]).await;
    assert!(client.lifecycle().close_sent());
    assert!(server.lifecycle().close_sent());
}

#[tokio::test]
async fn test_graceful_timeout_forces_dispose() {
    init_tracing();
    let options = ChannelOptions {
        graceful_timeout: Duration::from_millis(200),
        ..ChannelOptions::default()
    };
    // The server side is never started, so nobody answers
    let ((client, _c), (_server, _s)) =
        tcp_channel_pair(&ChunkFormat::Binary, options, ChannelOptions::default()).await;
    client.start().unwrap();

    client.close().await;
    assert_eq!(client.state(), ChannelState::Disconnecting);
    wait_disposed(&[&client]).await;
    assert!(!client.lifecycle().close_received());
}

// ============================================================================
// Chunk streams
// ============================================================================

#[tokio::test]
async fn test_http_client_envelope_bytes() {
    let (a, mut raw) = tokio::io::duplex(4096);
    let client = ChunkStream::new(
        a,
        &ChunkFormat::Http {
            host: "x".to_string(),
        },
        StreamRole::Client,
        chunk_options(),
    )
    .unwrap();

    client.write(b"AB").await.unwrap();

    let prefix = b"POST /";
    let suffix = "HTTP/1.1\r\nHost: x\r\nContent-Type: application/octet-stream\r\n\
                  Cache-Control: no-store\r\nTransfer-Encoding: chunked\r\n\
                  Connection: keep-alive\r\n\r\n2\r\nAB\r\n";
    let mut head = vec![0u8; prefix.len() + 36 + 1 + suffix.len()];
    raw.read_exact(&mut head).await.unwrap();

    assert_eq!(&head[..prefix.len()], prefix);
    let guid = std::str::from_utf8(&head[prefix.len()..prefix.len() + 36]).unwrap();
    assert_eq!(guid.matches('-').count(), 4);
    assert!(guid.chars().all(|c| c == '-' || c.is_ascii_hexdigit()));
    assert_eq!(head[prefix.len() + 36], b' ');
    assert_eq!(&head[prefix.len() + 37..], suffix.as_bytes());

    // Answer like a server would, so close can drain our terminal chunk
    raw.write_all(b"HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n0\r\n\r\n")
        .await
        .unwrap();
    client.close(false).await.unwrap();

    let mut tail = [0u8; 5];
    raw.read_exact(&mut tail).await.unwrap();
    assert_eq!(&tail, b"0\r\n\r\n");
}

#[tokio::test]
async fn test_terminal_chunk_reads_zero_forever() {
    let (client, server) = tcp_chunk_pair(&ChunkFormat::Http {
        host: "x".to_string(),
    })
    .await;

    client.write(b"payload").await.unwrap();
    client.write(b"").await.unwrap();

    let mut buf = [0u8; 32];
    assert_eq!(server.read(&mut buf).await.unwrap(), 7);
    for _ in 0..3 {
        let n = tokio::time::timeout(Duration::from_millis(500), server.read(&mut buf))
            .await
            .expect("read after terminal must not block")
            .unwrap();
        assert_eq!(n, 0);
    }
}

#[tokio::test]
async fn test_reuse_over_tcp() {
    let keys = derive_chunk_keys(b"reuse secret").unwrap();
    let format = ChunkFormat::EncryptedBinary {
        keys,
        encrypt_payload: false,
    };
    let (client, server) = tcp_chunk_pair(&format).await;

    let mut client = client;
    let mut server = server;
    for round in 0..3u32 {
        let message = format!("message {}", round);
        client.write(message.as_bytes()).await.unwrap();
        client.finish().await.unwrap();

        let mut buf = [0u8; 64];
        let n = server.read(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], message.as_bytes());
        assert_eq!(server.read(&mut buf).await.unwrap(), 0);
        server.finish().await.unwrap();

        assert!(client.reuse_state().can_reuse);
        let (next_client, next_server) = tokio::join!(client.create_reuse(), server.create_reuse());
        let (old_client, old_server) = (client, server);
        client = next_client.unwrap();
        server = next_server.unwrap();
        assert_eq!(client.reused_count(), round + 1);

        // The finished instances are unusable
        assert!(matches!(old_client.write(b"x").await, Err(ChunkError::Disposed)));
        assert!(matches!(old_server.read(&mut buf).await, Err(ChunkError::Disposed)));
        assert!(matches!(old_client.create_reuse().await, Err(ChunkError::NotReusable)));
    }
}

#[tokio::test]
async fn test_reuse_refused_after_connection_close() {
    let (client, server) = tcp_chunk_pair(&ChunkFormat::Http {
        host: "x".to_string(),
    })
    .await;

    let server_task = tokio::spawn(async move {
        let mut buf = [0u8; 16];
        while server.read(&mut buf).await.unwrap() > 0 {}
        let state = server.reuse_state();
        server.close(false).await.unwrap();
        state
    });

    client.set_close_connection();
    client.write(b"bye").await.unwrap();
    client.finish().await.unwrap();

    let server_state = server_task.await.unwrap();
    assert!(!server_state.can_reuse);
    assert!(!client.reuse_state().can_reuse);
    assert!(matches!(client.create_reuse().await, Err(ChunkError::NotReusable)));
}

#[tokio::test]
async fn test_tampered_sealed_header_breaks_stream() {
    let keys = derive_chunk_keys(b"tamper secret").unwrap();
    let format = ChunkFormat::EncryptedBinary {
        keys,
        encrypt_payload: false,
    };
    let (a, mut raw) = tokio::io::duplex(4096);
    let (b, mut raw_peer) = tokio::io::duplex(4096);
    let writer = ChunkStream::new(a, &format, StreamRole::Client, chunk_options()).unwrap();
    let reader = ChunkStream::new(b, &format, StreamRole::Server, chunk_options()).unwrap();

    writer.write(b"important").await.unwrap();
    let mut wire = vec![0u8; CONNECTION_SALT_LEN + SEALED_HEADER_SIZE + 9];
    raw.read_exact(&mut wire).await.unwrap();
    wire[CONNECTION_SALT_LEN + 2] ^= 0x01;
    raw_peer.write_all(&wire).await.unwrap();

    let mut buf = [0u8; 32];
    assert!(matches!(reader.read(&mut buf).await, Err(ChunkError::Crypto(_))));
    assert!(!reader.reuse_state().can_reuse);
}

#[tokio::test]
async fn test_sealed_connections_use_distinct_keys() {
    let mut config = TunnelConfig::default();
    config.chunk.encrypt_headers = true;
    config.chunk.encrypt_payload = true;
    let format = config.chunk_format(Some(b"shared secret")).unwrap();

    let plaintexts = [[0x11u8; 16], [0x22u8; 16]];
    let mut wires = Vec::new();
    for plaintext in &plaintexts {
        let (a, mut raw) = tokio::io::duplex(4096);
        let client = ChunkStream::new(a, &format, StreamRole::Client, chunk_options()).unwrap();
        client.write(plaintext).await.unwrap();

        let mut wire = vec![0u8; CONNECTION_SALT_LEN + SEALED_HEADER_SIZE + 16 + 16];
        raw.read_exact(&mut wire).await.unwrap();
        wires.push(wire);
    }

    let header = CONNECTION_SALT_LEN..CONNECTION_SALT_LEN + SEALED_HEADER_SIZE;
    assert_ne!(&wires[0][..CONNECTION_SALT_LEN], &wires[1][..CONNECTION_SALT_LEN]);
    assert_ne!(&wires[0][header.clone()], &wires[1][header]);

    let body = CONNECTION_SALT_LEN + SEALED_HEADER_SIZE..CONNECTION_SALT_LEN + SEALED_HEADER_SIZE + 16;
    let ct_xor: Vec<u8> = wires[0][body.clone()]
        .iter()
        .zip(&wires[1][body])
        .map(|(x, y)| x ^ y)
        .collect();
    let pt_xor: Vec<u8> = plaintexts[0]
        .iter()
        .zip(&plaintexts[1])
        .map(|(x, y)| x ^ y)
        .collect();
    assert_ne!(ct_xor, pt_xor);
}

// ============================================================================
// UDP transport
// ============================================================================

async fn transmitter(sequence: Arc<SequenceCounter>) -> Arc<UdpChannelTransmitter> {
    Arc::new(
        UdpChannelTransmitter::bind("127.0.0.1:0", sequence, TransmitterOptions::default())
            .await
            .expect("Failed to bind UDP socket"),
    )
}

#[tokio::test]
async fn test_nonce_uniqueness_across_sessions() {
    let sequence = Arc::new(SequenceCounter::random().unwrap());
    let first = transmitter(sequence.clone()).await;
    let second = transmitter(sequence).await;
    let sink = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let target = sink.local_addr().unwrap();

    let tasks: Vec<_> = (0..8u64)
        .map(|session| {
            let tx = if session % 2 == 0 { first.clone() } else { second.clone() };
            tokio::spawn(async move {
                let key = SessionKey::generate().unwrap();
                let mut seqs = Vec::new();
                for i in 0..50u32 {
                    let seq = tx
                        .send(session, target, &i.to_le_bytes(), &key)
                        .await
                        .unwrap();
                    seqs.push(seq);
                }
                seqs
            })
        })
        .collect();

    let mut all = HashSet::new();
    for task in tasks {
        let seqs = task.await.unwrap();
        assert!(seqs.windows(2).all(|w| w[0] < w[1]));
        for seq in seqs {
            assert!(all.insert(seq), "sequence {} handed out twice", seq);
        }
    }
    assert_eq!(all.len(), 400);
}

#[tokio::test]
async fn test_tampered_datagrams_dropped() {
    init_tracing();
    let sequence = Arc::new(SequenceCounter::starting_at(1000));
    let sender = transmitter(sequence.clone()).await;
    let receiver = transmitter(sequence).await;
    let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let relay_addr = relay.local_addr().unwrap();
    let receiver_addr = receiver.local_addr().unwrap();

    let key = [7u8; 32];
    let map = Arc::new(UdpSessionMap::new());
    let (session, mut session_rx) = UdpChannel::new(
        11,
        SessionKey::new(&key).unwrap(),
        relay_addr,
        receiver.clone(),
        codec(),
        ChannelOptions::default(),
    );
    map.register(&session);
    receiver.clone().start(map.clone());

    let packet = ip_packet(1, b"authentic");
    sender
        .send(11, relay_addr, &packet, &SessionKey::new(&key).unwrap())
        .await
        .unwrap();
    let mut datagram = [0u8; 2048];
    let (n, _) = relay.recv_from(&mut datagram).await.unwrap();
    let original = datagram[..n].to_vec();

    // One flipped bit in the ciphertext, one in the tag
    for index in [UDP_HEADER_LEN + 3, 20] {
        let mut tampered = original.clone();
        tampered[index] ^= 0x10;
        relay.send_to(&tampered, receiver_addr).await.unwrap();
    }
    relay.send_to(&original, receiver_addr).await.unwrap();

    let got = tokio::time::timeout(WAIT, session_rx.recv()).await.unwrap().unwrap();
    assert_eq!(got, packet);
    assert!(session_rx.try_recv().is_err());
    assert_eq!(receiver.stats().dropped_auth_failed, 2);
    assert_eq!(receiver.stats().datagrams_received, 1);
}

#[tokio::test]
async fn test_udp_sessions_never_cross_deliver() {
    init_tracing();
    let sequence = Arc::new(SequenceCounter::random().unwrap());
    let client_tx = transmitter(sequence.clone()).await;
    let server_tx = transmitter(sequence).await;
    let server_addr = server_tx.local_addr().unwrap();
    let client_addr = client_tx.local_addr().unwrap();

    let server_map = Arc::new(UdpSessionMap::new());
    let mut server_sides = Vec::new();
    let mut client_sides = Vec::new();
    for (session_id, key) in [(0x5151_0001u64, [1u8; 32]), (0x5252_0002u64, [2u8; 32])] {
        let (server_side, server_rx) = UdpChannel::new(
            session_id,
            SessionKey::new(&key).unwrap(),
            client_addr,
            server_tx.clone(),
            codec(),
            ChannelOptions::default(),
        );
        server_map.register(&server_side);
        server_sides.push((server_side, server_rx));

        let (client_side, _client_rx) = UdpChannel::new(
            session_id,
            SessionKey::new(&key).unwrap(),
            server_addr,
            client_tx.clone(),
            codec(),
            ChannelOptions::default(),
        );
        client_side.start().unwrap();
        client_sides.push(client_side);
    }
    server_tx.clone().start(server_map.clone());

    let s1_packets: Vec<Bytes> = (0..10).map(|i| ip_packet(i, b"session one")).collect();
    let s2_packets: Vec<Bytes> = (0..10).map(|i| ip_packet(i, b"session two")).collect();
    let (r1, r2) = tokio::join!(
        async {
            for p in &s1_packets {
                client_sides[0].send_packets(std::slice::from_ref(p)).await?;
            }
            Ok::<_, vpn_channel::channel::ChannelError>(())
        },
        async {
            for p in &s2_packets {
                client_sides[1].send_packets(std::slice::from_ref(p)).await?;
            }
            Ok::<_, vpn_channel::channel::ChannelError>(())
        },
    );
    r1.unwrap();
    r2.unwrap();

    for ((_, rx), expected) in server_sides.iter_mut().zip([&s1_packets, &s2_packets]) {
        let mut got = Vec::new();
        while got.len() < expected.len() {
            let packet = tokio::time::timeout(WAIT, rx.recv())
                .await
                .expect("missing datagram")
                .unwrap();
            got.push(packet);
        }
        // Datagrams on loopback may reorder; compare as sets of contents
        let got: HashSet<Bytes> = got.into_iter().collect();
        let expected: HashSet<Bytes> = expected.iter().cloned().collect();
        assert_eq!(got, expected);
    }

    let client_remote: SocketAddr = server_sides[0].0.remote();
    assert_eq!(client_remote, client_addr);
    assert_eq!(server_tx.stats().dropped_unknown_session, 0);
    assert_eq!(server_tx.stats().dropped_auth_failed, 0);
}
