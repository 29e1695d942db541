//! Packet codec capability consumed by the channel layer
//!
//! Channels never interpret tunneled packets beyond three questions: how
//! long is the packet at the head of this buffer, is it a close-control
//! packet, and what does a close-control packet look like. [`PacketCodec`]
//! answers them; [`IpPacketCodec`] is the IPv4/IPv6 implementation.

use bytes::{BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Packet codec errors
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Invalid packet length: {0}")]
    InvalidLength(usize),

    #[error("Packet truncated: need {needed} bytes, have {actual}")]
    Truncated { needed: usize, actual: usize },
}

/// Marker payload carried by the close-control packet
pub const CLOSE_CONTROL_MARKER: &[u8] = b"\x00vpn-channel/close\x00";

const IPV4_HEADER_LEN: usize = 20;
const IPV6_HEADER_LEN: usize = 40;
const UDP_HEADER_LEN: usize = 8;
const PROTO_TCP: u8 = 6;
const PROTO_UDP: u8 = 17;

/// Capability to measure and recognize packets
pub trait PacketCodec: Send + Sync {
    /// Exact length of the packet at the start of `buf`
    ///
    /// Returns `Ok(None)` if `buf` is too short to tell yet.
    fn packet_len(&self, buf: &[u8]) -> Result<Option<usize>, PacketError>;

    /// Whether `packet` is the in-band close-control packet
    fn is_close_control(&self, packet: &[u8]) -> bool;

    /// Build a close-control packet
    fn close_control_packet(&self) -> Bytes;

    /// Recompute header and transport checksums in place
    fn update_checksums(&self, packet: &mut [u8]) -> Result<(), PacketError>;
}

/// Split every whole packet off the front of `buf`
///
/// Leaves a trailing partial packet in `buf`.
pub fn split_packets(
    codec: &dyn PacketCodec,
    buf: &mut BytesMut,
) -> Result<Vec<Bytes>, PacketError> {
    let mut packets = Vec::new();
    while let Some(len) = codec.packet_len(buf)? {
        if buf.len() < len {
            break;
        }
        packets.push(buf.split_to(len).freeze());
    }
    Ok(packets)
}

/// IPv4/IPv6 packet codec
#[derive(Debug, Clone, Copy, Default)]
pub struct IpPacketCodec;

impl IpPacketCodec {
    pub fn new() -> Self {
        Self
    }

    fn close_control_len() -> usize {
        IPV4_HEADER_LEN + UDP_HEADER_LEN + CLOSE_CONTROL_MARKER.len()
    }
}

impl PacketCodec for IpPacketCodec {
    fn packet_len(&self, buf: &[u8]) -> Result<Option<usize>, PacketError> {
        let Some(first) = buf.first() else {
            return Ok(None);
        };

        match first >> 4 {
            4 => {
                if buf.len() < 4 {
                    return Ok(None);
                }
                let total = u16::from_be_bytes([buf[2], buf[3]]) as usize;
                if total < IPV4_HEADER_LEN {
                    return Err(PacketError::InvalidLength(total));
                }
                Ok(Some(total))
            }
            6 => {
                if buf.len() < 6 {
                    return Ok(None);
                }
                let payload = u16::from_be_bytes([buf[4], buf[5]]) as usize;
                Ok(Some(IPV6_HEADER_LEN + payload))
            }
            version => Err(PacketError::UnsupportedVersion(version)),
        }
    }

    fn is_close_control(&self, packet: &[u8]) -> bool {
        packet.len() == Self::close_control_len()
            && packet[0] == 0x45
            && packet[9] == PROTO_UDP
            && packet[12..20].iter().all(|b| *b == 0)
            && &packet[IPV4_HEADER_LEN + UDP_HEADER_LEN..] == CLOSE_CONTROL_MARKER
    }

    fn close_control_packet(&self) -> Bytes {
        let total = Self::close_control_len();
        let mut buf = BytesMut::with_capacity(total);

        // IPv4 header, 0.0.0.0 -> 0.0.0.0
        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16(total as u16);
        buf.put_u16(0);
        buf.put_u16(0x4000);
        buf.put_u8(64);
        buf.put_u8(PROTO_UDP);
        buf.put_u16(0);
        buf.put_slice(&[0u8; 8]);

        // UDP header, port 0 -> port 0
        buf.put_u16(0);
        buf.put_u16(0);
        buf.put_u16((UDP_HEADER_LEN + CLOSE_CONTROL_MARKER.len()) as u16);
        buf.put_u16(0);

        buf.put_slice(CLOSE_CONTROL_MARKER);

        // Always well formed, so checksum update cannot fail
        let _ = self.update_checksums(&mut buf);
        buf.freeze()
    }

    fn update_checksums(&self, packet: &mut [u8]) -> Result<(), PacketError> {
        let total = self
            .packet_len(packet)?
            .ok_or(PacketError::Truncated {
                needed: IPV4_HEADER_LEN,
                actual: packet.len(),
            })?;
        if packet.len() < total {
            return Err(PacketError::Truncated {
                needed: total,
                actual: packet.len(),
            });
        }
        let packet = &mut packet[..total];

        let (header_len, protocol, pseudo) = if packet[0] >> 4 == 4 {
            let ihl = ((packet[0] & 0x0f) as usize) * 4;
            if ihl < IPV4_HEADER_LEN || ihl > total {
                return Err(PacketError::InvalidLength(ihl));
            }
            packet[10] = 0;
            packet[11] = 0;
            let sum = fold(sum_words(&packet[..ihl], 0));
            packet[10..12].copy_from_slice(&(!sum).to_be_bytes());

            let pseudo = sum_words(&packet[12..20], 0);
            (ihl, packet[9], pseudo)
        } else {
            if total < IPV6_HEADER_LEN {
                return Err(PacketError::InvalidLength(total));
            }
            let pseudo = sum_words(&packet[8..40], 0);
            (IPV6_HEADER_LEN, packet[6], pseudo)
        };

        let checksum_offset = match protocol {
            PROTO_TCP => 16,
            PROTO_UDP => 6,
            _ => return Ok(()),
        };
        let segment_len = total - header_len;
        if segment_len < checksum_offset + 2 {
            return Err(PacketError::InvalidLength(segment_len));
        }

        let segment = &mut packet[header_len..];
        segment[checksum_offset] = 0;
        segment[checksum_offset + 1] = 0;

        let mut sum = pseudo + protocol as u32 + segment_len as u32;
        sum = sum_words(segment, sum);
        let mut checksum = !fold(sum);
        if protocol == PROTO_UDP && checksum == 0 {
            checksum = 0xffff;
        }
        segment[checksum_offset..checksum_offset + 2].copy_from_slice(&checksum.to_be_bytes());
        Ok(())
    }
}

fn sum_words(data: &[u8], mut sum: u32) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for word in &mut chunks {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }
    if let [last] = chunks.remainder() {
        sum = sum.wrapping_add((*last as u32) << 8);
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Minimal IPv4/UDP packet with `payload`
    pub(crate) fn udp_packet(payload: &[u8]) -> Bytes {
        let total = IPV4_HEADER_LEN + UDP_HEADER_LEN + payload.len();
        let mut buf = BytesMut::with_capacity(total);
        buf.put_u8(0x45);
        buf.put_u8(0);
        buf.put_u16(total as u16);
        buf.put_u32(0);
        buf.put_u8(64);
        buf.put_u8(PROTO_UDP);
        buf.put_u16(0);
        buf.put_slice(&[10, 0, 0, 1, 10, 0, 0, 2]);
        buf.put_u16(5000);
        buf.put_u16(53);
        buf.put_u16((UDP_HEADER_LEN + payload.len()) as u16);
        buf.put_u16(0);
        buf.put_slice(payload);
        IpPacketCodec.update_checksums(&mut buf).unwrap();
        buf.freeze()
    }

    #[test]
    fn test_packet_len_ipv4_and_ipv6() {
        let codec = IpPacketCodec::new();
        let v4 = udp_packet(b"hello");
        assert_eq!(codec.packet_len(&v4).unwrap(), Some(v4.len()));
        assert_eq!(codec.packet_len(&v4[..3]).unwrap(), None);

        let mut v6 = vec![0x60, 0, 0, 0, 0, 4, PROTO_UDP, 64];
        v6.resize(IPV6_HEADER_LEN + 4, 0);
        assert_eq!(codec.packet_len(&v6).unwrap(), Some(44));

        assert!(matches!(
            codec.packet_len(&[0x50, 0, 0, 0]),
            Err(PacketError::UnsupportedVersion(5))
        ));
        assert!(matches!(
            codec.packet_len(&[0x45, 0, 0, 8]),
            Err(PacketError::InvalidLength(8))
        ));
    }

    #[test]
    fn test_close_control_recognized() {
        let codec = IpPacketCodec::new();
        let close = codec.close_control_packet();
        assert!(codec.is_close_control(&close));
        assert_eq!(codec.packet_len(&close).unwrap(), Some(close.len()));
        assert!(!codec.is_close_control(&udp_packet(CLOSE_CONTROL_MARKER)));
    }

    #[test]
    fn test_ipv4_header_checksum_verifies() {
        let packet = udp_packet(b"abc");
        assert_eq!(fold(sum_words(&packet[..IPV4_HEADER_LEN], 0)), 0xffff);
    }

    #[test]
    fn test_split_packets_keeps_partial_tail() {
        let codec = IpPacketCodec::new();
        let a = udp_packet(b"first");
        let b = udp_packet(b"second packet");

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&a);
        buf.extend_from_slice(&b[..10]);

        let packets = split_packets(&codec, &mut buf).unwrap();
        assert_eq!(packets, vec![a]);
        assert_eq!(&buf[..], &b[..10]);

        buf.extend_from_slice(&b[10..]);
        let packets = split_packets(&codec, &mut buf).unwrap();
        assert_eq!(packets, vec![b]);
        assert!(buf.is_empty());
    }
}
