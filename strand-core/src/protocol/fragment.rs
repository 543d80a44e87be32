//! Video fragmentation: the 12-byte fragment header and the host-side
//! packetizer that splits access units into MTU-sized datagrams.
//!
//! ## Wire format
//!
//! ```text
//! type:            u8   (1)   always 0x01
//! flags:           u8   (1)   FragmentFlags
//! sequence:        u16  (2)   per-datagram, wraps
//! frame_number:    u16  (2)   low 16 bits of the encoder counter
//! fragment_index:  u16  (2)
//! fragment_total:  u16  (2)
//! codec:           u8   (1)
//! reserved:        u8   (1)
//! payload:         [u8] (≤ MTU − 12)
//! ```
//!
//! All multi-byte fields are big-endian.

use bytes::{BufMut, Bytes, BytesMut};

use crate::encoder::EncodedPacket;
use crate::error::StreamError;
use crate::flags::FragmentFlags;
use crate::protocol::{DEFAULT_MTU, PacketType};
use crate::types::Codec;

// ── FragmentHeader ───────────────────────────────────────────────

/// Header prepended to every video datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    pub flags: FragmentFlags,
    pub sequence: u16,
    pub frame_number: u16,
    pub fragment_index: u16,
    pub fragment_total: u16,
    pub codec: Codec,
}

impl FragmentHeader {
    /// Encoded size on the wire.
    pub const SIZE: usize = 12;

    pub fn is_keyframe(&self) -> bool {
        self.flags.contains(FragmentFlags::KEYFRAME)
    }

    pub fn is_retransmit(&self) -> bool {
        self.flags.contains(FragmentFlags::RETRANSMIT)
    }

    /// Serialize to bytes (big-endian).
    pub fn encode(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0] = PacketType::Video as u8;
        buf[1] = self.flags.bits();
        buf[2..4].copy_from_slice(&self.sequence.to_be_bytes());
        buf[4..6].copy_from_slice(&self.frame_number.to_be_bytes());
        buf[6..8].copy_from_slice(&self.fragment_index.to_be_bytes());
        buf[8..10].copy_from_slice(&self.fragment_total.to_be_bytes());
        buf[10] = self.codec.as_u8();
        buf
    }

    /// Parse the header of a video datagram and return it together with
    /// the payload slice that follows.
    ///
    /// Index/total consistency is not checked here; the jitter buffer
    /// rejects and counts such fragments.
    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), StreamError> {
        if data.len() < Self::SIZE {
            return Err(StreamError::PacketTooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        if data[0] != PacketType::Video as u8 {
            return Err(StreamError::InvalidHeader("not a video fragment"));
        }
        let be16 = |at: usize| u16::from_be_bytes([data[at], data[at + 1]]);
        let fragment_total = be16(8);
        if fragment_total == 0 {
            return Err(StreamError::InvalidHeader("fragment_total is zero"));
        }
        let header = Self {
            flags: FragmentFlags::from_bits_truncate(data[1]),
            sequence: be16(2),
            frame_number: be16(4),
            fragment_index: be16(6),
            fragment_total,
            codec: Codec::try_from(data[10])?,
        };
        Ok((header, &data[Self::SIZE..]))
    }
}

// ── Fragment ─────────────────────────────────────────────────────

/// One ready-to-send video datagram.
#[derive(Debug, Clone)]
pub struct Fragment {
    pub header: FragmentHeader,
    /// Header + payload, exactly as sent.
    pub datagram: Bytes,
}

impl Fragment {
    /// A copy of this datagram with the `RETRANSMIT` flag set. The
    /// sequence number is unchanged so the receiver can close its gap.
    pub fn as_retransmit(&self) -> Bytes {
        let mut buf = BytesMut::from(&self.datagram[..]);
        buf[1] = (self.header.flags | FragmentFlags::RETRANSMIT).bits();
        buf.freeze()
    }

    pub fn payload(&self) -> &[u8] {
        &self.datagram[FragmentHeader::SIZE..]
    }
}

// ── Packetizer ───────────────────────────────────────────────────

/// Splits encoded access units into fragments, numbering every datagram
/// with a continuous wrapping sequence counter.
#[derive(Debug)]
pub struct Packetizer {
    mtu: usize,
    next_sequence: u16,
}

impl Packetizer {
    /// Create a packetizer whose datagrams never exceed `mtu` bytes.
    pub fn new(mtu: usize) -> Result<Self, StreamError> {
        if mtu <= FragmentHeader::SIZE {
            return Err(StreamError::InvalidConfig(format!(
                "mtu {mtu} leaves no room for payload"
            )));
        }
        Ok(Self {
            mtu,
            next_sequence: 0,
        })
    }

    /// Start numbering at `sequence` (hosts randomize this per session).
    pub fn with_initial_sequence(mut self, sequence: u16) -> Self {
        self.next_sequence = sequence;
        self
    }

    pub fn mtu(&self) -> usize {
        self.mtu
    }

    /// The sequence number the next datagram will carry.
    pub fn next_sequence(&self) -> u16 {
        self.next_sequence
    }

    /// Split one access unit into datagrams.
    ///
    /// An empty bitstream still produces a single (empty) fragment so the
    /// frame number advances on the receiver.
    pub fn packetize(&mut self, packet: &EncodedPacket) -> Result<Vec<Fragment>, StreamError> {
        let max_payload = self.mtu - FragmentHeader::SIZE;
        let total = packet.data.len().div_ceil(max_payload).max(1);
        if total > u16::MAX as usize {
            return Err(StreamError::FrameTooLarge {
                size: packet.data.len(),
                max: max_payload * u16::MAX as usize,
            });
        }

        let mut flags = FragmentFlags::empty();
        if packet.keyframe {
            flags |= FragmentFlags::KEYFRAME;
        }
        let frame_number = packet.frame_number as u16;

        let mut fragments = Vec::with_capacity(total);
        for index in 0..total {
            let start = index * max_payload;
            let end = (start + max_payload).min(packet.data.len());
            let header = FragmentHeader {
                flags,
                sequence: self.next_sequence,
                frame_number,
                fragment_index: index as u16,
                fragment_total: total as u16,
                codec: packet.codec,
            };
            self.next_sequence = self.next_sequence.wrapping_add(1);

            let mut buf = BytesMut::with_capacity(FragmentHeader::SIZE + end - start);
            buf.put_slice(&header.encode());
            buf.put_slice(&packet.data[start..end]);
            fragments.push(Fragment {
                header,
                datagram: buf.freeze(),
            });
        }
        Ok(fragments)
    }
}

impl Default for Packetizer {
    fn default() -> Self {
        Self {
            mtu: DEFAULT_MTU,
            next_sequence: 0,
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    fn packet(frame_number: u64, len: usize, keyframe: bool) -> EncodedPacket {
        EncodedPacket {
            frame_number,
            keyframe,
            codec: Codec::H264,
            data: Bytes::from((0..len).map(|i| i as u8).collect::<Vec<_>>()),
            timestamp: Instant::now(),
        }
    }

    #[test]
    fn header_layout_is_big_endian() {
        let hdr = FragmentHeader {
            flags: FragmentFlags::KEYFRAME,
            sequence: 0x0102,
            frame_number: 0x0304,
            fragment_index: 0x0005,
            fragment_total: 0x0006,
            codec: Codec::H265,
        };
        let bytes = hdr.encode();
        assert_eq!(bytes, [0x01, 0x01, 1, 2, 3, 4, 0, 5, 0, 6, 2, 0]);

        let (decoded, payload) = FragmentHeader::decode(&bytes).unwrap();
        assert_eq!(decoded, hdr);
        assert!(payload.is_empty());
    }

    #[test]
    fn header_rejects_bad_input() {
        assert!(matches!(
            FragmentHeader::decode(&[0x01; 5]),
            Err(StreamError::PacketTooShort { expected: 12, actual: 5 })
        ));

        let mut bytes = [0x01, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 0];
        assert!(matches!(
            FragmentHeader::decode(&bytes),
            Err(StreamError::InvalidHeader(_))
        ));

        bytes[9] = 1;
        bytes[10] = 0x42;
        assert!(matches!(
            FragmentHeader::decode(&bytes),
            Err(StreamError::UnknownVariant { .. })
        ));

        bytes[0] = 0x02;
        assert!(FragmentHeader::decode(&bytes).is_err());
    }

    #[test]
    fn packetize_splits_at_mtu() {
        let mut p = Packetizer::new(112).unwrap();
        let fragments = p.packetize(&packet(7, 250, true)).unwrap();

        assert_eq!(fragments.len(), 3);
        assert!(fragments.iter().all(|f| f.datagram.len() <= 112));
        assert_eq!(fragments[2].payload().len(), 50);
        for (i, f) in fragments.iter().enumerate() {
            assert_eq!(f.header.fragment_index as usize, i);
            assert_eq!(f.header.fragment_total, 3);
            assert_eq!(f.header.frame_number, 7);
            assert_eq!(f.header.sequence as usize, i);
            assert!(f.header.is_keyframe());
        }

        let joined: Vec<u8> = fragments.iter().flat_map(|f| f.payload().to_vec()).collect();
        assert_eq!(joined, (0..250).map(|i| i as u8).collect::<Vec<_>>());
    }

    #[test]
    fn sequence_wraps_across_frames() {
        let mut p = Packetizer::new(100).unwrap().with_initial_sequence(65534);
        let a = p.packetize(&packet(1, 10, false)).unwrap();
        let b = p.packetize(&packet(2, 200, false)).unwrap();
        assert_eq!(a[0].header.sequence, 65534);
        assert_eq!(b[0].header.sequence, 65535);
        assert_eq!(b[1].header.sequence, 0);
        assert_eq!(b[2].header.sequence, 1);
        assert_eq!(p.next_sequence(), 2);
    }

    #[test]
    fn frame_number_truncates_to_16_bits() {
        let mut p = Packetizer::default();
        let f = p.packetize(&packet(0x1_0005, 0, false)).unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(f[0].header.frame_number, 5);
        assert_eq!(f[0].header.fragment_total, 1);
    }

    #[test]
    fn retransmit_copy_sets_flag_only() {
        let mut p = Packetizer::default();
        let f = p.packetize(&packet(3, 20, true)).unwrap().remove(0);
        let resent = f.as_retransmit();
        let (hdr, payload) = FragmentHeader::decode(&resent).unwrap();
        assert!(hdr.is_retransmit());
        assert!(hdr.is_keyframe());
        assert_eq!(hdr.sequence, f.header.sequence);
        assert_eq!(payload, f.payload());
    }

    #[test]
    fn tiny_mtu_rejected() {
        assert!(Packetizer::new(FragmentHeader::SIZE).is_err());
    }
}
