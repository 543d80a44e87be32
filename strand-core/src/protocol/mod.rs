//! Wire protocol for the UDP media session.
//!
//! Every datagram starts with a one-byte [`PacketType`]. Video datagrams
//! carry a fixed 12-byte [`FragmentHeader`](fragment::FragmentHeader);
//! NACKs carry a count-prefixed list of sequences; all other control
//! messages use `bincode` or fixed big-endian fields (see [`control`]).
//!
//! ```text
//! 0x01 VIDEO             fragment header + bitstream slice
//! 0x02 AUDIO             seq:u16, timestamp:u32 + codec payload
//! 0x10 INPUT             bincode InputEvent
//! 0x11 VIEWER_STATS      bincode ViewerStats
//! 0x12 PING              t_us:u64
//! 0x13 PONG              echoed t_us:u64
//! 0x14 HOST_STATS        bincode EncoderTelemetry
//! 0x20 PROBE             tx_id:u64
//! 0x21 PROBE_ACK         echoed tx_id:u64
//! 0xFD NACK              count:u8, seq:u16 × count
//! 0xFE KEYFRAME_REQUEST  empty
//! ```

pub mod control;
pub mod fragment;
pub mod nack;

use crate::error::StreamError;

pub use control::{AudioHeader, ControlMessage, Packet};
pub use fragment::{Fragment, FragmentHeader, Packetizer};
pub use nack::{MAX_NACK_ENTRIES, decode_nack, encode_nack_packets};

// ── Constants ────────────────────────────────────────────────────

/// Default payload budget per datagram, leaving room for IP/UDP and an
/// external encryption layer below a 1500-byte Ethernet MTU.
pub const DEFAULT_MTU: usize = 1200;

/// Receive buffer size; large enough for any datagram this protocol emits.
pub const MAX_DATAGRAM_SIZE: usize = 2048;

// ── PacketType ───────────────────────────────────────────────────

/// Leading type byte of every datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    Video = 0x01,
    Audio = 0x02,
    Input = 0x10,
    ViewerStats = 0x11,
    Ping = 0x12,
    Pong = 0x13,
    HostStats = 0x14,
    Probe = 0x20,
    ProbeAck = 0x21,
    Nack = 0xFD,
    KeyframeRequest = 0xFE,
}

impl PacketType {
    /// Reads the type byte of a datagram.
    pub fn peek(datagram: &[u8]) -> Result<Self, StreamError> {
        let first = *datagram.first().ok_or(StreamError::PacketTooShort {
            expected: 1,
            actual: 0,
        })?;
        Self::try_from(first)
    }
}

impl TryFrom<u8> for PacketType {
    type Error = StreamError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => PacketType::Video,
            0x02 => PacketType::Audio,
            0x10 => PacketType::Input,
            0x11 => PacketType::ViewerStats,
            0x12 => PacketType::Ping,
            0x13 => PacketType::Pong,
            0x14 => PacketType::HostStats,
            0x20 => PacketType::Probe,
            0x21 => PacketType::ProbeAck,
            0xFD => PacketType::Nack,
            0xFE => PacketType::KeyframeRequest,
            other => return Err(StreamError::UnknownPacketType(other)),
        })
    }
}

// ── Wrap-aware arithmetic ────────────────────────────────────────

/// Signed distance `a - b` on the 16-bit ring.
///
/// Positive when `a` is newer than `b`. Valid while the two values are
/// less than 32768 apart.
#[inline]
pub fn seq_diff(a: u16, b: u16) -> i16 {
    a.wrapping_sub(b) as i16
}

/// Whether `a` comes strictly after `b` on the 16-bit ring.
#[inline]
pub fn seq_newer(a: u16, b: u16) -> bool {
    seq_diff(a, b) > 0
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packet_type_ids() {
        assert_eq!(PacketType::peek(&[0xFD, 1, 0, 5]).unwrap(), PacketType::Nack);
        assert_eq!(PacketType::try_from(0x21).unwrap(), PacketType::ProbeAck);
        assert!(matches!(
            PacketType::try_from(0x7F),
            Err(StreamError::UnknownPacketType(0x7F))
        ));
        assert!(matches!(
            PacketType::peek(&[]),
            Err(StreamError::PacketTooShort { .. })
        ));
    }

    #[test]
    fn wrap_aware_comparison() {
        assert!(seq_newer(1, 0));
        assert!(seq_newer(0, 65535));
        assert!(seq_newer(5, 65530));
        assert!(!seq_newer(65530, 5));
        assert_eq!(seq_diff(2, 65534), 4);
        assert_eq!(seq_diff(65534, 2), -4);
        assert!(!seq_newer(7, 7));
    }
}
