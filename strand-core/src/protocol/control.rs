//! Non-video datagrams: audio framing, control messages and the
//! top-level [`Packet`] parser.

use crate::encoder::EncoderTelemetry;
use crate::error::StreamError;
use crate::input::InputEvent;
use crate::protocol::fragment::FragmentHeader;
use crate::protocol::{PacketType, decode_nack};
use crate::stats::ViewerStats;

// ── Audio ────────────────────────────────────────────────────────

/// Fixed prefix of every audio datagram (after the type byte).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AudioHeader {
    pub sequence: u16,
    /// Sample-clock timestamp of the first sample in the payload.
    pub timestamp: u32,
}

impl AudioHeader {
    /// Type byte + sequence + timestamp.
    pub const SIZE: usize = 7;

    /// Build a complete audio datagram.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut buf = Vec::with_capacity(Self::SIZE + payload.len());
        buf.push(PacketType::Audio as u8);
        buf.extend_from_slice(&self.sequence.to_be_bytes());
        buf.extend_from_slice(&self.timestamp.to_be_bytes());
        buf.extend_from_slice(payload);
        buf
    }

    pub fn decode(data: &[u8]) -> Result<(Self, &[u8]), StreamError> {
        if data.len() < Self::SIZE {
            return Err(StreamError::PacketTooShort {
                expected: Self::SIZE,
                actual: data.len(),
            });
        }
        if data[0] != PacketType::Audio as u8 {
            return Err(StreamError::InvalidHeader("not an audio packet"));
        }
        Ok((
            Self {
                sequence: u16::from_be_bytes([data[1], data[2]]),
                timestamp: u32::from_be_bytes([data[3], data[4], data[5], data[6]]),
            },
            &data[Self::SIZE..],
        ))
    }
}

// ── Control messages ─────────────────────────────────────────────

/// Every datagram type that is neither media nor NACK.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlMessage {
    Input(InputEvent),
    ViewerStats(ViewerStats),
    /// Sender clock in microseconds.
    Ping(u64),
    /// Echo of a [`ControlMessage::Ping`] value.
    Pong(u64),
    HostStats(EncoderTelemetry),
    /// Connectivity check carrying a transaction id.
    Probe(u64),
    ProbeAck(u64),
    KeyframeRequest,
}

impl ControlMessage {
    pub fn packet_type(&self) -> PacketType {
        match self {
            ControlMessage::Input(_) => PacketType::Input,
            ControlMessage::ViewerStats(_) => PacketType::ViewerStats,
            ControlMessage::Ping(_) => PacketType::Ping,
            ControlMessage::Pong(_) => PacketType::Pong,
            ControlMessage::HostStats(_) => PacketType::HostStats,
            ControlMessage::Probe(_) => PacketType::Probe,
            ControlMessage::ProbeAck(_) => PacketType::ProbeAck,
            ControlMessage::KeyframeRequest => PacketType::KeyframeRequest,
        }
    }

    /// Serialize into a complete datagram (type byte included).
    pub fn encode(&self) -> Result<Vec<u8>, StreamError> {
        let mut buf = vec![self.packet_type() as u8];
        match self {
            ControlMessage::Input(ev) => buf.extend(bincode::serialize(ev)?),
            ControlMessage::ViewerStats(s) => buf.extend(bincode::serialize(s)?),
            ControlMessage::HostStats(t) => buf.extend(bincode::serialize(t)?),
            ControlMessage::Ping(v)
            | ControlMessage::Pong(v)
            | ControlMessage::Probe(v)
            | ControlMessage::ProbeAck(v) => buf.extend_from_slice(&v.to_be_bytes()),
            ControlMessage::KeyframeRequest => {}
        }
        Ok(buf)
    }

    /// Parse the body that follows the type byte.
    pub fn decode(kind: PacketType, body: &[u8]) -> Result<Self, StreamError> {
        let be64 = || -> Result<u64, StreamError> {
            let bytes: [u8; 8] = body
                .get(..8)
                .and_then(|b| b.try_into().ok())
                .ok_or(StreamError::PacketTooShort {
                    expected: 9,
                    actual: body.len() + 1,
                })?;
            Ok(u64::from_be_bytes(bytes))
        };
        Ok(match kind {
            PacketType::Input => ControlMessage::Input(bincode::deserialize(body)?),
            PacketType::ViewerStats => ControlMessage::ViewerStats(bincode::deserialize(body)?),
            PacketType::HostStats => ControlMessage::HostStats(bincode::deserialize(body)?),
            PacketType::Ping => ControlMessage::Ping(be64()?),
            PacketType::Pong => ControlMessage::Pong(be64()?),
            PacketType::Probe => ControlMessage::Probe(be64()?),
            PacketType::ProbeAck => ControlMessage::ProbeAck(be64()?),
            PacketType::KeyframeRequest => ControlMessage::KeyframeRequest,
            PacketType::Video | PacketType::Audio | PacketType::Nack => {
                return Err(StreamError::InvalidHeader("not a control packet"));
            }
        })
    }
}

// ── Packet ───────────────────────────────────────────────────────

/// A parsed datagram. Media payloads borrow from the receive buffer.
#[derive(Debug, Clone, PartialEq)]
pub enum Packet<'a> {
    Video(FragmentHeader, &'a [u8]),
    Audio(AudioHeader, &'a [u8]),
    Nack(Vec<u16>),
    Control(ControlMessage),
}

impl<'a> Packet<'a> {
    pub fn parse(datagram: &'a [u8]) -> Result<Self, StreamError> {
        match PacketType::peek(datagram)? {
            PacketType::Video => {
                let (header, payload) = FragmentHeader::decode(datagram)?;
                Ok(Packet::Video(header, payload))
            }
            PacketType::Audio => {
                let (header, payload) = AudioHeader::decode(datagram)?;
                Ok(Packet::Audio(header, payload))
            }
            PacketType::Nack => Ok(Packet::Nack(decode_nack(datagram)?)),
            kind => Ok(Packet::Control(ControlMessage::decode(kind, &datagram[1..])?)),
        }
    }
}
