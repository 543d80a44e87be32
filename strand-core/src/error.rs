//! Domain-specific error types for the Strand streaming engine.
//!
//! All fallible operations return `Result<T, StreamError>`.
//! Malformed wire input never panics: every failure is typed and the
//! calling pipeline stage decides whether to drop the unit of work or
//! abort the session.

use std::time::Duration;
use thiserror::Error;

use crate::types::Codec;

/// The canonical error type for the streaming engine.
#[derive(Debug, Error)]
pub enum StreamError {
    // ── Wire Errors ──────────────────────────────────────────────
    /// A datagram was shorter than its fixed header.
    #[error("packet too short: expected at least {expected} bytes, got {actual}")]
    PacketTooShort { expected: usize, actual: usize },

    /// The leading type byte is not a known packet type.
    #[error("unknown packet type: {0:#04x}")]
    UnknownPacketType(u8),

    /// A field in a wire header is out of range.
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),

    /// A numeric value did not map to any known enum variant.
    #[error("unknown {type_name} discriminant: {value:#x}")]
    UnknownVariant { type_name: &'static str, value: u64 },

    /// An encoded frame would need more fragments than the header can count.
    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    // ── Transport Errors ─────────────────────────────────────────
    /// The socket layer reported an error.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// An operation exceeded its deadline.
    #[error("timeout after {0:?}")]
    Timeout(Duration),

    /// Peer connection establishment failed.
    #[error("peer connection failed: {0}")]
    Peer(String),

    // ── Pipeline Errors ──────────────────────────────────────────
    /// A capture backend could not be created or lost its output.
    #[error("capture error: {0}")]
    Capture(String),

    /// The captured output changed size; the backend must be reopened.
    #[error("capture resolution changed from {from:?} to {to:?}")]
    ResolutionChanged { from: (u32, u32), to: (u32, u32) },

    /// An encoder failed to open or to encode.
    #[error("encoder error: {0}")]
    Encoder(String),

    /// A decoder failed to open or to decode.
    #[error("decoder error: {0}")]
    Decoder(String),

    /// The decoder cannot continue until it sees a keyframe.
    #[error("decoder needs a keyframe")]
    NeedKeyframe,

    /// The renderer could not present a frame.
    #[error("render error: {0}")]
    Render(String),

    /// The audio path failed.
    #[error("audio error: {0}")]
    Audio(String),

    /// No backend on this machine handles the requested codec.
    #[error("codec {0} is not supported by any available backend")]
    UnsupportedCodec(Codec),

    /// The feature is not available on this platform / build.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// A configuration value was rejected.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Session Errors ───────────────────────────────────────────
    /// The session is in a state that does not allow the operation.
    #[error("invalid session state: {0}")]
    InvalidState(&'static str),

    // ── Serialization Errors ─────────────────────────────────────
    /// Encoding or decoding of a control payload failed.
    #[error("encoding error: {0}")]
    Encoding(String),
}

// ── Convenient From implementations ──────────────────────────────

impl From<Box<bincode::ErrorKind>> for StreamError {
    fn from(e: Box<bincode::ErrorKind>) -> Self {
        StreamError::Encoding(e.to_string())
    }
}

impl StreamError {
    /// Whether the error only affects the current unit of work
    /// (a frame or packet) and the pipeline should carry on.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            StreamError::Timeout(_)
                | StreamError::NeedKeyframe
                | StreamError::PacketTooShort { .. }
                | StreamError::UnknownPacketType(_)
                | StreamError::InvalidHeader(_)
                | StreamError::Encoding(_)
        )
    }
}
