//! # strand-core
//!
//! Real-time desktop streaming engine shared by the host and viewer.
//!
//! This crate contains:
//! - **Capture**: `CaptureBackend` over DXGI duplication, the Linux framebuffer and a synthetic source
//! - **Encoders**: `VideoEncoder` over NVENC / V4L2 (GStreamer) and the software screen codec
//! - **Protocol**: datagram types, the 12-byte fragment header, NACK and control messages
//! - **Transport**: `JitterBuffer`, `NackTracker`, `RetransmitBuffer`, `SessionSocket`
//! - **Decoders / render**: `VideoDecoder`, `Renderer` (GDI or headless), YUV → BGRA conversion
//! - **Audio**: PCM / Opus decode into a `PlaybackRing` drained by cpal or a null clock
//! - **Input / stats / peer**: input events and injection, `ViewerStats` + ABR, UDP hole punching
//! - **Viewer**: the multi-threaded `Viewer` orchestrator and its reconnect state machine
//! - **Error**: `StreamError`, a `thiserror` hierarchy shared by every module

pub mod audio;
pub mod capture;
pub mod decoder;
pub mod encoder;
pub mod error;
pub mod flags;
pub mod input;
pub mod peer;
pub mod protocol;
pub mod render;
pub mod stats;
pub mod transport;
pub mod types;
pub mod viewer;

// ── Re-exports for ergonomic usage ───────────────────────────────

pub use audio::{AudioCodec, AudioConfig, AudioPlayer};
pub use capture::{CaptureBackend, CaptureConfig, CaptureKind};
pub use decoder::{DecodedFrame, VideoDecoder};
pub use encoder::{EncodedPacket, EncoderConfig, EncoderKind, EncoderTelemetry, QualityPreset, VideoEncoder};
pub use error::StreamError;
pub use flags::FragmentFlags;
pub use input::{InputEvent, InputInjector, InputSender, Viewport};
pub use peer::{Candidate, CandidateKind, ConnectResult, ConnectionType, PeerConnection};
pub use protocol::{ControlMessage, FragmentHeader, Packet, PacketType, Packetizer};
pub use render::Renderer;
pub use stats::{AbrConfig, AbrController, PipelineCounters, StatsReporter, ViewerStats};
pub use transport::{JitterBuffer, JitterConfig, NackConfig, NackTracker, RetransmitBuffer, SessionSocket};
pub use types::{CapturedFrame, Codec, PixelFormat, SurfaceHandle};
pub use viewer::{ConnectionState, SessionParams, Viewer, ViewerCallbacks, ViewerConfig};
