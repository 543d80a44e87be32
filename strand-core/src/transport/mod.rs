//! Receive-side reassembly, loss recovery and socket plumbing.
//!
//! - [`jitter`]: reorders fragments into complete frames
//! - [`nack`]: detects gaps and schedules retransmission requests
//! - [`retransmit`]: host-side history that answers those requests
//! - [`socket`]: UDP setup and the hot-swappable session socket

pub mod jitter;
pub mod nack;
pub mod retransmit;
pub mod socket;

pub use jitter::{AssembledFrame, JitterBuffer, JitterConfig, JitterStats, PushOutcome, Rejection};
pub use nack::{NackConfig, NackStats, NackTracker};
pub use retransmit::RetransmitBuffer;
pub use socket::{SessionSocket, bind_udp};
