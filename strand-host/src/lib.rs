//! # strand-host — reference streaming host
//!
//! Captures the local display, encodes it with the best available
//! backend and streams it over UDP to one viewer. Answers NACKs from a
//! retransmit buffer, honours keyframe requests, adapts bitrate from
//! viewer loss reports and replays viewer input.
//!
//! The viewer is found by its first probe or ping unless the config pins
//! a peer address.

pub mod config;
pub mod service;
