//! # strand-viewer — stream viewer application
//!
//! Negotiates a path to `strand-host`, hands the socket to the engine's
//! [`strand_core::Viewer`], and drives reconnects when the engine asks
//! for a new transport. On Windows the stream is presented in a native
//! window and local input is forwarded; elsewhere it runs headless.

pub mod config;
pub mod connect;
pub mod input;
pub mod window;
