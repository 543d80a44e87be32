//! Session bootstrap handed to [`Viewer::new`](super::Viewer::new).

use std::fmt;
use std::net::{SocketAddr, UdpSocket};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::audio::AudioConfig;
use crate::encoder::QualityPreset;
use crate::error::StreamError;
use crate::stats::ViewerStats;
use crate::transport::{JitterConfig, NackConfig};
use crate::types::{Codec, SurfaceHandle};
use crate::viewer::state::{ConnectionState, ReconnectConfig};

/// Parameters negotiated by the signaling layer before media flows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionParams {
    pub session_id: String,
    pub codec: Codec,
    pub width: u32,
    pub height: u32,
    /// Host frame rate, used as the media clock for jitter measurement.
    pub fps: u32,
    pub peer_addr: SocketAddr,
    /// DTLS certificate fingerprint of the host, for logging and
    /// re-verification by the embedding application.
    pub fingerprint: String,
    pub quality: QualityPreset,
    pub jitter: JitterConfig,
    pub nack: NackConfig,
    pub reconnect: ReconnectConfig,
    pub audio: AudioConfig,
    pub stats_interval_ms: u64,
    /// Minimum spacing between two keyframe requests.
    pub keyframe_request_interval_ms: u64,
    /// Socket read timeout of the receive thread.
    pub recv_timeout_ms: u64,
}

impl Default for SessionParams {
    fn default() -> Self {
        Self {
            session_id: String::new(),
            codec: Codec::Screen,
            width: 1920,
            height: 1080,
            fps: 60,
            peer_addr: SocketAddr::from(([127, 0, 0, 1], 9000)),
            fingerprint: String::new(),
            quality: QualityPreset::default(),
            jitter: JitterConfig::default(),
            nack: NackConfig::default(),
            reconnect: ReconnectConfig::default(),
            audio: AudioConfig::default(),
            stats_interval_ms: 1000,
            keyframe_request_interval_ms: 250,
            recv_timeout_ms: 20,
        }
    }
}

impl SessionParams {
    pub fn validate(&self) -> Result<(), StreamError> {
        if self.width == 0 || self.height == 0 {
            return Err(StreamError::InvalidConfig(format!(
                "session size {}x{}",
                self.width, self.height
            )));
        }
        if self.fps == 0 {
            return Err(StreamError::InvalidConfig("session fps must be non-zero".into()));
        }
        if self.stats_interval_ms == 0 || self.recv_timeout_ms == 0 {
            return Err(StreamError::InvalidConfig(
                "stats interval and receive timeout must be non-zero".into(),
            ));
        }
        self.jitter.validate()?;
        if self.nack.max_nacks_per_check == 0 {
            return Err(StreamError::InvalidConfig("max_nacks_per_check must be non-zero".into()));
        }
        Ok(())
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_millis(self.stats_interval_ms)
    }

    pub fn keyframe_request_interval(&self) -> Duration {
        Duration::from_millis(self.keyframe_request_interval_ms)
    }

    pub fn recv_timeout(&self) -> Duration {
        Duration::from_millis(self.recv_timeout_ms)
    }

    pub fn frame_interval(&self) -> Duration {
        Duration::from_secs(1) / self.fps.max(1)
    }
}

/// Everything a viewer session needs.
#[derive(Debug)]
pub struct ViewerConfig {
    pub session: SessionParams,
    /// Media socket, already connected through the peer layer.
    pub socket: UdpSocket,
    /// Native window to present into; `None` for headless.
    pub surface: Option<SurfaceHandle>,
}

// ── Callbacks ────────────────────────────────────────────────────

type StatsCallback = Arc<dyn Fn(&ViewerStats) + Send + Sync>;
type AttemptCallback = Arc<dyn Fn(u32) + Send + Sync>;
type StateCallback = Arc<dyn Fn(ConnectionState) + Send + Sync>;
type DisconnectCallback = Arc<dyn Fn() + Send + Sync>;

/// Hooks into the embedding application. All are invoked from viewer
/// threads and must not block.
#[derive(Clone, Default)]
pub struct ViewerCallbacks {
    pub(crate) on_stats: Option<StatsCallback>,
    pub(crate) on_reconnect_needed: Option<AttemptCallback>,
    pub(crate) on_state_change: Option<StateCallback>,
    pub(crate) on_disconnected: Option<DisconnectCallback>,
}

impl ViewerCallbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_stats(mut self, f: impl Fn(&ViewerStats) + Send + Sync + 'static) -> Self {
        self.on_stats = Some(Arc::new(f));
        self
    }

    /// Called with the 1-based attempt number each time a new transport
    /// is needed.
    pub fn on_reconnect_needed(mut self, f: impl Fn(u32) + Send + Sync + 'static) -> Self {
        self.on_reconnect_needed = Some(Arc::new(f));
        self
    }

    pub fn on_state_change(mut self, f: impl Fn(ConnectionState) + Send + Sync + 'static) -> Self {
        self.on_state_change = Some(Arc::new(f));
        self
    }

    /// Called exactly once when the session is given up.
    pub fn on_disconnected(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_disconnected = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for ViewerCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ViewerCallbacks")
            .field("on_stats", &self.on_stats.is_some())
            .field("on_reconnect_needed", &self.on_reconnect_needed.is_some())
            .field("on_state_change", &self.on_state_change.is_some())
            .field("on_disconnected", &self.on_disconnected.is_some())
            .finish()
    }
}
