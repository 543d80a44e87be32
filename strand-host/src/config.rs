//! Configuration for the host service.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strand_core::encoder::EncoderKind;
use strand_core::protocol::DEFAULT_MTU;
use strand_core::{AbrConfig, CaptureConfig, EncoderConfig};

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// Encoder backend to try first; probing order otherwise.
    pub encoder_backend: Option<EncoderKind>,
    /// Replay viewer input on this machine.
    pub inject_input: bool,
    /// Media socket settings.
    pub network: NetworkConfig,
    /// Display capture backend.
    pub capture: CaptureConfig,
    /// Encoder session; width/height are replaced by the capture size.
    pub encoder: EncoderConfig,
    /// Adaptive bitrate driven by viewer stats.
    pub abr: AbrConfig,
    /// Logging settings.
    pub logging: LoggingConfig,
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// UDP address to bind for the media session.
    pub listen_addr: SocketAddr,
    /// Viewer address. When unset the first viewer to probe or ping the
    /// host becomes the peer.
    pub peer: Option<SocketAddr>,
    /// Largest datagram sent.
    pub mtu: usize,
    /// Sent fragments kept for NACK retransmission.
    pub retransmit_capacity: usize,
    /// Period of HOST_STATS and PING messages.
    pub host_stats_interval_ms: u64,
    /// Capture wait per loop iteration.
    pub capture_timeout_ms: u64,
}

/// Logging settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error".
    pub level: String,
}

// ── Defaults ─────────────────────────────────────────────────────

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            peer: None,
            mtu: DEFAULT_MTU,
            retransmit_capacity: 4096,
            host_stats_interval_ms: 1000,
            capture_timeout_ms: 50,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
        }
    }
}

// ── Loading ──────────────────────────────────────────────────────

impl HostConfig {
    /// Load configuration from a TOML file, falling back to defaults.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(contents) => toml::from_str(&contents).unwrap_or_else(|e| {
                tracing::warn!("invalid config {}: {e}; using defaults", path.display());
                Self::default()
            }),
            Err(_) => {
                tracing::info!("no config at {}; using defaults", path.display());
                Self::default()
            }
        }
    }

    pub fn host_stats_interval(&self) -> Duration {
        Duration::from_millis(self.network.host_stats_interval_ms.max(1))
    }

    pub fn capture_timeout(&self) -> Duration {
        Duration::from_millis(self.network.capture_timeout_ms)
    }

    /// Encoder settings for a capture source of `width` x `height`.
    pub fn encoder_for(&self, width: u32, height: u32) -> EncoderConfig {
        EncoderConfig {
            width,
            height,
            ..self.encoder.clone()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::CaptureKind;

    #[test]
    fn default_config_serializes() {
        let cfg = HostConfig::default();
        let text = toml::to_string_pretty(&cfg).unwrap();
        assert!(text.contains("listen_addr"));
        assert!(text.contains("bitrate_kbps"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: HostConfig = toml::from_str(
            r#"
            inject_input = true

            [capture]
            kind = "synthetic"

            [encoder]
            bitrate_kbps = 8000
            "#,
        )
        .unwrap();
        assert!(cfg.inject_input);
        assert_eq!(cfg.capture.kind, CaptureKind::Synthetic);
        assert_eq!(cfg.encoder.bitrate_kbps, 8000);
        assert_eq!(cfg.encoder.fps, 60);
        assert_eq!(cfg.network.mtu, DEFAULT_MTU);
    }

    #[test]
    fn encoder_takes_capture_size() {
        let cfg = HostConfig::default();
        let enc = cfg.encoder_for(800, 600);
        assert_eq!((enc.width, enc.height), (800, 600));
        assert_eq!(enc.bitrate_kbps, cfg.encoder.bitrate_kbps);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let cfg = HostConfig::load(Path::new("/nonexistent/strand-host.toml"));
        assert_eq!(cfg.network.retransmit_capacity, 4096);
    }
}
