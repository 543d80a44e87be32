//! Viewer application configuration.

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use strand_core::SessionParams;

/// Top-level configuration loaded from a TOML file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewerAppConfig {
    /// Print every stats snapshot to stdout as one JSON line.
    pub stats_json: bool,
    /// Peer negotiation.
    pub network: NetworkConfig,
    /// Native window; ignored when headless.
    pub display: DisplayConfig,
    /// Session parameters handed to the engine. `peer_addr` is replaced
    /// by the negotiated address.
    pub session: SessionParams,
    /// Logging.
    pub logging: LoggingConfig,
}

/// Peer negotiation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Host media address, probed as a host candidate.
    pub host_address: SocketAddr,
    /// Local UDP address to bind.
    pub bind_address: SocketAddr,
    /// STUN servers for server-reflexive candidates.
    pub stun_servers: Vec<SocketAddr>,
    /// Probe phase timeout in milliseconds.
    pub connect_timeout_ms: u64,
}

/// Display settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DisplayConfig {
    /// Run without a window.
    pub headless: bool,
    /// Initial window width.
    pub width: u32,
    /// Initial window height.
    pub height: u32,
    /// Forward local mouse and keyboard to the host.
    pub forward_input: bool,
}

/// Logging.
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
            host_address: SocketAddr::from(([127, 0, 0, 1], 9000)),
            bind_address: SocketAddr::from(([0, 0, 0, 0], 0)),
            stun_servers: Vec::new(),
            connect_timeout_ms: 5000,
        }
    }
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            headless: !cfg!(target_os = "windows"),
            width: 1280,
            height: 720,
            forward_input: true,
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

impl ViewerAppConfig {
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

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.network.connect_timeout_ms)
    }

    /// Identity presented to the engine when a new path is adopted. Taken
    /// from configuration, never from the negotiated address, so it stays
    /// stable across reconnects.
    pub fn session_fingerprint(&self) -> &str {
        &self.session.fingerprint
    }

    /// Session parameters for a negotiated peer.
    pub fn session_for(&self, peer: SocketAddr) -> SessionParams {
        SessionParams {
            peer_addr: peer,
            ..self.session.clone()
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use strand_core::Codec;

    #[test]
    fn default_config_serializes() {
        let text = toml::to_string_pretty(&ViewerAppConfig::default()).unwrap();
        assert!(text.contains("host_address"));
        assert!(text.contains("[session.reconnect]"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let cfg: ViewerAppConfig = toml::from_str(
            r#"
            stats_json = true

            [network]
            host_address = "10.0.0.5:9000"

            [session]
            codec = "H264"
            width = 1280
            height = 720
            "#,
        )
        .unwrap();
        assert!(cfg.stats_json);
        assert_eq!(cfg.network.host_address, "10.0.0.5:9000".parse().unwrap());
        assert_eq!(cfg.session.codec, Codec::H264);
        assert_eq!(cfg.session.reconnect.max_attempts, 3);
        assert_eq!(cfg.network.connect_timeout_ms, 5000);
    }

    #[test]
    fn session_takes_negotiated_peer() {
        let cfg = ViewerAppConfig::default();
        let peer: SocketAddr = "192.0.2.1:4000".parse().unwrap();
        let session = cfg.session_for(peer);
        assert_eq!(session.peer_addr, peer);
        assert_eq!(session.width, cfg.session.width);
    }

    #[test]
    fn fingerprint_survives_a_new_peer_address() {
        let cfg: ViewerAppConfig = toml::from_str(
            r#"
            [session]
            fingerprint = "AB:CD:EF"
            "#,
        )
        .unwrap();
        let first = cfg.session_for("192.0.2.1:4000".parse().unwrap());
        let second = cfg.session_for("198.51.100.7:5000".parse().unwrap());
        assert_eq!(cfg.session_fingerprint(), "AB:CD:EF");
        assert_eq!(first.fingerprint, cfg.session_fingerprint());
        assert_eq!(second.fingerprint, cfg.session_fingerprint());
    }
}
