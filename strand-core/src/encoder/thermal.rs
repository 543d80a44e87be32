//! SoC thermal and power-mode readouts for embedded hosts.
//!
//! Jetson-class boards throttle the video engine when hot or in a
//! low-power nvpmodel mode. The V4L2 encoder polls a [`ThermalMonitor`]
//! and lets a [`ThermalPolicy`] scale its bitrate accordingly.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// One sample of the board's thermal state.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ThermalReading {
    /// Hottest thermal zone, in °C.
    pub max_temp_c: Option<f32>,
    /// Active nvpmodel power mode id.
    pub power_mode: Option<u32>,
}

/// Reads `sys/class/thermal/thermal_zone*/temp` and the nvpmodel status
/// file below a root directory (`/` on a real board).
#[derive(Debug, Clone)]
pub struct ThermalMonitor {
    root: PathBuf,
}

impl ThermalMonitor {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Monitor rooted at `/`.
    pub fn system() -> Self {
        Self::new("/")
    }

    pub fn read(&self) -> ThermalReading {
        ThermalReading {
            max_temp_c: self.max_zone_temp(),
            power_mode: self.power_mode(),
        }
    }

    fn max_zone_temp(&self) -> Option<f32> {
        let dir = self.root.join("sys/class/thermal");
        let entries = fs::read_dir(&dir).ok()?;
        entries
            .flatten()
            .filter(|e| e.file_name().to_string_lossy().starts_with("thermal_zone"))
            .filter_map(|e| read_millidegrees(&e.path().join("temp")))
            .reduce(f32::max)
    }

    /// nvpmodel records the active mode as `pmode:NNNN`.
    fn power_mode(&self) -> Option<u32> {
        let status = fs::read_to_string(self.root.join("var/lib/nvpmodel/status")).ok()?;
        status
            .lines()
            .find_map(|line| line.trim().strip_prefix("pmode:"))
            .and_then(|id| id.trim().parse().ok())
    }
}

fn read_millidegrees(path: &Path) -> Option<f32> {
    let raw = fs::read_to_string(path).ok()?;
    match raw.trim().parse::<i64>() {
        Ok(milli) => Some(milli as f32 / 1000.0),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "unreadable thermal zone");
            None
        }
    }
}

// ── Policy ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThermalState {
    Normal,
    Throttled,
    Critical,
}

/// Maps thermal readings to a bitrate scale.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThermalPolicy {
    pub throttle_temp_c: f32,
    pub critical_temp_c: f32,
    pub throttled_scale: f32,
    pub critical_scale: f32,
    /// nvpmodel ids considered low-power.
    pub low_power_modes: Vec<u32>,
    /// Bitrate ceiling while in a low-power mode.
    pub low_power_cap_kbps: u32,
}

impl Default for ThermalPolicy {
    fn default() -> Self {
        Self {
            throttle_temp_c: 75.0,
            critical_temp_c: 90.0,
            throttled_scale: 0.75,
            critical_scale: 0.5,
            low_power_modes: vec![1],
            low_power_cap_kbps: 8_000,
        }
    }
}

impl ThermalPolicy {
    pub fn state(&self, reading: &ThermalReading) -> ThermalState {
        match reading.max_temp_c {
            Some(t) if t >= self.critical_temp_c => ThermalState::Critical,
            Some(t) if t >= self.throttle_temp_c => ThermalState::Throttled,
            _ => ThermalState::Normal,
        }
    }

    /// Bitrate to actually apply given a requested target.
    pub fn effective_bitrate(&self, target_kbps: u32, reading: &ThermalReading) -> u32 {
        let scale = match self.state(reading) {
            ThermalState::Normal => 1.0,
            ThermalState::Throttled => self.throttled_scale,
            ThermalState::Critical => self.critical_scale,
        };
        let mut kbps = (target_kbps as f32 * scale) as u32;
        if reading
            .power_mode
            .is_some_and(|m| self.low_power_modes.contains(&m))
        {
            kbps = kbps.min(self.low_power_cap_kbps);
        }
        kbps
    }

    /// Whether the reading causes any reduction.
    pub fn is_throttled(&self, target_kbps: u32, reading: &ThermalReading) -> bool {
        self.effective_bitrate(target_kbps, reading) < target_kbps
    }
}
