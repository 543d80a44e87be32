//! Host-side adaptive bitrate driven by viewer loss reports.
//!
//! Loss is smoothed with an EMA; above `decrease_threshold` the target is
//! cut by `decrease_factor`, below `increase_threshold` it grows by
//! `increase_factor`, always clamped to the encoder's bounds.

use serde::{Deserialize, Serialize};
use tracing::info;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AbrConfig {
    pub enabled: bool,
    /// Weight of the previous EMA value.
    pub ema_weight: f64,
    pub decrease_threshold: f64,
    pub increase_threshold: f64,
    pub decrease_factor: f64,
    pub increase_factor: f64,
}

impl Default for AbrConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            ema_weight: 0.7,
            decrease_threshold: 0.05,
            increase_threshold: 0.01,
            decrease_factor: 0.7,
            increase_factor: 1.2,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AbrController {
    config: AbrConfig,
    current_kbps: u32,
    min_kbps: u32,
    max_kbps: u32,
    loss_ema: f64,
}

impl AbrController {
    pub fn new(config: AbrConfig, initial_kbps: u32, min_kbps: u32, max_kbps: u32) -> Self {
        Self {
            config,
            current_kbps: initial_kbps.clamp(min_kbps, max_kbps),
            min_kbps,
            max_kbps,
            loss_ema: 0.0,
        }
    }

    pub fn current_kbps(&self) -> u32 {
        self.current_kbps
    }

    pub fn loss_ema(&self) -> f64 {
        self.loss_ema
    }

    /// Feed one loss report; returns the new target when it changed.
    pub fn on_loss(&mut self, loss_fraction: f64) -> Option<u32> {
        let w = self.config.ema_weight;
        self.loss_ema = self.loss_ema * w + loss_fraction.clamp(0.0, 1.0) * (1.0 - w);
        if !self.config.enabled {
            return None;
        }

        let scaled = |factor: f64| (self.current_kbps as f64 * factor).round() as u32;
        let next = if self.loss_ema > self.config.decrease_threshold {
            scaled(self.config.decrease_factor).max(self.min_kbps)
        } else if self.loss_ema < self.config.increase_threshold {
            scaled(self.config.increase_factor).min(self.max_kbps)
        } else {
            self.current_kbps
        };

        if next == self.current_kbps {
            return None;
        }
        info!(
            old = self.current_kbps,
            new = next,
            loss_pct = format!("{:.1}", self.loss_ema * 100.0),
            "adaptive bitrate adjustment"
        );
        self.current_kbps = next;
        Some(next)
    }
}
