//! Public-vs-sharp money divergence.
//!
//! When the betting public and sharp money disagree strongly and the line
//! does not move despite lopsided public action, books are absorbing the
//! public side without adjusting: sharp resistance, a contrarian signal.
//! The thresholds are tunables, not established market facts.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DivergenceConfig {
    /// Percentage-point gap between public and sharp share that counts as divergence
    pub divergence_threshold: f64,
    /// |line movement| below this (points) means the line is frozen
    pub frozen_line_threshold: f64,
    /// Public share at or above this counts as heavy public action
    pub heavy_public_pct: f64,
    /// |line movement| at or above this (points) counts as steam
    pub steam_threshold: f64,
}

impl Default for DivergenceConfig {
    fn default() -> Self {
        Self {
            divergence_threshold: 20.0,
            frozen_line_threshold: 0.5,
            heavy_public_pct: 60.0,
            steam_threshold: 1.5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MarketSignal {
    Neutral,
    /// Public and sharp disagree, line moving normally
    PublicSharpSplit,
    /// Heavy public action, divergent sharps, frozen line
    SharpResistance,
    /// Divergent sharps and the line is moving hard
    SharpSteam,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct DivergenceReport {
    pub divergence: f64,
    pub is_line_frozen: bool,
    pub signal: MarketSignal,
}

impl DivergenceReport {
    pub fn is_contrarian(&self) -> bool {
        self.signal == MarketSignal::SharpResistance
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DivergenceDetector {
    config: DivergenceConfig,
}

impl DivergenceDetector {
    pub fn new(config: DivergenceConfig) -> Self {
        DivergenceDetector { config }
    }

    /// Classify one market.
    ///
    /// * `public_pct`    – share of tickets on a side, 0–100.
    /// * `sharp_pct`     – share of money (or sharp-tagged action) on the same side, 0–100.
    /// * `line_movement` – points the line moved since open (sign ignored).
    pub fn compare(&self, public_pct: f64, sharp_pct: f64, line_movement: f64) -> DivergenceReport {
        let divergence = (public_pct - sharp_pct).abs();
        let movement = line_movement.abs();
        let is_line_frozen = movement < self.config.frozen_line_threshold;
        let divergent = divergence > self.config.divergence_threshold;

        let signal = if !divergent {
            MarketSignal::Neutral
        } else if is_line_frozen && public_pct >= self.config.heavy_public_pct {
            MarketSignal::SharpResistance
        } else if movement >= self.config.steam_threshold {
            MarketSignal::SharpSteam
        } else {
            MarketSignal::PublicSharpSplit
        };

        DivergenceReport {
            divergence,
            is_line_frozen,
            signal,
        }
    }
}
