//! Kelly Criterion stake sizing.
//!
//! The Kelly formula sizes a bet to maximise the expected logarithm of
//! wealth:
//!   f* = (p·(b + 1) − 1) / b
//! where
//!   p = probability the selection wins (0.5 + edge)
//!   b = net decimal odds (decimal − 1), profit per unit staked
//!
//! The result is clamped to `[0, cap]`; the default cap of 0.25 is the usual
//! quarter-Kelly safety margin against model error.

use serde::{Deserialize, Serialize};

use crate::db::models::{PredictionRecord, Side};

/// Unclamped Kelly fraction; 0 for degenerate odds.
fn raw_kelly(edge: f64, decimal_odds: f64) -> f64 {
    let b = decimal_odds - 1.0;
    if !b.is_finite() || b <= 0.0 || !edge.is_finite() {
        return 0.0;
    }
    let p = 0.5 + edge;
    (p * (b + 1.0) - 1.0) / b
}

/// Fraction of bankroll to stake for a selection with `edge` at
/// `decimal_odds`, clamped to `[0, cap]`.
pub fn kelly_fraction(edge: f64, decimal_odds: f64, cap: f64) -> f64 {
    clamp_to_cap(raw_kelly(edge, decimal_odds), cap)
}

fn clamp_to_cap(f: f64, cap: f64) -> f64 {
    let cap = if cap.is_finite() { cap.clamp(0.0, 1.0) } else { 0.0 };
    if f.is_finite() {
        f.clamp(0.0, cap)
    } else {
        0.0
    }
}

/// Whole-unit stake for a bankroll.
pub fn stake_amount(bankroll: f64, fraction: f64) -> f64 {
    if !bankroll.is_finite() || bankroll <= 0.0 {
        return 0.0;
    }
    (bankroll * fraction).round()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StakeConfig {
    /// Hard ceiling on the bankroll fraction
    pub cap: f64,
    /// Fractional Kelly multiplier applied before the cap
    pub multiplier: f64,
    /// Predictions with less edge than this get no stake
    pub min_edge: f64,
}

impl Default for StakeConfig {
    fn default() -> Self {
        Self {
            cap: 0.25,
            multiplier: 1.0,
            min_edge: 0.02,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StakeRecommendation {
    pub prediction_id: Option<i64>,
    pub side: Side,
    pub edge: f64,
    pub decimal_odds: f64,
    pub fraction: f64,
    pub stake: f64,
    pub bankroll: f64,
    pub cap: f64,
}

impl StakeRecommendation {
    pub fn is_bet(&self) -> bool {
        self.stake > 0.0
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StakeOptimizer {
    config: StakeConfig,
}

impl StakeOptimizer {
    pub fn new(config: StakeConfig) -> Self {
        StakeOptimizer { config }
    }

    pub fn config(&self) -> &StakeConfig {
        &self.config
    }

    pub fn fraction(&self, edge: f64, decimal_odds: f64) -> f64 {
        if edge < self.config.min_edge {
            return 0.0;
        }
        let f = raw_kelly(edge, decimal_odds) * self.config.multiplier;
        clamp_to_cap(f, self.config.cap)
    }

    pub fn recommend(&self, prediction: &PredictionRecord, bankroll: f64) -> StakeRecommendation {
        let fraction = self.fraction(prediction.edge, prediction.decimal_odds);
        StakeRecommendation {
            prediction_id: prediction.id,
            side: prediction.side,
            edge: prediction.edge,
            decimal_odds: prediction.decimal_odds,
            fraction,
            stake: stake_amount(bankroll, fraction),
            bankroll,
            cap: self.config.cap,
        }
    }
}
