//! Recency discount for past signals.
//!
//! An event `d` days old keeps `exp(-λ·d)` of its impact, with λ set per
//! sport: daily-schedule sports (MLB, NBA) churn faster than weekly ones
//! (NFL), so their old news matters less. Structural effects (talent gaps,
//! venue/altitude) do not fade and always keep factor 1.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};

use crate::db::models::{sport_key, TemporalEvent};

/// Lower bound of the aggregate factor; one stale event cannot zero out the
/// whole adjustment.
pub const MIN_DECAY_FACTOR: f64 = 0.5;
pub const MAX_DECAY_FACTOR: f64 = 1.0;

#[derive(Debug, Clone)]
pub struct DecayConfig {
    /// λ per normalised sport key
    pub rates: HashMap<String, f64>,
    /// λ for sports with no entry
    pub default_rate: f64,
    /// Event types that never decay
    pub structural_kinds: HashSet<String>,
}

impl Default for DecayConfig {
    fn default() -> Self {
        let rates = [
            ("nfl", 0.15),
            ("nba", 0.25),
            ("mlb", 0.30),
            ("nhl", 0.25),
            ("ncaa", 0.20),
        ]
        .into_iter()
        .map(|(k, v)| (k.to_string(), v))
        .collect();
        let structural_kinds = ["structural", "talent_gap", "venue", "altitude"]
            .into_iter()
            .map(String::from)
            .collect();
        Self {
            rates,
            default_rate: 0.20,
            structural_kinds,
        }
    }
}

impl DecayConfig {
    pub fn rate_for(&self, sport: &str) -> f64 {
        self.rates
            .get(&sport_key(sport))
            .copied()
            .unwrap_or(self.default_rate)
    }

    pub fn is_structural(&self, kind: &str) -> bool {
        self.structural_kinds.contains(&kind.trim().to_lowercase())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DecayResult {
    pub original_impact: f64,
    pub decayed_impact: f64,
    /// sum(decayed) / sum(original), clamped to [0.5, 1.0]
    pub decay_factor: f64,
    pub per_event_decayed_impact: Vec<f64>,
}

impl DecayResult {
    pub fn neutral() -> Self {
        DecayResult {
            original_impact: 0.0,
            decayed_impact: 0.0,
            decay_factor: 1.0,
            per_event_decayed_impact: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TemporalDecayCalculator {
    config: DecayConfig,
}

impl TemporalDecayCalculator {
    pub fn new(config: DecayConfig) -> Self {
        TemporalDecayCalculator { config }
    }

    pub fn config(&self) -> &DecayConfig {
        &self.config
    }

    /// Multiplier kept by a single signal of `kind` that is `days_ago` old.
    pub fn factor(&self, kind: &str, days_ago: f64, sport: &str) -> f64 {
        if self.config.is_structural(kind) {
            return 1.0;
        }
        let lambda = self.config.rate_for(sport);
        (-lambda * days_ago.max(0.0)).exp()
    }

    pub fn calculate(&self, events: &[TemporalEvent], sport: &str) -> DecayResult {
        let per_event: Vec<f64> = events
            .iter()
            .map(|e| e.impact * self.factor(&e.kind, e.days_ago, sport))
            .collect();
        let original: f64 = events.iter().map(|e| e.impact).sum();
        let decayed: f64 = per_event.iter().sum();

        let decay_factor = if original == 0.0 {
            1.0
        } else {
            (decayed / original).clamp(MIN_DECAY_FACTOR, MAX_DECAY_FACTOR)
        };

        DecayResult {
            original_impact: original,
            decayed_impact: decayed,
            decay_factor,
            per_event_decayed_impact: per_event,
        }
    }
}
