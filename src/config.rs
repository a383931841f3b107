use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use crate::db::lock::RetryPolicy;
use crate::db::models::sport_key;
use crate::engine::calibration::CalibrationConfig;
use crate::engine::decay::DecayConfig;
use crate::engine::stake::StakeConfig;
use crate::engine::weights::WeightConfig;
use crate::market::{AggregatorConfig, DivergenceConfig};

/// Sports prediction engine with multi-book consensus and Kelly staking
#[derive(Parser, Debug, Clone)]
#[command(name = "edge-engine", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "edge.db", global = true)]
    pub database_path: String,

    /// Bankroll used for stake recommendations (units)
    #[arg(long, env = "BANKROLL", default_value = "1000.0", global = true)]
    pub bankroll: f64,

    /// Hard ceiling on the Kelly fraction (0.0–1.0)
    #[arg(long, env = "KELLY_CAP", default_value = "0.25", global = true)]
    pub kelly_cap: f64,

    /// Fractional Kelly multiplier applied before the cap (0.0–1.0)
    #[arg(long, env = "KELLY_MULTIPLIER", default_value = "1.0", global = true)]
    pub kelly_multiplier: f64,

    /// Minimum edge required to recommend a stake (e.g. 0.02 = 2%)
    #[arg(long, env = "MIN_EDGE", default_value = "0.02", global = true)]
    pub min_edge: f64,

    /// Per-outcome weight nudge (0.1 = ±10%)
    #[arg(long, env = "LEARNING_RATE", default_value = "0.1", global = true)]
    pub learning_rate: f64,

    /// Floor for a method weight before renormalisation
    #[arg(long, env = "MIN_METHOD_WEIGHT", default_value = "0.01", global = true)]
    pub min_method_weight: f64,

    /// Decay rate overrides, e.g. "nfl=0.15,mlb=0.3"
    #[arg(
        long,
        env = "DECAY_RATES",
        value_delimiter = ',',
        value_parser = parse_key_value,
        global = true
    )]
    pub decay_rates: Vec<(String, f64)>,

    /// Decay rate for sports without an override
    #[arg(long, env = "DEFAULT_DECAY_RATE", default_value = "0.2", global = true)]
    pub default_decay_rate: f64,

    /// Quotes older than this (vs. the newest quote) are stale
    #[arg(long, env = "STALENESS_SECS", default_value = "86400", global = true)]
    pub staleness_secs: u64,

    /// Per-source staleness in seconds, e.g. "pinnacle=3600,draftkings=7200"
    #[arg(
        long,
        env = "SOURCE_STALENESS",
        value_delimiter = ',',
        value_parser = parse_key_value,
        global = true
    )]
    pub source_staleness: Vec<(String, f64)>,

    /// Public/sharp gap (percentage points) that counts as divergence
    #[arg(long, env = "DIVERGENCE_THRESHOLD", default_value = "20.0", global = true)]
    pub divergence_threshold: f64,

    /// Line movement below this (points) counts as frozen
    #[arg(long, env = "FROZEN_LINE_THRESHOLD", default_value = "0.5", global = true)]
    pub frozen_line_threshold: f64,

    /// Public share at or above this counts as heavy public action
    #[arg(long, env = "HEAVY_PUBLIC_PCT", default_value = "60.0", global = true)]
    pub heavy_public_pct: f64,

    /// Line movement at or above this (points) counts as steam
    #[arg(long, env = "STEAM_THRESHOLD", default_value = "1.5", global = true)]
    pub steam_threshold: f64,

    /// Enable per-sport probability calibration
    #[arg(
        long,
        env = "CALIBRATION_ENABLED",
        default_value = "true",
        action = clap::ArgAction::Set,
        global = true
    )]
    pub calibration_enabled: bool,

    /// Resolved predictions needed before a sport is calibrated
    #[arg(long, env = "CALIBRATION_MIN_SAMPLES", default_value = "50", global = true)]
    pub calibration_min_samples: usize,

    #[arg(long, env = "CALIBRATION_MAX_ITERS", default_value = "50", global = true)]
    pub calibration_max_iters: usize,

    /// Newton convergence threshold on the scaler parameters
    #[arg(long, env = "CALIBRATION_TOLERANCE", default_value = "1e-8", global = true)]
    pub calibration_tolerance: f64,

    #[arg(long, env = "CALIBRATION_L2", default_value = "0.001", global = true)]
    pub calibration_l2: f64,

    /// Relative log-loss or Brier improvement needed to promote a refit
    #[arg(long, env = "CALIBRATION_MIN_IMPROVEMENT", default_value = "0.01", global = true)]
    pub calibration_min_improvement: f64,

    /// Attempts before a contended write gives up
    #[arg(long, env = "LOCK_MAX_ATTEMPTS", default_value = "5", global = true)]
    pub lock_max_attempts: u32,

    /// Base backoff between lock attempts (ms)
    #[arg(long, env = "LOCK_BACKOFF_MS", default_value = "10", global = true)]
    pub lock_backoff_ms: u64,

    /// Lease lifetime for row locks (s)
    #[arg(long, env = "LOCK_TTL_SECS", default_value = "30", global = true)]
    pub lock_ttl_secs: u64,

    /// Webhook that receives recommendation alerts as JSON
    #[arg(long, env = "ALERT_WEBHOOK_URL", global = true)]
    pub alert_webhook_url: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Ingest one odds quote (or a JSON array of quotes) and print the consensus
    IngestQuote {
        /// JSON file with the quote(s)
        file: PathBuf,
    },
    /// Record final scores (one result or a JSON array)
    RecordResult { file: PathBuf },
    /// Score an event and print the prediction with its stake
    Predict {
        /// JSON file with the event
        file: PathBuf,
        /// Override the configured bankroll
        #[arg(long)]
        stake_bankroll: Option<f64>,
    },
    /// Resolve finished events and update method weights
    Learn {
        #[arg(long)]
        sport: Option<String>,
    },
    /// Print an event's consensus line and movement history
    Consensus { event_id: String },
    /// Print method weights and performance for a sport
    Weights { sport: String },
    /// Classify public vs. sharp money for a market
    Divergence {
        public_pct: f64,
        sharp_pct: f64,
        /// Line movement in points; read from the event's history when omitted
        #[arg(long, allow_hyphen_values = true)]
        line_movement: Option<f64>,
        #[arg(long)]
        event_id: Option<String>,
    },
    /// Recommend a stake for a stored prediction
    Stake {
        prediction_id: i64,
        #[arg(long)]
        stake_bankroll: Option<f64>,
    },
    /// Prediction counts and recent records
    Stats {
        #[arg(long)]
        sport: Option<String>,
        #[arg(long, default_value = "20")]
        limit: i64,
    },
}

/// Parse `key=value` with a numeric value.
fn parse_key_value(s: &str) -> Result<(String, f64), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    let key = key.trim();
    if key.is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid number in '{}': {}", s, e))?;
    Ok((key.to_string(), value))
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(0.0..=1.0).contains(&self.kelly_cap) {
            anyhow::bail!("kelly_cap must be between 0.0 and 1.0");
        }
        if !(0.0..=1.0).contains(&self.kelly_multiplier) {
            anyhow::bail!("kelly_multiplier must be between 0.0 and 1.0");
        }
        if !(0.0..1.0).contains(&self.min_edge) {
            anyhow::bail!("min_edge must be in [0.0, 1.0)");
        }
        if !(self.learning_rate > 0.0 && self.learning_rate < 1.0) {
            anyhow::bail!("learning_rate must be in (0.0, 1.0)");
        }
        if !(self.min_method_weight > 0.0 && self.min_method_weight < 1.0) {
            anyhow::bail!("min_method_weight must be in (0.0, 1.0)");
        }
        if self.bankroll < 0.0 || !self.bankroll.is_finite() {
            anyhow::bail!("bankroll must be a non-negative number");
        }
        if self.default_decay_rate < 0.0 {
            anyhow::bail!("default_decay_rate must be non-negative");
        }
        if let Some((sport, _)) = self.decay_rates.iter().find(|(_, r)| *r < 0.0 || !r.is_finite()) {
            anyhow::bail!("decay rate for {} must be non-negative", sport);
        }
        if self.staleness_secs == 0 {
            anyhow::bail!("staleness_secs must be positive");
        }
        if let Some((source, _)) = self.source_staleness.iter().find(|(_, s)| *s <= 0.0 || !s.is_finite()) {
            anyhow::bail!("staleness for {} must be positive", source);
        }
        if self.lock_max_attempts == 0 {
            anyhow::bail!("lock_max_attempts must be at least 1");
        }
        if self.lock_ttl_secs == 0 {
            anyhow::bail!("lock_ttl_secs must be positive");
        }
        if !(self.calibration_tolerance > 0.0) {
            anyhow::bail!("calibration_tolerance must be positive");
        }
        if self.calibration_min_samples < 8 {
            anyhow::bail!("calibration_min_samples must be at least 8");
        }
        Ok(())
    }

    pub fn decay_config(&self) -> DecayConfig {
        let mut config = DecayConfig {
            default_rate: self.default_decay_rate,
            ..DecayConfig::default()
        };
        for (sport, rate) in &self.decay_rates {
            config.rates.insert(sport_key(sport), *rate);
        }
        config
    }

    pub fn aggregator_config(&self) -> AggregatorConfig {
        let source_staleness: HashMap<String, Duration> = self
            .source_staleness
            .iter()
            .map(|(source, secs)| (source.trim().to_lowercase(), Duration::from_secs_f64(*secs)))
            .collect();
        AggregatorConfig {
            default_staleness: Duration::from_secs(self.staleness_secs),
            source_staleness,
        }
    }

    pub fn divergence_config(&self) -> DivergenceConfig {
        DivergenceConfig {
            divergence_threshold: self.divergence_threshold,
            frozen_line_threshold: self.frozen_line_threshold,
            heavy_public_pct: self.heavy_public_pct,
            steam_threshold: self.steam_threshold,
        }
    }

    pub fn weight_config(&self) -> WeightConfig {
        WeightConfig {
            learning_rate: self.learning_rate,
            min_weight: self.min_method_weight,
        }
    }

    pub fn stake_config(&self) -> StakeConfig {
        StakeConfig {
            cap: self.kelly_cap,
            multiplier: self.kelly_multiplier,
            min_edge: self.min_edge,
        }
    }

    pub fn calibration_config(&self) -> CalibrationConfig {
        CalibrationConfig {
            enabled: self.calibration_enabled,
            min_samples: self.calibration_min_samples,
            max_iters: self.calibration_max_iters,
            tolerance: self.calibration_tolerance,
            l2: self.calibration_l2,
            min_relative_improvement: self.calibration_min_improvement,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.lock_max_attempts,
            base_backoff: Duration::from_millis(self.lock_backoff_ms),
            lease_ttl: Duration::from_secs(self.lock_ttl_secs),
            ..RetryPolicy::default()
        }
    }
}
