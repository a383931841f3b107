//! Per-sport method reliability weights.
//!
//! Online reinforcement, not Bayesian updating: after each resolved outcome
//! every contributing method's weight is scaled by
//! `1 + learning_rate · (2·accuracy − 1)` (so ±10 % at the default rate) and
//! the sport's table is renormalised to sum to 1. It is simple and hard to
//! destabilise, but it carries no calibration guarantee; a gradient or
//! Bayesian ensemble would be the principled replacement.

use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info};

use crate::db::lock::{RetryPolicy, RowLock};
use crate::db::models::{sport_key, MethodPerformance, MethodWeight};
use crate::db::Database;
use crate::error::{CoreError, Result};

/// Sum of a sport's weights must be within this of 1.
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-9;

#[derive(Debug, Clone, Copy)]
pub struct WeightConfig {
    pub learning_rate: f64,
    /// Floor applied before renormalisation so no method is ever silenced
    pub min_weight: f64,
}

impl Default for WeightConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.1,
            min_weight: 0.01,
        }
    }
}

/// How one method fared on a resolved prediction.
#[derive(Debug, Clone, PartialEq)]
pub struct MethodOutcome {
    pub method: String,
    /// Whether the method picked the winning side; `None` when there was no
    /// winner (draw), in which case the prediction-level accuracy is used.
    pub agreed: Option<bool>,
}

#[derive(Clone)]
pub struct MethodWeightTracker {
    db: Database,
    methods: Vec<String>,
    config: WeightConfig,
    retry: RetryPolicy,
}

impl MethodWeightTracker {
    pub fn new(db: Database, methods: Vec<String>, config: WeightConfig, retry: RetryPolicy) -> Self {
        MethodWeightTracker {
            db,
            methods,
            config,
            retry,
        }
    }

    pub fn methods(&self) -> &[String] {
        &self.methods
    }

    /// Normalised weights for every known method of the sport.
    pub fn get_weights(&self, sport: &str) -> Result<HashMap<String, f64>> {
        let table = self.current_table(&sport_key(sport))?;
        let sum: f64 = table.values().map(|w| w.weight).sum();
        if !(sum.is_finite() && sum > 0.0) {
            return Err(CoreError::DataIntegrity(format!(
                "weights for {} sum to {}",
                sport, sum
            )));
        }
        Ok(table
            .into_iter()
            .map(|(method, w)| (method, w.weight / sum))
            .collect())
    }

    pub fn get_performance(&self, sport: &str) -> Result<HashMap<String, MethodPerformance>> {
        let table = self.current_table(&sport_key(sport))?;
        Ok(table
            .into_iter()
            .map(|(method, w)| {
                (
                    method,
                    MethodPerformance {
                        correct: w.correct,
                        total: w.total,
                        avg_accuracy: w.avg_accuracy,
                    },
                )
            })
            .collect())
    }

    /// Fold one resolved prediction into the sport's weight table.
    ///
    /// Returns `false` when this prediction's outcome was already applied.
    pub fn apply_outcome(
        &self,
        prediction_id: i64,
        methods_used: &[MethodOutcome],
        was_correct: bool,
        accuracy_score: f64,
    ) -> Result<bool> {
        if !(0.0..=1.0).contains(&accuracy_score) {
            return Err(CoreError::DataIntegrity(format!(
                "accuracy score {} for prediction {} is outside [0, 1]",
                accuracy_score, prediction_id
            )));
        }
        let prediction = self
            .db
            .get_prediction(prediction_id)?
            .ok_or_else(|| CoreError::NotFound {
                kind: "prediction",
                id: prediction_id.to_string(),
            })?;
        if self.db.has_applied_outcome(prediction_id)? {
            debug!("Outcome for prediction {} already applied", prediction_id);
            return Ok(false);
        }
        let sport = sport_key(&prediction.sport);

        let lock = RowLock::acquire(&self.db, &format!("weights:{}", sport), &self.retry)?;
        let mut table = self.current_table(&sport)?;
        let now = Utc::now();

        for outcome in methods_used {
            let prior = 1.0 / (table.len() + 1) as f64;
            let row = table
                .entry(outcome.method.clone())
                .or_insert_with(|| prior_row(&sport, &outcome.method, prior));
            let accuracy = match outcome.agreed {
                Some(true) => 1.0,
                Some(false) => 0.0,
                None => accuracy_score,
            };
            row.total += 1;
            if outcome.agreed == Some(true) {
                row.correct += 1;
            }
            row.avg_accuracy += (accuracy - row.avg_accuracy) / row.total as f64;
            let nudged = row.weight * (1.0 + self.config.learning_rate * (2.0 * accuracy - 1.0));
            row.weight = nudged.max(self.config.min_weight);
        }

        let sum: f64 = table.values().map(|w| w.weight).sum();
        if !(sum.is_finite() && sum > 0.0) {
            return Err(CoreError::DataIntegrity(format!(
                "weights for {} sum to {} before renormalisation",
                sport, sum
            )));
        }
        for row in table.values_mut() {
            row.weight /= sum;
            row.updated_at = now;
        }
        let rows: Vec<MethodWeight> = table.into_values().collect();
        verify_weights(&sport, &rows)?;

        let applied = self.db.commit_weight_update(prediction_id, &rows)?;
        lock.release()?;

        if applied {
            info!(
                "Applied outcome of prediction {} to {} weights ({} method(s), correct={}, accuracy={:.2})",
                prediction_id,
                sport,
                methods_used.len(),
                was_correct,
                accuracy_score
            );
        }
        Ok(applied)
    }

    /// Stored rows plus uniform priors for registered methods with no row.
    ///
    /// A stored table that is not a valid distribution is `DataIntegrity`;
    /// only the priors added here may push the sum past 1.
    fn current_table(&self, sport: &str) -> Result<BTreeMap<String, MethodWeight>> {
        let stored = self.db.load_method_weights(sport)?;
        if !stored.is_empty() {
            verify_weights(sport, &stored)?;
        }
        let mut table: BTreeMap<String, MethodWeight> = stored
            .into_iter()
            .map(|w| (w.method.clone(), w))
            .collect();

        let mut names: Vec<&String> = self.methods.iter().collect();
        names.extend(table.keys().filter(|k| !self.methods.contains(k)));
        let n = names.len().max(1);
        let prior = 1.0 / n as f64;

        let missing: Vec<String> = self
            .methods
            .iter()
            .filter(|m| !table.contains_key(*m))
            .cloned()
            .collect();
        for method in missing {
            let row = prior_row(sport, &method, prior);
            table.insert(method, row);
        }
        Ok(table)
    }
}

fn prior_row(sport: &str, method: &str, weight: f64) -> MethodWeight {
    MethodWeight {
        sport: sport.to_string(),
        method: method.to_string(),
        weight,
        correct: 0,
        total: 0,
        avg_accuracy: 0.0,
        updated_at: Utc::now(),
    }
}

/// A persisted table must be finite, positive and sum to 1.
pub fn verify_weights(sport: &str, rows: &[MethodWeight]) -> Result<()> {
    if let Some(bad) = rows.iter().find(|w| !w.weight.is_finite() || w.weight <= 0.0) {
        return Err(CoreError::DataIntegrity(format!(
            "weight of {} for {} is {}",
            bad.method, sport, bad.weight
        )));
    }
    let sum: f64 = rows.iter().map(|w| w.weight).sum();
    if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
        return Err(CoreError::DataIntegrity(format!(
            "weights for {} sum to {}",
            sport, sum
        )));
    }
    Ok(())
}
