//! Per-sport Platt scaling of blended probabilities.
//!
//! `p' = sigmoid(a · logit(p) + b)`. The two parameters are fitted by Newton's
//! method on the L2-penalised log-loss, against Platt's smoothed targets
//! (`(n₊ + 1) / (n₊ + 2)` for wins, `1 / (n₋ + 2)` for losses) so a perfectly
//! separable history cannot push `a` to infinity. A refit is only promoted when
//! it improves log-loss or Brier score by a minimum relative amount.

use chrono::Utc;
use tracing::{debug, info};

use crate::db::models::{sport_key, ModelCalibration};
use crate::db::Database;
use crate::error::Result;

const PROB_EPS: f64 = 1e-6;
/// Below this many samples (or with a single class) no fit is attempted
const MIN_FIT_SAMPLES: usize = 8;
/// Halvings allowed when a full Newton step does not lower the objective
const MAX_STEP_HALVINGS: u32 = 20;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PlattScaler {
    pub a: f64,
    pub b: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitReport {
    pub scaler: PlattScaler,
    /// Newton iterations taken
    pub iterations: usize,
    pub logloss_before: f64,
    pub logloss_after: f64,
    pub brier_before: f64,
    pub brier_after: f64,
}

impl FitReport {
    /// Relative improvement (≥ 0) of log-loss and Brier score.
    pub fn relative_improvement(&self) -> (f64, f64) {
        let ll = (self.logloss_before - self.logloss_after) / self.logloss_before.max(1e-9);
        let br = (self.brier_before - self.brier_after) / self.brier_before.max(1e-9);
        (ll.max(0.0), br.max(0.0))
    }
}

fn squash(p: f64) -> f64 {
    p.clamp(PROB_EPS, 1.0 - PROB_EPS)
}

fn logit(p: f64) -> f64 {
    let p = squash(p);
    (p / (1.0 - p)).ln()
}

fn sigmoid(x: f64) -> f64 {
    if x >= 0.0 {
        1.0 / (1.0 + (-x).exp())
    } else {
        let z = x.exp();
        z / (1.0 + z)
    }
}

fn logloss(p: f64, y: f64) -> f64 {
    let p = squash(p);
    -(y * p.ln() + (1.0 - y) * (1.0 - p).ln())
}

/// Mean log-loss against smoothed targets plus the L2 term on the slope.
fn objective(points: &[(f64, f64)], a: f64, b: f64, l2: f64) -> f64 {
    let n = points.len() as f64;
    let loss: f64 = points.iter().map(|(x, t)| logloss(sigmoid(a * x + b), *t)).sum();
    loss / n + 0.5 * l2 * a * a
}

impl PlattScaler {
    pub const IDENTITY: PlattScaler = PlattScaler { a: 1.0, b: 0.0 };

    pub fn apply(&self, raw: f64) -> f64 {
        sigmoid(self.a * logit(raw) + self.b).clamp(0.0, 1.0)
    }

    /// Fit on `(raw probability, label)` pairs, starting from the identity.
    ///
    /// Stops once a Newton step moves both parameters by less than
    /// `tolerance`. `None` when there are too few samples, only one class, or
    /// the curvature degenerates.
    pub fn fit(samples: &[(f64, f64)], max_iters: usize, tolerance: f64, l2: f64) -> Option<FitReport> {
        if samples.len() < MIN_FIT_SAMPLES {
            return None;
        }
        let positives = samples.iter().filter(|(_, y)| *y > 0.5).count();
        let negatives = samples.len() - positives;
        if positives == 0 || negatives == 0 {
            return None;
        }

        let hi = (positives as f64 + 1.0) / (positives as f64 + 2.0);
        let lo = 1.0 / (negatives as f64 + 2.0);
        let points: Vec<(f64, f64)> = samples
            .iter()
            .map(|(p, y)| (logit(*p), if *y > 0.5 { hi } else { lo }))
            .collect();
        let n = points.len() as f64;

        let (mut a, mut b): (f64, f64) = (1.0, 0.0);
        let mut current = objective(&points, a, b, l2);
        let mut iterations = 0;
        while iterations < max_iters.max(1) {
            iterations += 1;
            // gradient g and Hessian [[haa, hab], [hab, hbb]] of the objective
            let (mut ga, mut gb): (f64, f64) = (0.0, 0.0);
            let (mut haa, mut hab, mut hbb): (f64, f64, f64) = (0.0, 0.0, 0.0);
            for (x, t) in &points {
                let p = sigmoid(a * x + b);
                let w = p * (1.0 - p);
                ga += (p - t) * x;
                gb += p - t;
                haa += w * x * x;
                hab += w * x;
                hbb += w;
            }
            ga = ga / n + l2 * a;
            gb /= n;
            haa = haa / n + l2;
            hab /= n;
            hbb /= n;

            let det = haa * hbb - hab * hab;
            if !det.is_finite() || det <= f64::EPSILON {
                debug!("Platt fit stopped on flat curvature (det={:e})", det);
                return None;
            }
            let da = (hbb * ga - hab * gb) / det;
            let db = (haa * gb - hab * ga) / det;

            let mut scale: f64 = 1.0;
            let mut accepted = false;
            for _ in 0..=MAX_STEP_HALVINGS {
                let candidate = objective(&points, a - scale * da, b - scale * db, l2);
                if candidate.is_finite() && candidate <= current {
                    a -= scale * da;
                    b -= scale * db;
                    current = candidate;
                    accepted = true;
                    break;
                }
                scale *= 0.5;
            }
            if !accepted || (scale * da).abs().max((scale * db).abs()) < tolerance {
                break;
            }
        }
        if !a.is_finite() || !b.is_finite() {
            return None;
        }

        let scaler = PlattScaler { a, b };
        let (mut ll0, mut ll1, mut br0, mut br1) = (0.0, 0.0, 0.0, 0.0);
        for (raw, y) in samples {
            let before = squash(*raw);
            let after = scaler.apply(*raw);
            ll0 += logloss(before, *y);
            ll1 += logloss(after, *y);
            br0 += (before - y).powi(2);
            br1 += (after - y).powi(2);
        }
        Some(FitReport {
            scaler,
            iterations,
            logloss_before: ll0 / n,
            logloss_after: ll1 / n,
            brier_before: br0 / n,
            brier_after: br1 / n,
        })
    }
}

#[derive(Debug, Clone)]
pub struct CalibrationConfig {
    pub enabled: bool,
    pub min_samples: usize,
    pub max_iters: usize,
    /// Newton stops when a step moves both parameters less than this
    pub tolerance: f64,
    pub l2: f64,
    pub min_relative_improvement: f64,
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            min_samples: 50,
            max_iters: 50,
            tolerance: 1e-8,
            l2: 1e-3,
            min_relative_improvement: 0.01,
        }
    }
}

/// Loads, applies and refits the stored per-sport scalers.
#[derive(Clone)]
pub struct Calibrator {
    db: Database,
    config: CalibrationConfig,
}

impl Calibrator {
    pub fn new(db: Database, config: CalibrationConfig) -> Self {
        Calibrator { db, config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    /// Calibrated home probability; the raw value when no scaler is stored.
    pub fn calibrate(&self, sport: &str, raw: f64) -> Result<f64> {
        if !self.config.enabled {
            return Ok(raw);
        }
        Ok(match self.db.get_model_calibration(&sport_key(sport))? {
            Some(model) => PlattScaler { a: model.a, b: model.b }.apply(raw),
            None => raw,
        })
    }

    /// Refit a sport's scaler from resolved predictions and store it when it
    /// is good enough. Returns the promoted model.
    pub fn refit(&self, sport: &str) -> Result<Option<ModelCalibration>> {
        if !self.config.enabled {
            return Ok(None);
        }
        let sport = sport_key(sport);
        let samples = self.db.list_calibration_samples(&sport)?;
        if samples.len() < self.config.min_samples {
            return Ok(None);
        }
        let Some(report) = PlattScaler::fit(
            &samples,
            self.config.max_iters,
            self.config.tolerance,
            self.config.l2,
        ) else {
            return Ok(None);
        };

        let (ll_gain, br_gain) = report.relative_improvement();
        if ll_gain < self.config.min_relative_improvement
            && br_gain < self.config.min_relative_improvement
        {
            info!(
                "Calibration refit rejected for {}: rel_improve logloss={:.4}, brier={:.4}",
                sport, ll_gain, br_gain
            );
            return Ok(None);
        }

        let model = ModelCalibration {
            sport: sport.clone(),
            a: report.scaler.a,
            b: report.scaler.b,
            samples: samples.len() as i64,
            logloss_before: report.logloss_before,
            logloss_after: report.logloss_after,
            brier_before: report.brier_before,
            brier_after: report.brier_after,
            fitted_at: Utc::now(),
        };
        self.db.upsert_model_calibration(&model)?;
        info!(
            "Calibration promoted for {}: samples={}, a={:.4}, b={:.4}, logloss {:.4}->{:.4}, brier {:.4}->{:.4}",
            sport,
            model.samples,
            model.a,
            model.b,
            model.logloss_before,
            model.logloss_after,
            model.brier_before,
            model.brier_after
        );
        Ok(Some(model))
    }
}
