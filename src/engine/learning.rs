//! Outcome resolution and re-weighting.
//!
//! One cycle walks the pending predictions (optionally of one sport), grades
//! every one whose event has a final score, folds the result into the sport's
//! method weights and then refits the sport's calibration. Re-running a cycle
//! over the same data changes nothing: grading is a one-way transition and
//! weight updates are keyed by prediction id.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tracing::{info, warn};

use crate::db::lock::RowLock;
use crate::db::models::{sport_key, EventResult, MethodScore, PredictionRecord, PredictionStatus, Side};
use crate::db::Database;
use crate::engine::calibration::Calibrator;
use crate::engine::weights::{MethodOutcome, MethodWeightTracker};
use crate::error::Result;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CycleSummary {
    /// Sports processed in this run
    pub sports: Vec<String>,
    /// Sports whose cycle was already running elsewhere
    pub skipped_sports: Vec<String>,
    pub examined: usize,
    pub resolved: usize,
    pub correct: usize,
    pub incorrect: usize,
    pub partial: usize,
    /// Pending predictions whose event has no result yet
    pub still_pending: usize,
    /// Sports that got a new calibration
    pub recalibrated: Vec<String>,
    /// Normalised weights after the run, per processed sport
    pub weights_after: BTreeMap<String, HashMap<String, f64>>,
}

/// Grade a prediction against the final score.
pub fn grade(prediction: &PredictionRecord, result: &EventResult) -> PredictionStatus {
    match result.winner() {
        None => PredictionStatus::Partial,
        Some(winner) if winner == prediction.side => PredictionStatus::Correct,
        Some(_) => PredictionStatus::Incorrect,
    }
}

/// Per-method agreement with the winner; `None` on a draw.
pub fn method_outcomes(scores: &[MethodScore], winner: Option<Side>) -> Vec<MethodOutcome> {
    scores
        .iter()
        .map(|s| MethodOutcome {
            method: s.method.clone(),
            agreed: winner.map(|w| s.picked_side() == w),
        })
        .collect()
}

#[derive(Clone)]
pub struct LearningCycle {
    db: Database,
    weights: MethodWeightTracker,
    calibrator: Calibrator,
    lease_ttl: Duration,
}

impl LearningCycle {
    pub fn new(
        db: Database,
        weights: MethodWeightTracker,
        calibrator: Calibrator,
        lease_ttl: Duration,
    ) -> Self {
        LearningCycle {
            db,
            weights,
            calibrator,
            lease_ttl,
        }
    }

    pub fn run(&self, sport: Option<&str>) -> Result<CycleSummary> {
        let filter = sport.map(sport_key);
        let pending = self.db.list_pending_predictions(filter.as_deref())?;

        let mut by_sport: BTreeMap<String, Vec<PredictionRecord>> = BTreeMap::new();
        for rec in pending {
            by_sport.entry(rec.sport.clone()).or_default().push(rec);
        }
        if let Some(s) = &filter {
            by_sport.entry(s.clone()).or_default();
        }

        let mut summary = CycleSummary::default();
        for (sport, records) in by_sport {
            // one cycle per sport at a time; a busy sport is left to its holder
            let Some(lease) = RowLock::try_acquire(&self.db, &format!("cycle:{}", sport), self.lease_ttl)?
            else {
                info!("Learning cycle for {} already running, skipping", sport);
                summary.skipped_sports.push(sport);
                continue;
            };

            self.resolve_sport(&records, &mut summary)?;

            if self.calibrator.refit(&sport)?.is_some() {
                summary.recalibrated.push(sport.clone());
            }
            summary
                .weights_after
                .insert(sport.clone(), self.weights.get_weights(&sport)?);
            lease.release()?;
            summary.sports.push(sport);
        }

        info!(
            "Learning cycle: examined={}, resolved={} (correct={}, incorrect={}, partial={}), pending={}, skipped={:?}",
            summary.examined,
            summary.resolved,
            summary.correct,
            summary.incorrect,
            summary.partial,
            summary.still_pending,
            summary.skipped_sports
        );
        Ok(summary)
    }

    fn resolve_sport(&self, records: &[PredictionRecord], summary: &mut CycleSummary) -> Result<()> {
        for rec in records {
            summary.examined += 1;
            let Some(id) = rec.id else {
                warn!("Pending prediction for {} has no id", rec.event_id);
                continue;
            };
            let Some(result) = self.db.get_event_result(&rec.event_id)? else {
                summary.still_pending += 1;
                continue;
            };

            let status = grade(rec, &result);
            let outcomes = method_outcomes(&rec.method_scores, result.winner());
            self.weights.apply_outcome(
                id,
                &outcomes,
                status == PredictionStatus::Correct,
                status.accuracy(),
            )?;
            if self.db.resolve_prediction(id, status)? {
                summary.resolved += 1;
                match status {
                    PredictionStatus::Correct => summary.correct += 1,
                    PredictionStatus::Incorrect => summary.incorrect += 1,
                    PredictionStatus::Partial => summary.partial += 1,
                    PredictionStatus::Pending => {}
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::lock::RetryPolicy;
    use crate::engine::calibration::CalibrationConfig;
    use crate::engine::weights::WeightConfig;
    use crate::testing::{make_prediction, method_names};
    use approx::assert_relative_eq;
    use chrono::Utc;

    fn cycle(db: &Database) -> LearningCycle {
        let weights = MethodWeightTracker::new(
            db.clone(),
            method_names(&["market-implied", "head-to-head", "home-advantage"]),
            WeightConfig::default(),
            RetryPolicy::default(),
        );
        LearningCycle::new(
            db.clone(),
            weights,
            Calibrator::new(db.clone(), CalibrationConfig::default()),
            Duration::from_secs(30),
        )
    }

    fn result(event_id: &str, home: i32, away: i32) -> EventResult {
        EventResult {
            event_id: event_id.into(),
            home_score: home,
            away_score: away,
            resolved_at: Utc::now(),
        }
    }

    #[test]
    fn grades_by_winner() {
        let p = make_prediction("e1", "nba");
        assert_eq!(grade(&p, &result("e1", 100, 90)), PredictionStatus::Correct);
        assert_eq!(grade(&p, &result("e1", 90, 100)), PredictionStatus::Incorrect);
        assert_eq!(grade(&p, &result("e1", 2, 2)), PredictionStatus::Partial);
    }

    #[test]
    fn resolves_only_events_with_results() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction(&make_prediction("e1", "nba")).unwrap();
        db.insert_prediction(&make_prediction("e2", "nba")).unwrap();
        db.insert_prediction(&make_prediction("e3", "nba")).unwrap();
        db.upsert_event_result(&result("e1", 101, 99)).unwrap();
        db.upsert_event_result(&result("e2", 90, 99)).unwrap();

        let summary = cycle(&db).run(None).unwrap();
        assert_eq!(summary.examined, 3);
        assert_eq!(summary.resolved, 2);
        assert_eq!(summary.correct, 1);
        assert_eq!(summary.incorrect, 1);
        assert_eq!(summary.still_pending, 1);
        assert_eq!(summary.sports, vec!["nba".to_string()]);

        let stats = db.prediction_stats(Some("nba")).unwrap();
        assert_eq!(stats.pending, 1);
        assert_eq!(stats.correct, 1);
        assert_eq!(stats.incorrect, 1);

        let w = &summary.weights_after["nba"];
        assert_relative_eq!(w.values().sum::<f64>(), 1.0, epsilon = 1e-9);
    }

    #[test]
    fn second_run_changes_nothing() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction(&make_prediction("e1", "nfl")).unwrap();
        db.upsert_event_result(&result("e1", 24, 17)).unwrap();
        let c = cycle(&db);
        let first = c.run(Some("nfl")).unwrap();
        let weights = db.load_method_weights("nfl").unwrap();
        let second = c.run(Some("nfl")).unwrap();
        assert_eq!(first.resolved, 1);
        assert_eq!(second.resolved, 0);
        assert_eq!(second.examined, 0);
        assert_eq!(db.load_method_weights("nfl").unwrap(), weights);
        assert_eq!(first.weights_after, second.weights_after);
    }

    #[test]
    fn draw_is_partial() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction(&make_prediction("e1", "nhl")).unwrap();
        db.upsert_event_result(&result("e1", 3, 3)).unwrap();
        let summary = cycle(&db).run(None).unwrap();
        assert_eq!(summary.partial, 1);
        let perf = cycle(&db).weights.get_performance("nhl").unwrap();
        assert_relative_eq!(perf["market-implied"].avg_accuracy, 0.5);
    }

    #[test]
    fn method_agreement_tracks_picked_side() {
        // fixture: market-implied picks home (0.55), head-to-head picks away (0.40)
        let p = make_prediction("e1", "nba");
        let outcomes = method_outcomes(&p.method_scores, Some(Side::Home));
        assert_eq!(outcomes[0].agreed, Some(true));
        assert_eq!(outcomes[1].agreed, Some(false));
        assert!(method_outcomes(&p.method_scores, None)
            .iter()
            .all(|o| o.agreed.is_none()));
    }

    #[test]
    fn busy_sport_is_skipped() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction(&make_prediction("e1", "mlb")).unwrap();
        db.upsert_event_result(&result("e1", 5, 2)).unwrap();
        let _held = RowLock::attempt(&db, "cycle:mlb", Duration::from_secs(30)).unwrap();

        let summary = cycle(&db).run(None).unwrap();
        assert_eq!(summary.skipped_sports, vec!["mlb".to_string()]);
        assert_eq!(summary.resolved, 0);
        assert_eq!(db.prediction_stats(Some("mlb")).unwrap().pending, 1);
    }

    #[test]
    fn sport_filter_limits_scope() {
        let db = Database::open_in_memory().unwrap();
        db.insert_prediction(&make_prediction("e1", "nba")).unwrap();
        db.insert_prediction(&make_prediction("e2", "nfl")).unwrap();
        db.upsert_event_result(&result("e1", 1, 0)).unwrap();
        db.upsert_event_result(&result("e2", 1, 0)).unwrap();
        let summary = cycle(&db).run(Some("NFL")).unwrap();
        assert_eq!(summary.resolved, 1);
        assert_eq!(db.prediction_stats(Some("nba")).unwrap().pending, 1);
    }
}
