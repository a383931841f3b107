//! Event scoring: decay → methods → weighted blend → calibration → edge.

use chrono::Utc;
use std::collections::HashMap;
use tracing::{debug, info, warn};

use crate::db::models::{
    sport_key, GameEvent, MethodScore, PredictionRecord, PredictionStatus, Side,
};
use crate::db::Database;
use crate::engine::calibration::Calibrator;
use crate::engine::decay::TemporalDecayCalculator;
use crate::engine::methods::{MethodRegistry, ScoringInput};
use crate::engine::weights::MethodWeightTracker;
use crate::error::{CoreError, MethodError, Result};
use crate::market::price::{american_to_decimal, is_valid_american};

/// A side's price as a book displays it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Price {
    pub american: f64,
    /// Rounded to two places
    pub decimal: f64,
    pub break_even: f64,
}

impl Price {
    pub fn from_american(american: f64) -> Option<Price> {
        if !is_valid_american(american) {
            return None;
        }
        let decimal = (american_to_decimal(american) * 100.0).round() / 100.0;
        if decimal <= 1.0 {
            return None;
        }
        Some(Price {
            american,
            decimal,
            break_even: 1.0 / decimal,
        })
    }
}

/// Weighted blend `Σ w·c·p / Σ w·c` and the weight-averaged confidence.
///
/// Methods without a stored weight count with the uniform share. `None` when
/// nothing carries effective weight.
pub fn blend(scores: &[MethodScore], weights: &HashMap<String, f64>) -> Option<(f64, f64)> {
    if scores.is_empty() {
        return None;
    }
    let fallback = 1.0 / weights.len().max(scores.len()) as f64;
    let (mut num, mut den, mut total_w) = (0.0, 0.0, 0.0);
    for s in scores {
        let w = weights.get(&s.method).copied().unwrap_or(fallback);
        num += w * s.confidence * s.probability;
        den += w * s.confidence;
        total_w += w;
    }
    if den <= 0.0 || total_w <= 0.0 || !den.is_finite() {
        return None;
    }
    Some(((num / den).clamp(0.0, 1.0), (den / total_w).clamp(0.0, 1.0)))
}

/// Reject events the methods cannot be trusted with.
pub fn validate_event(event: &GameEvent) -> Result<()> {
    let id = event.id.as_str();
    if id.trim().is_empty() {
        return Err(CoreError::malformed(id, "empty event id"));
    }
    if event.home_team.trim().is_empty() || event.away_team.trim().is_empty() {
        return Err(CoreError::malformed(id, "missing team"));
    }
    if event.home_team.trim() == event.away_team.trim() {
        return Err(CoreError::malformed(id, "home and away are the same team"));
    }
    if event.sport.trim().is_empty() {
        return Err(CoreError::malformed(id, "missing sport"));
    }
    if let Some(inj) = &event.injuries {
        for impact in [inj.home_impact, inj.away_impact].into_iter().flatten() {
            if !impact.is_finite() || !(-1.0..=1.0).contains(&impact) {
                return Err(CoreError::malformed(
                    id,
                    format!("injury impact {} outside [-1, 1]", impact),
                ));
            }
        }
        if !inj.reported_days_ago.is_finite() || inj.reported_days_ago < 0.0 {
            return Err(CoreError::malformed(id, "negative injury report age"));
        }
    }
    for signal in &event.signals {
        if !signal.impact.is_finite() || !(-1.0..=1.0).contains(&signal.impact) {
            return Err(CoreError::malformed(
                id,
                format!("{} signal impact {} outside [-1, 1]", signal.kind, signal.impact),
            ));
        }
        if !signal.days_ago.is_finite() || signal.days_ago < 0.0 {
            return Err(CoreError::malformed(
                id,
                format!("{} signal has invalid age {}", signal.kind, signal.days_ago),
            ));
        }
    }
    if let Some(rest) = &event.rest {
        if !rest.home_rest_days.is_finite()
            || !rest.away_rest_days.is_finite()
            || !rest.away_travel_miles.is_finite()
        {
            return Err(CoreError::malformed(id, "non-finite rest/travel values"));
        }
    }
    if let Some(stats) = &event.team_stats {
        for (side, team) in [("home", &stats.home), ("away", &stats.away)] {
            let rates = [
                Some(team.points_for),
                Some(team.points_against),
                team.recent_avg_points,
                team.recent_avg_allowed,
            ];
            if rates.into_iter().flatten().any(|v| !v.is_finite() || v < 0.0) {
                return Err(CoreError::malformed(
                    id,
                    format!("{} team stats have negative or non-finite points", side),
                ));
            }
            if matches!(team.strength_of_schedule, Some(sos) if !(0.0..=1.0).contains(&sos)) {
                return Err(CoreError::malformed(
                    id,
                    format!("{} strength of schedule outside [0, 1]", side),
                ));
            }
        }
    }
    Ok(())
}

pub struct PredictionEngine {
    db: Database,
    registry: MethodRegistry,
    weights: MethodWeightTracker,
    decay: TemporalDecayCalculator,
    calibrator: Calibrator,
}

impl PredictionEngine {
    pub fn new(
        db: Database,
        registry: MethodRegistry,
        weights: MethodWeightTracker,
        decay: TemporalDecayCalculator,
        calibrator: Calibrator,
    ) -> Self {
        PredictionEngine {
            db,
            registry,
            weights,
            decay,
            calibrator,
        }
    }

    pub fn registry(&self) -> &MethodRegistry {
        &self.registry
    }

    /// Score an event and persist it as a pending prediction.
    pub fn predict(&self, event: &GameEvent) -> Result<PredictionRecord> {
        validate_event(event)?;
        let snapshot = event
            .odds
            .as_ref()
            .ok_or_else(|| CoreError::InsufficientMarketData {
                event_id: event.id.clone(),
            })?;
        let home_price = snapshot.moneyline(Side::Home).and_then(Price::from_american);
        let away_price = snapshot.moneyline(Side::Away).and_then(Price::from_american);
        if home_price.is_none() && away_price.is_none() {
            return Err(CoreError::InsufficientMarketData {
                event_id: event.id.clone(),
            });
        }

        let sport = sport_key(&event.sport);
        let input = self.scoring_input(event, &sport);
        let scores = self.run_methods(&input);

        let weights = self.weights.get_weights(&sport)?;
        let (raw_probability, confidence) =
            blend(&scores, &weights).ok_or_else(|| CoreError::NoUsableScores {
                event_id: event.id.clone(),
            })?;
        let probability = self.calibrator.calibrate(&sport, raw_probability)?;

        let (side, price) = pick_side(probability, home_price, away_price).ok_or_else(|| {
            CoreError::InsufficientMarketData {
                event_id: event.id.clone(),
            }
        })?;
        let side_probability = match side {
            Side::Home => probability,
            Side::Away => 1.0 - probability,
        };

        let mut record = PredictionRecord {
            id: None,
            event_id: event.id.clone(),
            sport,
            league: event.league.clone(),
            home_team: event.home_team.clone(),
            away_team: event.away_team.clone(),
            scheduled_at: event.scheduled_at,
            raw_probability,
            probability,
            side,
            side_probability,
            confidence,
            edge: side_probability - price.break_even,
            break_even: price.break_even,
            american_odds: price.american,
            decimal_odds: price.decimal,
            method_scores: scores,
            odds: snapshot.clone(),
            temporal_events: event.signals.clone(),
            decay: input.decay,
            status: PredictionStatus::Pending,
            created_at: Utc::now(),
            resolved_at: None,
        };
        let id = self.db.insert_prediction(&record)?;
        record.id = Some(id);

        info!(
            "Prediction #{} {} vs {} ({}): {} p={:.3} edge={:+.4} @ {:+} ({} method(s), conf={:.2})",
            id,
            record.home_team,
            record.away_team,
            record.sport,
            record.selection(),
            record.side_probability,
            record.edge,
            record.american_odds,
            record.method_scores.len(),
            record.confidence
        );
        Ok(record)
    }

    fn scoring_input<'a>(&self, event: &'a GameEvent, sport: &str) -> ScoringInput<'a> {
        let decay = self.decay.calculate(&event.signals, sport);
        let injuries = event.injuries.as_ref().and_then(|inj| {
            if inj.home_impact.is_none() && inj.away_impact.is_none() {
                return None;
            }
            let factor = self.decay.factor("injury", inj.reported_days_ago, sport);
            Some((
                inj.home_impact.unwrap_or(0.0) * factor,
                inj.away_impact.unwrap_or(0.0) * factor,
            ))
        });
        ScoringInput {
            event,
            decay,
            injuries,
        }
    }

    /// Run every method; failures are logged and left out.
    fn run_methods(&self, input: &ScoringInput<'_>) -> Vec<MethodScore> {
        let mut scores = Vec::with_capacity(self.registry.len());
        for method in self.registry.iter() {
            match method.score(input).and_then(|e| e.into_score(method.name())) {
                Ok(score) => scores.push(score),
                Err(e) => {
                    if matches!(e, MethodError::MissingData(_)) {
                        debug!("{} skipped for {}: {}", method.name(), input.event.id, e);
                    } else {
                        warn!("{} failed for {}: {}", method.name(), input.event.id, e);
                    }
                }
            }
        }
        scores
    }
}

/// Side with the larger edge among those with a usable price.
fn pick_side(probability: f64, home: Option<Price>, away: Option<Price>) -> Option<(Side, Price)> {
    let home_edge = home.map(|p| probability - p.break_even);
    let away_edge = away.map(|p| (1.0 - probability) - p.break_even);
    match (home, away) {
        (Some(h), Some(a)) => {
            if away_edge > home_edge {
                Some((Side::Away, a))
            } else {
                Some((Side::Home, h))
            }
        }
        (Some(h), None) => Some((Side::Home, h)),
        (None, Some(a)) => Some((Side::Away, a)),
        (None, None) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::lock::RetryPolicy;
    use crate::db::models::{Injuries, MatchupStats, TeamStats, TemporalEvent};
    use crate::engine::calibration::CalibrationConfig;
    use crate::engine::methods::Estimate;
    use crate::engine::stake::StakeOptimizer;
    use crate::engine::weights::WeightConfig;
    use crate::testing::make_event;
    use approx::assert_relative_eq;

    fn engine_with(db: &Database, registry: MethodRegistry) -> PredictionEngine {
        let weights = MethodWeightTracker::new(
            db.clone(),
            registry.names(),
            WeightConfig::default(),
            RetryPolicy::default(),
        );
        PredictionEngine::new(
            db.clone(),
            registry,
            weights,
            TemporalDecayCalculator::default(),
            Calibrator::new(db.clone(), CalibrationConfig::default()),
        )
    }

    fn fixed(p: f64, c: f64) -> MethodRegistry {
        let mut registry = MethodRegistry::new();
        registry.register_fn("fixed", move |_| Ok(Estimate::new(p, c, "fixed")));
        registry
    }

    #[test]
    fn minus_110_at_58_percent_end_to_end() {
        let db = Database::open_in_memory().unwrap();
        let engine = engine_with(&db, fixed(0.58, 1.0));
        let rec = engine.predict(&make_event("e1", "NBA")).unwrap();

        assert_eq!(rec.side, Side::Home);
        assert_relative_eq!(rec.decimal_odds, 1.91);
        assert_relative_eq!(rec.break_even, 0.5236, epsilon = 1e-4);
        assert_relative_eq!(rec.edge, 0.0564, epsilon = 1e-4);
        assert_eq!(rec.status, PredictionStatus::Pending);
        assert_eq!(rec.sport, "nba");

        let stored = db.get_prediction(rec.id.unwrap()).unwrap().unwrap();
        assert_eq!(stored.id, rec.id);
        assert_eq!(stored.status, PredictionStatus::Pending);
        assert_relative_eq!(stored.edge, rec.edge);
        assert_eq!(stored.method_scores.len(), 1);

        let stake = StakeOptimizer::default().recommend(&rec, 1000.0);
        assert_relative_eq!(stake.fraction, 0.069, epsilon = 1e-3);
        assert_relative_eq!(stake.stake, 69.0);
    }

    #[test]
    fn low_probability_backs_away_side() {
        let db = Database::open_in_memory().unwrap();
        let rec = engine_with(&db, fixed(0.35, 0.8))
            .predict(&make_event("e1", "nfl"))
            .unwrap();
        assert_eq!(rec.side, Side::Away);
        assert_relative_eq!(rec.side_probability, 0.65, epsilon = 1e-12);
        assert_eq!(rec.selection(), "Owls");
    }

    #[test]
    fn missing_odds_records_nothing() {
        let db = Database::open_in_memory().unwrap();
        let engine = engine_with(&db, fixed(0.6, 1.0));
        let mut event = make_event("e1", "nba");
        event.odds = None;
        assert!(matches!(
            engine.predict(&event),
            Err(CoreError::InsufficientMarketData { .. })
        ));

        let mut event = make_event("e2", "nba");
        let odds = event.odds.as_mut().unwrap();
        odds.consensus.home_moneyline = Some(50.0);
        odds.consensus.away_moneyline = None;
        assert!(matches!(
            engine.predict(&event),
            Err(CoreError::InsufficientMarketData { .. })
        ));
        assert_eq!(db.prediction_stats(None).unwrap().total, 0);
    }

    #[test]
    fn failing_method_is_excluded() {
        let db = Database::open_in_memory().unwrap();
        let mut registry = fixed(0.6, 1.0);
        registry
            .register_fn("broken", |_| Err(MethodError::Failed("upstream down".into())))
            .register_fn("wild", |_| Ok(Estimate::new(1.7, 1.0, "out of range")));
        let rec = engine_with(&db, registry)
            .predict(&make_event("e1", "nba"))
            .unwrap();
        assert_eq!(rec.method_scores.len(), 1);
        assert_relative_eq!(rec.raw_probability, 0.6, epsilon = 1e-12);
    }

    #[test]
    fn no_surviving_method_is_an_error() {
        let db = Database::open_in_memory().unwrap();
        let mut registry = MethodRegistry::new();
        registry.register_fn("broken", |_| Err(MethodError::MissingData("everything")));
        let err = engine_with(&db, registry)
            .predict(&make_event("e1", "nba"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NoUsableScores { .. }));

        let err = engine_with(&db, fixed(0.7, 0.0))
            .predict(&make_event("e2", "nba"))
            .unwrap_err();
        assert!(matches!(err, CoreError::NoUsableScores { .. }));
        assert_eq!(db.prediction_stats(None).unwrap().total, 0);
    }

    #[test]
    fn blend_uses_weight_and_confidence() {
        let scores = vec![
            MethodScore {
                method: "a".into(),
                probability: 0.7,
                confidence: 1.0,
                rationale: String::new(),
            },
            MethodScore {
                method: "b".into(),
                probability: 0.4,
                confidence: 0.5,
                rationale: String::new(),
            },
        ];
        let weights: HashMap<String, f64> =
            [("a".to_string(), 0.5), ("b".to_string(), 0.5)].into_iter().collect();
        let (p, c) = blend(&scores, &weights).unwrap();
        assert_relative_eq!(p, (0.5 * 0.7 + 0.25 * 0.4) / 0.75, epsilon = 1e-12);
        assert_relative_eq!(c, 0.75, epsilon = 1e-12);
    }

    #[test]
    fn injuries_are_decayed_before_scoring() {
        let db = Database::open_in_memory().unwrap();
        let mut registry = MethodRegistry::new();
        registry.register_fn("injury-echo", |input| {
            let (home, _) = input.injuries.ok_or(MethodError::MissingData("injuries"))?;
            Ok(Estimate::new(0.5 + home, 1.0, "decayed home injury"))
        });
        let mut event = make_event("e1", "nba");
        event.injuries = Some(Injuries {
            home_impact: Some(0.2),
            away_impact: None,
            reported_days_ago: 2.0,
        });
        let rec = engine_with(&db, registry).predict(&event).unwrap();
        assert_relative_eq!(rec.raw_probability, 0.5 + 0.2 * (-0.5f64).exp(), epsilon = 1e-12);
    }

    #[test]
    fn decay_result_is_stored_with_the_record() {
        let db = Database::open_in_memory().unwrap();
        let mut event = make_event("e1", "mlb");
        event.signals = vec![TemporalEvent {
            days_ago: 1.0,
            impact: 0.3,
            kind: "form".into(),
        }];
        let rec = engine_with(&db, fixed(0.6, 1.0)).predict(&event).unwrap();
        assert_relative_eq!(rec.decay.decayed_impact, 0.3 * (-0.3f64).exp(), epsilon = 1e-12);
        assert_eq!(rec.temporal_events.len(), 1);
    }

    #[test]
    fn malformed_events_are_rejected() {
        let db = Database::open_in_memory().unwrap();
        let engine = engine_with(&db, fixed(0.6, 1.0));

        let mut event = make_event("e1", "nba");
        event.home_team = " ".into();
        assert!(matches!(
            engine.predict(&event),
            Err(CoreError::MalformedEvent { .. })
        ));

        let mut event = make_event("e2", "nba");
        event.injuries = Some(Injuries {
            home_impact: Some(2.0),
            away_impact: None,
            reported_days_ago: 0.0,
        });
        assert!(matches!(
            engine.predict(&event),
            Err(CoreError::MalformedEvent { .. })
        ));

        let mut event = make_event("e3", "nba");
        event.signals = vec![TemporalEvent {
            days_ago: -1.0,
            impact: 0.1,
            kind: "form".into(),
        }];
        assert!(matches!(
            engine.predict(&event),
            Err(CoreError::MalformedEvent { .. })
        ));

        let mut event = make_event("e4", "nba");
        event.team_stats = Some(MatchupStats {
            home: TeamStats {
                points_for: -10.0,
                ..TeamStats::default()
            },
            away: TeamStats::default(),
        });
        assert!(matches!(
            engine.predict(&event),
            Err(CoreError::MalformedEvent { .. })
        ));

        let mut event = make_event("e5", "nba");
        event.team_stats = Some(MatchupStats {
            home: TeamStats::default(),
            away: TeamStats {
                strength_of_schedule: Some(1.5),
                ..TeamStats::default()
            },
        });
        assert!(matches!(
            engine.predict(&event),
            Err(CoreError::MalformedEvent { .. })
        ));
        assert_eq!(db.prediction_stats(None).unwrap().total, 0);
    }

    #[test]
    fn default_methods_score_a_plain_event() {
        let db = Database::open_in_memory().unwrap();
        let registry = MethodRegistry::with_defaults();
        let rec = engine_with(&db, registry)
            .predict(&make_event("e1", "nba"))
            .unwrap();
        let names: Vec<&str> = rec.method_scores.iter().map(|s| s.method.as_str()).collect();
        assert!(names.contains(&"market-implied"));
        assert!(names.contains(&"home-advantage"));
        assert!(!names.contains(&"weather-impact"));
    }
}
