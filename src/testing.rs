//! Shared fixtures for unit tests.

use chrono::{Duration, Utc};

use crate::db::models::{
    ConsensusLine, GameEvent, MethodScore, OddsSnapshot, PredictionRecord, PredictionStatus, Side,
};
use crate::engine::decay::DecayResult;

pub fn method_names(names: &[&str]) -> Vec<String> {
    names.iter().map(|s| s.to_string()).collect()
}

pub fn make_snapshot(event_id: &str, home: Option<f64>, away: Option<f64>) -> OddsSnapshot {
    let line = ConsensusLine {
        home_moneyline: home,
        away_moneyline: away,
        spread: Some(-3.5),
        total: Some(47.5),
        source_count: 3,
        computed_at: Utc::now(),
    };
    OddsSnapshot {
        event_id: event_id.to_string(),
        consensus: line.clone(),
        history: vec![line],
    }
}

pub fn make_event(id: &str, sport: &str) -> GameEvent {
    GameEvent {
        id: id.to_string(),
        home_team: "Hawks".into(),
        away_team: "Owls".into(),
        sport: sport.to_string(),
        league: None,
        scheduled_at: Utc::now() + Duration::hours(6),
        venue: None,
        weather: None,
        injuries: None,
        head_to_head: None,
        rest: None,
        team_stats: None,
        recent_form: None,
        signals: Vec::new(),
        odds: Some(make_snapshot(id, Some(-110.0), Some(-110.0))),
    }
}

/// A pending prediction backing the home side at -110.
pub fn make_prediction(event_id: &str, sport: &str) -> PredictionRecord {
    PredictionRecord {
        id: None,
        event_id: event_id.to_string(),
        sport: sport.to_string(),
        league: None,
        home_team: "Hawks".into(),
        away_team: "Owls".into(),
        scheduled_at: Utc::now(),
        raw_probability: 0.58,
        probability: 0.58,
        side: Side::Home,
        side_probability: 0.58,
        confidence: 0.6,
        edge: 0.0564,
        break_even: 0.5236,
        american_odds: -110.0,
        decimal_odds: 1.909,
        method_scores: vec![
            MethodScore {
                method: "market-implied".into(),
                probability: 0.55,
                confidence: 0.7,
                rationale: "consensus".into(),
            },
            MethodScore {
                method: "head-to-head".into(),
                probability: 0.40,
                confidence: 0.5,
                rationale: "series".into(),
            },
        ],
        odds: make_snapshot(event_id, Some(-110.0), Some(-110.0)),
        temporal_events: Vec::new(),
        decay: DecayResult::neutral(),
        status: PredictionStatus::Pending,
        created_at: Utc::now(),
        resolved_at: None,
    }
}
