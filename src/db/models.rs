use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::engine::decay::DecayResult;

/// Canonical key for a sport tag ("NBA " → "nba").
pub fn sport_key(sport: &str) -> String {
    sport.trim().to_lowercase()
}

/// Which participant a prediction backs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Home,
    Away,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Home => "home",
            Side::Away => "away",
        }
    }

    pub fn opposite(&self) -> Side {
        match self {
            Side::Home => Side::Away,
            Side::Away => Side::Home,
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Side {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "home" => Ok(Side::Home),
            "away" => Ok(Side::Away),
            other => Err(format!("unknown side '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Weather {
    pub temperature_f: Option<f64>,
    pub conditions: Option<String>,
    pub wind_mph: Option<f64>,
    /// Domed/indoor venues ignore weather entirely
    #[serde(default)]
    pub indoor: bool,
}

/// Injury impact per side, each in [-1, 1]. Positive = side is weakened.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Injuries {
    pub home_impact: Option<f64>,
    pub away_impact: Option<f64>,
    /// Age of the injury report; drives decay of the impact
    #[serde(default)]
    pub reported_days_ago: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct HeadToHead {
    pub home_wins: u32,
    pub away_wins: u32,
    #[serde(default)]
    pub draws: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RestTravel {
    pub home_rest_days: f64,
    pub away_rest_days: f64,
    #[serde(default)]
    pub away_travel_miles: f64,
}

/// Season-to-date numbers for one team.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TeamStats {
    pub wins: u32,
    pub losses: u32,
    pub points_for: f64,
    pub points_against: f64,
    #[serde(default)]
    pub recent_avg_points: Option<f64>,
    #[serde(default)]
    pub recent_avg_allowed: Option<f64>,
    /// Opponent quality in [0, 1]; 0.5 is an average schedule
    #[serde(default)]
    pub strength_of_schedule: Option<f64>,
}

impl TeamStats {
    pub fn games(&self) -> u32 {
        self.wins + self.losses
    }

    pub fn win_pct(&self) -> Option<f64> {
        match self.games() {
            0 => None,
            n => Some(self.wins as f64 / n as f64),
        }
    }

    /// Points scored per game, preferring the recent average.
    pub fn scoring_rate(&self) -> Option<f64> {
        self.recent_avg_points.or_else(|| match self.games() {
            0 => None,
            n => Some(self.points_for / n as f64),
        })
    }

    /// Points allowed per game, preferring the recent average.
    pub fn allowed_rate(&self) -> Option<f64> {
        self.recent_avg_allowed.or_else(|| match self.games() {
            0 => None,
            n => Some(self.points_against / n as f64),
        })
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MatchupStats {
    pub home: TeamStats,
    pub away: TeamStats,
}

/// Result of one past game, serialised as "W" / "L" / "D".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GameResult {
    #[serde(rename = "W")]
    Win,
    #[serde(rename = "L")]
    Loss,
    #[serde(rename = "D")]
    Draw,
}

/// Last results per side, most recent first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FormGuide {
    #[serde(default)]
    pub home: Vec<GameResult>,
    #[serde(default)]
    pub away: Vec<GameResult>,
}

/// A past signal whose influence fades with age.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TemporalEvent {
    pub days_ago: f64,
    /// Signed impact in [-1, 1]; positive favours the home side
    pub impact: f64,
    /// e.g. "injury", "form", "structural", "altitude"
    #[serde(rename = "type")]
    pub kind: String,
}

/// A scheduled game as supplied by an ingestion adapter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GameEvent {
    pub id: String,
    pub home_team: String,
    pub away_team: String,
    pub sport: String,
    pub league: Option<String>,
    pub scheduled_at: DateTime<Utc>,
    pub venue: Option<String>,
    #[serde(default)]
    pub weather: Option<Weather>,
    #[serde(default)]
    pub injuries: Option<Injuries>,
    #[serde(default)]
    pub head_to_head: Option<HeadToHead>,
    #[serde(default)]
    pub rest: Option<RestTravel>,
    #[serde(default)]
    pub team_stats: Option<MatchupStats>,
    #[serde(default)]
    pub recent_form: Option<FormGuide>,
    #[serde(default)]
    pub signals: Vec<TemporalEvent>,
    /// Consensus line at prediction time
    #[serde(default)]
    pub odds: Option<OddsSnapshot>,
}

/// One source's price for one event at one instant. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsQuote {
    pub event_id: String,
    pub source: String,
    /// American odds
    pub home_moneyline: Option<f64>,
    pub away_moneyline: Option<f64>,
    /// Home handicap in points (negative = home favoured)
    pub spread: Option<f64>,
    pub total: Option<f64>,
    pub fetched_at: DateTime<Utc>,
}

/// Reconciled price across sources at one recomputation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusLine {
    pub home_moneyline: Option<f64>,
    pub away_moneyline: Option<f64>,
    pub spread: Option<f64>,
    pub total: Option<f64>,
    /// Number of fresh sources that fed this line
    pub source_count: usize,
    pub computed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsSnapshot {
    pub event_id: String,
    pub consensus: ConsensusLine,
    /// Every consensus value computed for the event, oldest first
    pub history: Vec<ConsensusLine>,
}

impl OddsSnapshot {
    pub fn moneyline(&self, side: Side) -> Option<f64> {
        match side {
            Side::Home => self.consensus.home_moneyline,
            Side::Away => self.consensus.away_moneyline,
        }
    }

    pub fn opening(&self) -> Option<&ConsensusLine> {
        self.history.first()
    }

    /// Points the spread has moved since the first consensus. 0 when unknown.
    pub fn spread_movement(&self) -> f64 {
        let opening = self.history.iter().find_map(|l| l.spread);
        match (opening, self.consensus.spread) {
            (Some(open), Some(now)) => now - open,
            _ => 0.0,
        }
    }
}

/// One scoring method's opinion about one event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodScore {
    pub method: String,
    /// Home win probability
    pub probability: f64,
    pub confidence: f64,
    pub rationale: String,
}

impl MethodScore {
    pub fn picked_side(&self) -> Side {
        if self.probability >= 0.5 {
            Side::Home
        } else {
            Side::Away
        }
    }
}

/// Reliability weight of a method within one sport
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodWeight {
    pub sport: String,
    pub method: String,
    pub weight: f64,
    pub correct: i64,
    pub total: i64,
    pub avg_accuracy: f64,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MethodPerformance {
    pub correct: i64,
    pub total: i64,
    pub avg_accuracy: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PredictionStatus {
    Pending,
    Correct,
    Incorrect,
    Partial,
}

impl PredictionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PredictionStatus::Pending => "pending",
            PredictionStatus::Correct => "correct",
            PredictionStatus::Incorrect => "incorrect",
            PredictionStatus::Partial => "partial",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, PredictionStatus::Pending)
    }

    /// Accuracy credited to the prediction: 1 / 0.5 / 0.
    pub fn accuracy(&self) -> f64 {
        match self {
            PredictionStatus::Correct => 1.0,
            PredictionStatus::Partial => 0.5,
            PredictionStatus::Incorrect | PredictionStatus::Pending => 0.0,
        }
    }
}

impl FromStr for PredictionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(PredictionStatus::Pending),
            "correct" => Ok(PredictionStatus::Correct),
            "incorrect" => Ok(PredictionStatus::Incorrect),
            "partial" => Ok(PredictionStatus::Partial),
            other => Err(format!("unknown prediction status '{}'", other)),
        }
    }
}

/// A scored event awaiting (or past) resolution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: Option<i64>,
    pub event_id: String,
    pub sport: String,
    pub league: Option<String>,
    pub home_team: String,
    pub away_team: String,
    pub scheduled_at: DateTime<Utc>,
    /// Blended home win probability before calibration
    pub raw_probability: f64,
    /// Home win probability after sport calibration (equal to raw when none)
    pub probability: f64,
    pub side: Side,
    /// Probability that `side` wins
    pub side_probability: f64,
    pub confidence: f64,
    /// side_probability − break_even
    pub edge: f64,
    pub break_even: f64,
    pub american_odds: f64,
    pub decimal_odds: f64,
    pub method_scores: Vec<MethodScore>,
    pub odds: OddsSnapshot,
    pub temporal_events: Vec<TemporalEvent>,
    pub decay: DecayResult,
    pub status: PredictionStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl PredictionRecord {
    pub fn selection(&self) -> &str {
        match self.side {
            Side::Home => &self.home_team,
            Side::Away => &self.away_team,
        }
    }
}

/// Final score of an event, supplied by the ingestion boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventResult {
    pub event_id: String,
    pub home_score: i32,
    pub away_score: i32,
    pub resolved_at: DateTime<Utc>,
}

impl EventResult {
    /// `None` for a draw
    pub fn winner(&self) -> Option<Side> {
        match self.home_score.cmp(&self.away_score) {
            std::cmp::Ordering::Greater => Some(Side::Home),
            std::cmp::Ordering::Less => Some(Side::Away),
            std::cmp::Ordering::Equal => None,
        }
    }
}

/// Persisted per-sport Platt calibration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelCalibration {
    pub sport: String,
    pub a: f64,
    pub b: f64,
    pub samples: i64,
    pub logloss_before: f64,
    pub logloss_after: f64,
    pub brier_before: f64,
    pub brier_after: f64,
    pub fitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionStats {
    pub total: i64,
    pub pending: i64,
    pub correct: i64,
    pub incorrect: i64,
    pub partial: i64,
}

impl PredictionStats {
    /// Correct share of decided (non-partial) predictions
    pub fn hit_rate(&self) -> Option<f64> {
        let decided = self.correct + self.incorrect;
        if decided == 0 {
            None
        } else {
            Some(self.correct as f64 / decided as f64)
        }
    }
}
