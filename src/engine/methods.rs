//! Pluggable scoring methods.
//!
//! A method looks at one event and returns a home-win probability with a
//! confidence in [0, 1]. Methods are independent of each other; a method that
//! lacks the data it needs reports `MissingData` and is simply left out of
//! the blend for that event.
//!
//! Built-ins:
//! - **market-implied**: de-vigged consensus moneyline
//! - **head-to-head**: smoothed series record
//! - **rest-travel**: rest-day differential and away travel
//! - **injury-impact**: decayed injury differential
//! - **recent-form**: decayed sum of recent signals
//! - **home-advantage**: per-sport home edge
//! - **weather-impact**: outdoor conditions
//! - **statistical-model**: Pythagorean expectation and win percentage
//! - **elo-rating**: ratings derived from season and recent scoring
//! - **momentum**: last three results, most recent weighted highest
//! - **poisson-scoreline**: independent Poisson scoring rates

use crate::db::models::{sport_key, GameEvent, GameResult, MatchupStats, MethodScore, TeamStats};
use crate::engine::decay::DecayResult;
use crate::error::MethodError;
use crate::market::price::devig;

/// Everything a method may read, with time-sensitive covariates already
/// decayed.
#[derive(Debug, Clone)]
pub struct ScoringInput<'a> {
    pub event: &'a GameEvent,
    /// Decay applied to `event.signals`
    pub decay: DecayResult,
    /// Decayed injury impacts `(home, away)`, when reported
    pub injuries: Option<(f64, f64)>,
}

/// A method's opinion before it is tagged with the method name.
#[derive(Debug, Clone, PartialEq)]
pub struct Estimate {
    /// Home win probability
    pub probability: f64,
    pub confidence: f64,
    pub rationale: String,
}

impl Estimate {
    pub fn new(probability: f64, confidence: f64, rationale: impl Into<String>) -> Self {
        Estimate {
            probability,
            confidence,
            rationale: rationale.into(),
        }
    }

    /// Checks ranges and attaches the method name.
    pub fn into_score(self, method: &str) -> Result<MethodScore, MethodError> {
        if !(0.0..=1.0).contains(&self.probability) {
            return Err(MethodError::InvalidOutput(format!(
                "probability {} outside [0, 1]",
                self.probability
            )));
        }
        if !(0.0..=1.0).contains(&self.confidence) {
            return Err(MethodError::InvalidOutput(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        Ok(MethodScore {
            method: method.to_string(),
            probability: self.probability,
            confidence: self.confidence,
            rationale: self.rationale,
        })
    }
}

/// Trait that every scoring method must implement.
pub trait ScoringMethod: Send + Sync {
    /// Stable name; weights are keyed by it.
    fn name(&self) -> &str;

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError>;
}

/// Adapts a plain function into a method.
pub struct FnMethod<F> {
    name: String,
    f: F,
}

impl<F> FnMethod<F>
where
    F: Fn(&ScoringInput<'_>) -> Result<Estimate, MethodError> + Send + Sync,
{
    pub fn new(name: impl Into<String>, f: F) -> Self {
        FnMethod {
            name: name.into(),
            f,
        }
    }
}

impl<F> ScoringMethod for FnMethod<F>
where
    F: Fn(&ScoringInput<'_>) -> Result<Estimate, MethodError> + Send + Sync,
{
    fn name(&self) -> &str {
        &self.name
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        (self.f)(input)
    }
}

/// Ordered set of methods, unique by name.
#[derive(Default)]
pub struct MethodRegistry {
    methods: Vec<Box<dyn ScoringMethod>>,
}

impl MethodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in method.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry
            .register(MarketImplied)
            .register(HeadToHeadRecord)
            .register(RestTravelEdge)
            .register(InjuryImpact)
            .register(RecentForm)
            .register(HomeAdvantage)
            .register(WeatherImpact)
            .register(StatisticalModel)
            .register(EloRating)
            .register(Momentum)
            .register(PoissonScoreline);
        registry
    }

    /// Adds a method, replacing any existing one with the same name.
    pub fn register<M: ScoringMethod + 'static>(&mut self, method: M) -> &mut Self {
        self.methods.retain(|m| m.name() != method.name());
        self.methods.push(Box::new(method));
        self
    }

    pub fn register_fn<F>(&mut self, name: &str, f: F) -> &mut Self
    where
        F: Fn(&ScoringInput<'_>) -> Result<Estimate, MethodError> + Send + Sync + 'static,
    {
        self.register(FnMethod::new(name, f))
    }

    pub fn names(&self) -> Vec<String> {
        self.methods.iter().map(|m| m.name().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.methods.len()
    }

    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &dyn ScoringMethod> {
        self.methods.iter().map(|m| m.as_ref())
    }
}

fn bounded(p: f64) -> f64 {
    p.clamp(0.05, 0.95)
}

// ── Market ───────────────────────────────────────────────────────────────────

pub struct MarketImplied;

impl ScoringMethod for MarketImplied {
    fn name(&self) -> &str {
        "market-implied"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let snapshot = input
            .event
            .odds
            .as_ref()
            .ok_or(MethodError::MissingData("odds"))?;
        let line = &snapshot.consensus;
        let (home, away) = match (line.home_moneyline, line.away_moneyline) {
            (Some(h), Some(a)) => (h, a),
            _ => return Err(MethodError::MissingData("two-sided moneyline")),
        };
        let (p_home, _) = devig(home, away)
            .ok_or_else(|| MethodError::InvalidOutput(format!("cannot de-vig {} / {}", home, away)))?;
        // more books agreeing, more trust; never full trust in a single book
        let confidence = (0.5 + 0.1 * line.source_count as f64).min(0.9);
        Ok(Estimate::new(
            p_home,
            confidence,
            format!(
                "consensus {:+} / {:+} over {} source(s)",
                home, away, line.source_count
            ),
        ))
    }
}

// ── Head-to-head ─────────────────────────────────────────────────────────────

pub struct HeadToHeadRecord;

impl ScoringMethod for HeadToHeadRecord {
    fn name(&self) -> &str {
        "head-to-head"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let h2h = input
            .event
            .head_to_head
            .as_ref()
            .ok_or(MethodError::MissingData("head_to_head"))?;
        let games = h2h.home_wins + h2h.away_wins + h2h.draws;
        if games == 0 {
            return Err(MethodError::MissingData("head_to_head games"));
        }
        let n = games as f64;
        // Laplace smoothing so a 1-0 series is not a certainty
        let p = (h2h.home_wins as f64 + 0.5 * h2h.draws as f64 + 1.0) / (n + 2.0);
        let confidence = (n / 20.0).min(0.8);
        Ok(Estimate::new(
            bounded(p),
            confidence,
            format!(
                "series {}-{}-{} over {} game(s)",
                h2h.home_wins, h2h.away_wins, h2h.draws, games
            ),
        ))
    }
}

// ── Rest and travel ──────────────────────────────────────────────────────────

/// Win-probability points per extra rest day (capped at 4 days)
const REST_DAY_VALUE: f64 = 0.015;
/// Points per 1000 miles travelled by the away side (capped at 3000)
const TRAVEL_VALUE: f64 = 0.01;

pub struct RestTravelEdge;

impl ScoringMethod for RestTravelEdge {
    fn name(&self) -> &str {
        "rest-travel"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let rest = input
            .event
            .rest
            .as_ref()
            .ok_or(MethodError::MissingData("rest"))?;
        let rest_diff = (rest.home_rest_days - rest.away_rest_days).clamp(-4.0, 4.0);
        let travel = (rest.away_travel_miles.max(0.0) / 1000.0).min(3.0);
        let p = 0.5 + rest_diff * REST_DAY_VALUE + travel * TRAVEL_VALUE;
        let confidence = (0.25 + rest_diff.abs() * 0.05 + travel * 0.02).min(0.6);
        Ok(Estimate::new(
            bounded(p),
            confidence,
            format!(
                "rest {:+.1} day(s), away travelled {:.0} mi",
                rest_diff, rest.away_travel_miles
            ),
        ))
    }
}

// ── Injuries ─────────────────────────────────────────────────────────────────

pub struct InjuryImpact;

impl ScoringMethod for InjuryImpact {
    fn name(&self) -> &str {
        "injury-impact"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let (home, away) = input.injuries.ok_or(MethodError::MissingData("injuries"))?;
        // positive impact weakens that side
        let diff = away - home;
        let p = 0.5 + diff * 0.3;
        let confidence = (diff.abs() * 3.0).min(0.8);
        Ok(Estimate::new(
            bounded(p),
            confidence,
            format!("injury impact home {:.2}, away {:.2}", home, away),
        ))
    }
}

// ── Recent form ──────────────────────────────────────────────────────────────

pub struct RecentForm;

impl ScoringMethod for RecentForm {
    fn name(&self) -> &str {
        "recent-form"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        if input.event.signals.is_empty() {
            return Err(MethodError::MissingData("signals"));
        }
        let impact = input.decay.decayed_impact;
        let p = 0.5 + impact * 0.25;
        let confidence = (impact.abs() * 2.0).min(0.7);
        Ok(Estimate::new(
            bounded(p),
            confidence,
            format!(
                "{} signal(s), decayed impact {:+.3} (factor {:.2})",
                input.event.signals.len(),
                impact,
                input.decay.decay_factor
            ),
        ))
    }
}

// ── Home advantage ───────────────────────────────────────────────────────────

/// Home win-probability points above a coin flip, by sport.
fn home_edge(sport: &str) -> f64 {
    match sport_key(sport).as_str() {
        "nba" | "basketball" => 0.09,
        "nfl" | "american_football" => 0.055,
        "nhl" | "ice_hockey" => 0.05,
        "mlb" | "baseball" => 0.04,
        "ncaa" => 0.07,
        _ => 0.04,
    }
}

pub struct HomeAdvantage;

impl ScoringMethod for HomeAdvantage {
    fn name(&self) -> &str {
        "home-advantage"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let edge = home_edge(&input.event.sport);
        Ok(Estimate::new(
            0.5 + edge,
            0.3,
            format!("{} home edge {:+.3}", sport_key(&input.event.sport), edge),
        ))
    }
}

// ── Weather ──────────────────────────────────────────────────────────────────

pub struct WeatherImpact;

impl ScoringMethod for WeatherImpact {
    fn name(&self) -> &str {
        "weather-impact"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let weather = input
            .event
            .weather
            .as_ref()
            .filter(|w| !w.indoor)
            .ok_or(MethodError::MissingData("outdoor weather"))?;

        let mut impact: f64 = 0.0;
        let conditions = weather.conditions.as_deref().unwrap_or("").to_lowercase();
        if conditions.contains("rain") || conditions.contains("snow") {
            impact += 0.1;
        }
        if weather.wind_mph.is_some_and(|w| w > 20.0) {
            impact += 0.15;
        }
        if weather.temperature_f.is_some_and(|t| t < 20.0) {
            impact += 0.05;
        }

        // the acclimatised home side copes better with bad conditions
        let p = 0.5 + impact * 0.2;
        let confidence = if impact == 0.0 { 0.1 } else { (impact * 5.0).min(0.7) };
        Ok(Estimate::new(
            p,
            confidence,
            format!("weather impact {:.2} ({})", impact, conditions),
        ))
    }
}

fn team_stats<'a>(input: &ScoringInput<'a>) -> Result<&'a MatchupStats, MethodError> {
    input
        .event
        .team_stats
        .as_ref()
        .ok_or(MethodError::MissingData("team stats"))
}

// ── Statistical model ────────────────────────────────────────────────────────

const PYTHAGOREAN_EXPONENT: f64 = 2.37;

/// Share of games a team "should" have won from its scoring.
fn pythagorean(team: &TeamStats) -> Option<f64> {
    let scored = team.points_for.powf(PYTHAGOREAN_EXPONENT);
    let allowed = team.points_against.powf(PYTHAGOREAN_EXPONENT);
    let total = scored + allowed;
    (total > 0.0 && total.is_finite()).then(|| scored / total)
}

/// 60% schedule-adjusted Pythagorean expectation, 40% actual win rate.
fn team_strength(team: &TeamStats) -> Option<f64> {
    let expected = pythagorean(team)?;
    let sos = team.strength_of_schedule.unwrap_or(0.5);
    let adjusted = expected * (1.0 + (sos - 0.5) * 0.1);
    Some(adjusted * 0.6 + team.win_pct()? * 0.4)
}

pub struct StatisticalModel;

impl ScoringMethod for StatisticalModel {
    fn name(&self) -> &str {
        "statistical-model"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let stats = team_stats(input)?;
        let (home, away) = match (team_strength(&stats.home), team_strength(&stats.away)) {
            (Some(h), Some(a)) if h + a > 0.0 => (h, a),
            _ => return Err(MethodError::MissingData("games played and points")),
        };
        let p = home / (home + away);
        Ok(Estimate::new(
            bounded(p),
            (p - 0.5).abs() * 2.0,
            format!("strength {:.3} vs {:.3}", home, away),
        ))
    }
}

// ── Elo ──────────────────────────────────────────────────────────────────────

const ELO_BASE: f64 = 1500.0;
const ELO_SPREAD: f64 = 400.0;
const ELO_HOME_BONUS: f64 = 50.0;

fn elo_from_share(share: f64) -> f64 {
    ELO_BASE + (share - 0.5) * ELO_SPREAD
}

/// Rating from win rate, blended 70/30 with recent scoring against the
/// opponent's recent defence when both are known.
fn elo_rating(team: &TeamStats, opponent: &TeamStats) -> Option<f64> {
    let season = elo_from_share(team.win_pct()?);
    match (team.recent_avg_points, opponent.recent_avg_allowed) {
        (Some(scored), Some(allowed)) if scored + allowed > 0.0 => {
            let recent = elo_from_share(scored / (scored + allowed));
            Some(season * 0.7 + recent * 0.3)
        }
        _ => Some(season),
    }
}

pub struct EloRating;

impl ScoringMethod for EloRating {
    fn name(&self) -> &str {
        "elo-rating"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let stats = team_stats(input)?;
        let (home, away) = match (
            elo_rating(&stats.home, &stats.away),
            elo_rating(&stats.away, &stats.home),
        ) {
            (Some(h), Some(a)) => (h + ELO_HOME_BONUS, a),
            _ => return Err(MethodError::MissingData("games played")),
        };
        let diff = home - away;
        let p = 1.0 / (1.0 + 10f64.powf(-diff / ELO_SPREAD));
        Ok(Estimate::new(
            bounded(p),
            (p - 0.5).abs() * 2.0,
            format!("elo {:.0} vs {:.0} ({:+.0})", home, away, diff),
        ))
    }
}

// ── Momentum ─────────────────────────────────────────────────────────────────

/// Last three results weighted 3/2/1, scaled to [-1, 1].
fn momentum(results: &[GameResult]) -> f64 {
    let sum: f64 = results
        .iter()
        .take(3)
        .zip([3.0, 2.0, 1.0])
        .map(|(r, w)| match r {
            GameResult::Win => w,
            GameResult::Loss => -w,
            GameResult::Draw => 0.0,
        })
        .sum();
    sum / 6.0
}

pub struct Momentum;

impl ScoringMethod for Momentum {
    fn name(&self) -> &str {
        "momentum"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let form = input
            .event
            .recent_form
            .as_ref()
            .filter(|f| !f.home.is_empty() && !f.away.is_empty())
            .ok_or(MethodError::MissingData("recent results"))?;
        let diff = momentum(&form.home) - momentum(&form.away);
        Ok(Estimate::new(
            0.5 + diff * 0.1,
            (diff.abs() * 0.3).min(0.7),
            format!("momentum differential {:+.2}", diff),
        ))
    }
}

// ── Poisson scoreline ────────────────────────────────────────────────────────

/// exp(-λ) underflows past this
const MAX_POISSON_RATE: f64 = 700.0;

fn poisson_pmf(rate: f64) -> Vec<f64> {
    let upper = (rate + 10.0 * rate.sqrt() + 10.0).ceil() as usize;
    let mut pmf = Vec::with_capacity(upper + 1);
    let mut p = (-rate).exp();
    pmf.push(p);
    for k in 1..=upper {
        p *= rate / k as f64;
        pmf.push(p);
    }
    pmf
}

/// `(P(home > away), P(home == away))` for independent Poisson scores.
pub fn poisson_outcome(home_rate: f64, away_rate: f64) -> (f64, f64) {
    let home = poisson_pmf(home_rate);
    let away = poisson_pmf(away_rate);
    let mut away_below = 0.0f64;
    let (mut win, mut draw) = (0.0f64, 0.0f64);
    for (k, ph) in home.iter().enumerate() {
        let pa = away.get(k).copied().unwrap_or(0.0);
        draw += ph * pa;
        win += ph * away_below;
        away_below += pa;
    }
    (win, draw)
}

pub struct PoissonScoreline;

impl ScoringMethod for PoissonScoreline {
    fn name(&self) -> &str {
        "poisson-scoreline"
    }

    fn score(&self, input: &ScoringInput<'_>) -> Result<Estimate, MethodError> {
        let stats = team_stats(input)?;
        let rate = |offence: &TeamStats, defence: &TeamStats| -> Option<f64> {
            Some((offence.scoring_rate()? + defence.allowed_rate()?) / 2.0)
        };
        let rates = (rate(&stats.home, &stats.away), rate(&stats.away, &stats.home));
        let (home_rate, away_rate) = match rates {
            (Some(h), Some(a)) if h > 0.0 && a > 0.0 => (h, a),
            _ => return Err(MethodError::MissingData("scoring rates")),
        };
        if home_rate > MAX_POISSON_RATE || away_rate > MAX_POISSON_RATE {
            return Err(MethodError::Failed(format!(
                "scoring rates {:.1}/{:.1} too large for a Poisson model",
                home_rate, away_rate
            )));
        }
        let (win, draw) = poisson_outcome(home_rate, away_rate);
        let p = win + draw / 2.0;
        Ok(Estimate::new(
            bounded(p),
            ((p - 0.5).abs() * 2.0).min(0.8),
            format!(
                "expected {:.1}-{:.1} (total {:.1}), draw {:.1}%",
                home_rate,
                away_rate,
                home_rate + away_rate,
                draw * 100.0
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{FormGuide, HeadToHead, RestTravel, TemporalEvent, Weather};
    use crate::testing::make_event;
    use approx::assert_relative_eq;

    fn input(event: &GameEvent) -> ScoringInput<'_> {
        ScoringInput {
            event,
            decay: DecayResult::neutral(),
            injuries: None,
        }
    }

    #[test]
    fn defaults_are_registered_once() {
        let registry = MethodRegistry::with_defaults();
        let names = registry.names();
        assert_eq!(names.len(), 11);
        assert!(names.contains(&"market-implied".to_string()));
        assert!(names.contains(&"elo-rating".to_string()));
        assert!(names.contains(&"weather-impact".to_string()));
    }

    #[test]
    fn registering_same_name_replaces() {
        let mut registry = MethodRegistry::with_defaults();
        registry.register_fn("home-advantage", |_| Ok(Estimate::new(0.5, 0.1, "flat")));
        assert_eq!(registry.len(), 11);
        let event = make_event("e1", "nba");
        let m = registry.iter().find(|m| m.name() == "home-advantage").unwrap();
        assert_relative_eq!(m.score(&input(&event)).unwrap().probability, 0.5);
    }

    #[test]
    fn market_implied_devigs_consensus() {
        let event = make_event("e1", "nba");
        let est = MarketImplied.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.5, epsilon = 1e-12);
        assert!(est.confidence > 0.5);
    }

    #[test]
    fn market_implied_needs_both_sides() {
        let mut event = make_event("e1", "nba");
        event.odds.as_mut().unwrap().consensus.away_moneyline = None;
        assert!(matches!(
            MarketImplied.score(&input(&event)),
            Err(MethodError::MissingData(_))
        ));
    }

    #[test]
    fn head_to_head_is_smoothed() {
        let mut event = make_event("e1", "nfl");
        event.head_to_head = Some(HeadToHead {
            home_wins: 1,
            away_wins: 0,
            draws: 0,
        });
        let est = HeadToHeadRecord.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 2.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(est.confidence, 0.05, epsilon = 1e-12);

        event.head_to_head = Some(HeadToHead::default());
        assert!(HeadToHeadRecord.score(&input(&event)).is_err());
    }

    #[test]
    fn rest_and_travel_favour_rested_home() {
        let mut event = make_event("e1", "nba");
        event.rest = Some(RestTravel {
            home_rest_days: 3.0,
            away_rest_days: 1.0,
            away_travel_miles: 2000.0,
        });
        let est = RestTravelEdge.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.5 + 2.0 * 0.015 + 2.0 * 0.01, epsilon = 1e-12);
    }

    #[test]
    fn injuries_use_decayed_values() {
        let event = make_event("e1", "nba");
        let mut inp = input(&event);
        assert!(InjuryImpact.score(&inp).is_err());
        inp.injuries = Some((0.0, 0.2));
        let est = InjuryImpact.score(&inp).unwrap();
        assert_relative_eq!(est.probability, 0.56, epsilon = 1e-12);
        assert_relative_eq!(est.confidence, 0.6, epsilon = 1e-12);
    }

    #[test]
    fn recent_form_follows_decayed_impact() {
        let mut event = make_event("e1", "nba");
        event.signals = vec![TemporalEvent {
            days_ago: 0.0,
            impact: -0.4,
            kind: "form".into(),
        }];
        let mut inp = input(&event);
        inp.decay.decayed_impact = -0.4;
        let est = RecentForm.score(&inp).unwrap();
        assert_relative_eq!(est.probability, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn weather_ignored_indoors() {
        let mut event = make_event("e1", "nfl");
        event.weather = Some(Weather {
            temperature_f: Some(10.0),
            conditions: Some("Snow".into()),
            wind_mph: Some(25.0),
            indoor: true,
        });
        assert!(WeatherImpact.score(&input(&event)).is_err());

        event.weather.as_mut().unwrap().indoor = false;
        let est = WeatherImpact.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.5 + 0.3 * 0.2, epsilon = 1e-12);
        assert_relative_eq!(est.confidence, 0.7, epsilon = 1e-12);
    }

    fn team(wins: u32, losses: u32, points_for: f64, points_against: f64) -> TeamStats {
        TeamStats {
            wins,
            losses,
            points_for,
            points_against,
            ..TeamStats::default()
        }
    }

    fn with_stats(home: TeamStats, away: TeamStats) -> GameEvent {
        let mut event = make_event("e1", "nba");
        event.team_stats = Some(MatchupStats { home, away });
        event
    }

    #[test]
    fn statistical_model_blends_pythagorean_and_record() {
        let mut home = team(10, 5, 1650.0, 1500.0);
        home.strength_of_schedule = Some(0.6);
        let event = with_stats(home, team(6, 9, 1500.0, 1600.0));
        let est = StatisticalModel.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.580_051_477_845_633_9, epsilon = 1e-9);
        assert_relative_eq!(est.confidence, 0.160_102_955_691_267_9, epsilon = 1e-9);
    }

    #[test]
    fn statistical_model_needs_games_played() {
        let event = make_event("e1", "nba");
        assert!(matches!(
            StatisticalModel.score(&input(&event)),
            Err(MethodError::MissingData(_))
        ));
        let event = with_stats(team(0, 0, 0.0, 0.0), team(3, 1, 400.0, 380.0));
        assert!(StatisticalModel.score(&input(&event)).is_err());
    }

    #[test]
    fn elo_adds_home_bonus_and_recent_scoring() {
        let mut event = with_stats(team(10, 5, 0.0, 0.0), team(5, 10, 0.0, 0.0));
        let est = EloRating.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.741_801_209_395_884_2, epsilon = 1e-9);

        // equal records still favour the home side by the bonus alone
        let even = with_stats(team(5, 5, 0.0, 0.0), team(5, 5, 0.0, 0.0));
        let p = EloRating.score(&input(&even)).unwrap().probability;
        assert_relative_eq!(p, 1.0 / (1.0 + 10f64.powf(-50.0 / 400.0)), epsilon = 1e-12);

        let stats = event.team_stats.as_mut().unwrap();
        stats.home.recent_avg_points = Some(110.0);
        stats.home.recent_avg_allowed = Some(110.0);
        stats.away.recent_avg_points = Some(100.0);
        stats.away.recent_avg_allowed = Some(100.0);
        let est = EloRating.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.702_239_922_919_266_6, epsilon = 1e-9);
    }

    #[test]
    fn momentum_weights_latest_results() {
        let mut event = make_event("e1", "nfl");
        assert!(Momentum.score(&input(&event)).is_err());
        event.recent_form = Some(FormGuide {
            home: vec![GameResult::Win, GameResult::Win, GameResult::Loss],
            away: vec![GameResult::Loss, GameResult::Loss, GameResult::Win, GameResult::Win],
        });
        let est = Momentum.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.5 + (4.0 / 3.0) * 0.1, epsilon = 1e-12);
        assert_relative_eq!(est.confidence, 0.4, epsilon = 1e-12);

        event.recent_form = Some(FormGuide {
            home: vec![GameResult::Draw],
            away: vec![],
        });
        assert!(Momentum.score(&input(&event)).is_err());
    }

    #[test]
    fn poisson_outcome_is_symmetric_for_equal_rates() {
        let (win, draw) = poisson_outcome(1.5, 1.5);
        assert_relative_eq!(win + draw / 2.0, 0.5, epsilon = 1e-12);
        assert_relative_eq!(draw, 0.243_000_354_161_825_4, epsilon = 1e-9);
    }

    #[test]
    fn poisson_scoreline_favours_higher_rate() {
        let mut home = team(4, 4, 0.0, 0.0);
        home.recent_avg_points = Some(2.5);
        home.recent_avg_allowed = Some(1.0);
        let mut away = team(4, 4, 0.0, 0.0);
        away.recent_avg_points = Some(1.0);
        away.recent_avg_allowed = Some(1.5);
        // home rate (2.5 + 1.5) / 2 = 2, away rate (1 + 1) / 2 = 1
        let event = with_stats(home, away);
        let est = PoissonScoreline.score(&input(&event)).unwrap();
        assert_relative_eq!(est.probability, 0.711_559_183_088_640_4, epsilon = 1e-9);
        assert!(est.rationale.contains("total 3.0"));
    }

    #[test]
    fn out_of_range_estimate_is_rejected() {
        let err = Estimate::new(1.2, 0.5, "bad").into_score("x").unwrap_err();
        assert!(matches!(err, MethodError::InvalidOutput(_)));
        assert!(Estimate::new(0.5, f64::NAN, "nan").into_score("x").is_err());
    }
}
