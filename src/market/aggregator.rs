//! Multi-book odds consensus.
//!
//! Keeps the latest quote per (event, source) and reconciles them into one
//! line by taking the **median** of each field across sources that are fresh
//! at ingest time, so a single off-market book cannot drag the consensus. Every recomputation is appended
//! to the event's movement history; freeze/steam signals are read from there.
//!
//! Moneyline medians are taken on implied probabilities and converted back to
//! American odds. For an odd number of books this is exactly the median of
//! the raw prices (the map is monotone); for an even number it averages the
//! two middle books in a space that has no jump at ±100.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};

use crate::db::lock::{RetryPolicy, RowLock};
use crate::db::models::{ConsensusLine, OddsQuote, OddsSnapshot};
use crate::db::Database;
use crate::error::{CoreError, Result};

use super::price::{american_to_implied, implied_to_american, is_valid_american};

#[derive(Debug, Clone)]
pub struct AggregatorConfig {
    /// Staleness threshold for sources without an override
    pub default_staleness: Duration,
    /// Per-source thresholds (keyed by lowercase source id)
    pub source_staleness: HashMap<String, Duration>,
}

impl Default for AggregatorConfig {
    fn default() -> Self {
        Self {
            default_staleness: Duration::from_secs(24 * 60 * 60),
            source_staleness: HashMap::new(),
        }
    }
}

impl AggregatorConfig {
    pub fn staleness_for(&self, source: &str) -> Duration {
        self.source_staleness
            .get(&source.trim().to_lowercase())
            .copied()
            .unwrap_or(self.default_staleness)
    }
}

#[derive(Clone)]
pub struct OddsAggregator {
    db: Database,
    config: AggregatorConfig,
    retry: RetryPolicy,
}

impl OddsAggregator {
    pub fn new(db: Database, config: AggregatorConfig, retry: RetryPolicy) -> Self {
        OddsAggregator { db, config, retry }
    }

    /// Store a quote and recompute the event's consensus as of now.
    ///
    /// The insert → read latest → median → append history sequence runs under
    /// the event's lease, so concurrent ingests for one event cannot lose a
    /// history entry.
    pub fn ingest(&self, quote: OddsQuote) -> Result<OddsSnapshot> {
        self.ingest_at(quote, Utc::now())
    }

    /// `ingest` with an explicit clock. The quote is stored even when no
    /// source is fresh at `now`, but then no consensus is recorded.
    pub fn ingest_at(&self, quote: OddsQuote, now: DateTime<Utc>) -> Result<OddsSnapshot> {
        validate_quote(&quote)?;
        let lock = RowLock::acquire(&self.db, &format!("odds:{}", quote.event_id), &self.retry)?;

        self.db.insert_quote(&quote)?;
        let latest = self.db.latest_quotes(&quote.event_id)?;
        let line = self.compute_consensus(&latest, now).ok_or_else(|| {
            CoreError::InsufficientMarketData {
                event_id: quote.event_id.clone(),
            }
        })?;
        self.db.append_movement(&quote.event_id, &line)?;
        let history = self.db.movement_history(&quote.event_id)?;
        lock.release()?;

        debug!(
            "Consensus {} from {} source(s): home={:?} away={:?} spread={:?} total={:?}",
            quote.event_id,
            line.source_count,
            line.home_moneyline,
            line.away_moneyline,
            line.spread,
            line.total
        );

        Ok(OddsSnapshot {
            event_id: quote.event_id,
            consensus: line,
            history,
        })
    }

    /// Latest consensus plus its full history.
    pub fn get_consensus(&self, event_id: &str) -> Result<OddsSnapshot> {
        let history = self.db.movement_history(event_id)?;
        let consensus = history
            .last()
            .cloned()
            .ok_or_else(|| CoreError::InsufficientMarketData {
                event_id: event_id.to_string(),
            })?;
        Ok(OddsSnapshot {
            event_id: event_id.to_string(),
            consensus,
            history,
        })
    }

    pub fn get_movement_history(&self, event_id: &str) -> Result<Vec<ConsensusLine>> {
        self.db.movement_history(event_id)
    }

    /// Median line over the sources in `quotes` (latest per source) that are
    /// still fresh at `now`. `None` when no source is fresh.
    pub fn compute_consensus(&self, quotes: &[OddsQuote], now: DateTime<Utc>) -> Option<ConsensusLine> {
        let fresh: Vec<&OddsQuote> = quotes.iter().filter(|q| self.is_fresh(q, now)).collect();
        if fresh.is_empty() {
            if let Some(q) = quotes.first() {
                info!("No fresh source for {} ({} stale)", q.event_id, quotes.len());
            }
            return None;
        }

        let excluded = quotes.len() - fresh.len();
        if excluded > 0 {
            info!(
                "Excluded {} stale source(s) from consensus for {}",
                excluded, quotes[0].event_id
            );
        }

        Some(ConsensusLine {
            home_moneyline: moneyline_median(fresh.iter().filter_map(|q| q.home_moneyline)),
            away_moneyline: moneyline_median(fresh.iter().filter_map(|q| q.away_moneyline)),
            spread: median(fresh.iter().filter_map(|q| q.spread).collect()),
            total: median(fresh.iter().filter_map(|q| q.total).collect()),
            source_count: fresh.len(),
            computed_at: now,
        })
    }

    fn is_fresh(&self, quote: &OddsQuote, now: DateTime<Utc>) -> bool {
        let age = now - quote.fetched_at;
        match age.to_std() {
            Ok(age) => age <= self.config.staleness_for(&quote.source),
            // stamped ahead of our clock
            Err(_) => true,
        }
    }
}

fn validate_quote(quote: &OddsQuote) -> Result<()> {
    if quote.event_id.trim().is_empty() {
        return Err(CoreError::malformed(&quote.event_id, "quote has no event id"));
    }
    if quote.source.trim().is_empty() {
        return Err(CoreError::malformed(&quote.event_id, "quote has no source"));
    }
    for (name, value) in [
        ("home_moneyline", quote.home_moneyline),
        ("away_moneyline", quote.away_moneyline),
    ] {
        if let Some(v) = value {
            if !is_valid_american(v) {
                return Err(CoreError::malformed(
                    &quote.event_id,
                    format!("{} {} is not a valid American price", name, v),
                ));
            }
        }
    }
    for (name, value) in [("spread", quote.spread), ("total", quote.total)] {
        if matches!(value, Some(v) if !v.is_finite()) {
            return Err(CoreError::malformed(&quote.event_id, format!("{} is not finite", name)));
        }
    }
    Ok(())
}

/// Median of a set; mean of the two middle values for even counts.
pub fn median(mut values: Vec<f64>) -> Option<f64> {
    values.retain(|v| v.is_finite());
    if values.is_empty() {
        return None;
    }
    values.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
    let mid = values.len() / 2;
    if values.len() % 2 == 1 {
        Some(values[mid])
    } else {
        Some((values[mid - 1] + values[mid]) / 2.0)
    }
}

fn moneyline_median(prices: impl Iterator<Item = f64>) -> Option<f64> {
    let implied = median(prices.map(american_to_implied).collect())?;
    Some(round_cents(implied_to_american(implied)))
}

fn round_cents(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use chrono::{Duration as ChronoDuration, TimeZone};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 4, 17, 0, 0).unwrap()
    }

    fn quote(source: &str, home: f64, minutes: i64) -> OddsQuote {
        OddsQuote {
            event_id: "nfl-kc-buf".into(),
            source: source.into(),
            home_moneyline: Some(home),
            away_moneyline: None,
            spread: None,
            total: None,
            fetched_at: t0() + ChronoDuration::minutes(minutes),
        }
    }

    /// Clock for ingests: two hours after the first quote.
    fn now() -> DateTime<Utc> {
        t0() + ChronoDuration::hours(2)
    }

    fn aggregator() -> OddsAggregator {
        let db = Database::open_in_memory().unwrap();
        OddsAggregator::new(db, AggregatorConfig::default(), RetryPolicy::default())
    }

    #[test]
    fn median_resists_outlier_book() {
        let agg = aggregator();
        agg.ingest_at(quote("book-a", 100.0, 0), now()).unwrap();
        agg.ingest_at(quote("book-b", 105.0, 1), now()).unwrap();
        let snap = agg.ingest_at(quote("book-c", 300.0, 2), now()).unwrap();
        assert_relative_eq!(snap.consensus.home_moneyline.unwrap(), 105.0, epsilon = 1e-9);
        assert_eq!(snap.consensus.source_count, 3);
    }

    #[test]
    fn history_appends_on_every_recompute() {
        let agg = aggregator();
        agg.ingest_at(quote("book-a", -110.0, 0), now()).unwrap();
        let two = agg.ingest_at(quote("book-b", -120.0, 1), now()).unwrap();
        assert_eq!(two.history.len(), 2);
        assert_relative_eq!(two.history[0].home_moneyline.unwrap(), -110.0, epsilon = 1e-9);
        let consensus = two.consensus.home_moneyline.unwrap();
        assert!(consensus < -110.0 && consensus > -120.0);

        let three = agg.ingest_at(quote("book-c", -105.0, 2), now()).unwrap();
        assert_eq!(three.history.len(), 3);
        assert_eq!(three.history[..2], two.history[..]);
        assert_relative_eq!(three.consensus.home_moneyline.unwrap(), -110.0, epsilon = 1e-9);
        assert_eq!(agg.get_movement_history("nfl-kc-buf").unwrap().len(), 3);
    }

    #[test]
    fn newer_quote_supersedes_same_source() {
        let agg = aggregator();
        agg.ingest_at(quote("book-a", -110.0, 0), now()).unwrap();
        agg.ingest_at(quote("book-b", -130.0, 1), now()).unwrap();
        let snap = agg.ingest_at(quote("book-a", -150.0, 2), now()).unwrap();
        assert_eq!(snap.consensus.source_count, 2);
        // median of -150 and -130 in probability space
        let home = snap.consensus.home_moneyline.unwrap();
        assert!(home < -130.0 && home > -150.0);
    }

    #[test]
    fn stale_sources_are_excluded_but_kept() {
        let mut config = AggregatorConfig::default();
        config
            .source_staleness
            .insert("slowbook".into(), Duration::from_secs(600));
        let agg = OddsAggregator::new(
            Database::open_in_memory().unwrap(),
            config,
            RetryPolicy::default(),
        );
        agg.ingest_at(quote("slowbook", 300.0, 0), t0()).unwrap();
        let snap = agg
            .ingest_at(quote("fastbook", 120.0, 30), t0() + ChronoDuration::minutes(30))
            .unwrap();
        assert_eq!(snap.consensus.source_count, 1);
        assert_relative_eq!(snap.consensus.home_moneyline.unwrap(), 120.0, epsilon = 1e-9);
        assert_eq!(snap.history.len(), 2);
        assert_eq!(agg.db.latest_quotes("nfl-kc-buf").unwrap().len(), 2);
    }

    #[test]
    fn staleness_is_measured_against_the_clock_not_the_newest_book() {
        let agg = aggregator();
        let days_ago = |d: i64| {
            let mut q = quote("book-a", -110.0, 0);
            q.fetched_at = now() - ChronoDuration::days(d);
            q
        };
        // a lone two-day-old book is not a market
        let err = agg.ingest_at(days_ago(2), now()).unwrap_err();
        assert!(matches!(err, CoreError::InsufficientMarketData { .. }));

        let mut old_b = days_ago(2);
        old_b.source = "book-b".into();
        old_b.home_moneyline = Some(-200.0);
        assert!(agg.ingest_at(old_b, now()).is_err());
        assert!(agg.get_movement_history("nfl-kc-buf").unwrap().is_empty());

        let snap = agg.ingest_at(quote("book-c", 120.0, 90), now()).unwrap();
        assert_eq!(snap.consensus.source_count, 1);
        assert_eq!(snap.consensus.computed_at, now());
        assert_relative_eq!(snap.consensus.home_moneyline.unwrap(), 120.0, epsilon = 1e-9);
    }

    #[test]
    fn consensus_for_unknown_event_is_insufficient_data() {
        let agg = aggregator();
        match agg.get_consensus("nope") {
            Err(CoreError::InsufficientMarketData { event_id }) => assert_eq!(event_id, "nope"),
            other => panic!("Expected InsufficientMarketData, got {:?}", other),
        }
    }

    #[test]
    fn invalid_price_is_rejected_before_any_write() {
        let agg = aggregator();
        let err = agg.ingest_at(quote("book-a", 50.0, 0), now()).unwrap_err();
        assert!(matches!(err, CoreError::MalformedEvent { .. }));
        assert!(agg.get_movement_history("nfl-kc-buf").unwrap().is_empty());
    }

    #[test]
    fn spread_and_total_use_plain_median() {
        let agg = aggregator();
        for (i, (spread, total)) in [(-3.0, 47.5), (-3.5, 48.0), (-2.5, 46.5), (-3.0, 47.0)]
            .into_iter()
            .enumerate()
        {
            let mut q = quote(&format!("book-{}", i), -150.0, i as i64);
            q.spread = Some(spread);
            q.total = Some(total);
            agg.ingest_at(q, now()).unwrap();
        }
        let snap = agg.get_consensus("nfl-kc-buf").unwrap();
        assert_relative_eq!(snap.consensus.spread.unwrap(), -3.0, epsilon = 1e-12);
        assert_relative_eq!(snap.consensus.total.unwrap(), 47.25, epsilon = 1e-12);
        assert_relative_eq!(snap.spread_movement(), 0.0, epsilon = 1e-12);
    }

    #[test]
    fn concurrent_ingests_do_not_lose_history() {
        let agg = OddsAggregator::new(
            Database::open_in_memory().unwrap(),
            AggregatorConfig::default(),
            RetryPolicy {
                max_attempts: 200,
                base_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                lease_ttl: Duration::from_secs(30),
            },
        );
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let agg = agg.clone();
                std::thread::spawn(move || {
                    for j in 0..5 {
                        let q = quote(&format!("book-{}", i), -110.0 - j as f64, i * 10 + j);
                        agg.ingest_at(q, now()).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(agg.get_movement_history("nfl-kc-buf").unwrap().len(), 40);
    }
}
