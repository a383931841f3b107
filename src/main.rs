use anyhow::{Context, Result};
use clap::Parser;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{info, warn};

use edge_engine::config::{Command, Config};
use edge_engine::db::models::{sport_key, EventResult, GameEvent, OddsQuote, OddsSnapshot};
use edge_engine::db::Database;
use edge_engine::engine::{
    Calibrator, LearningCycle, MethodRegistry, MethodWeightTracker, PredictionEngine,
    StakeOptimizer, TemporalDecayCalculator,
};
use edge_engine::market::{DivergenceDetector, OddsAggregator};
use edge_engine::notify::{AlertSink, FanoutSink, LogSink, PredictionAlert, WebhookSink};
use edge_engine::CoreError;

/// Input files hold either a single object or an array of them.
#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

impl<T> OneOrMany<T> {
    fn into_vec(self) -> Vec<T> {
        match self {
            OneOrMany::Many(v) => v,
            OneOrMany::One(t) => vec![t],
        }
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse {}", path.display()))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn weight_tracker(config: &Config, db: &Database, registry: &MethodRegistry) -> MethodWeightTracker {
    MethodWeightTracker::new(
        db.clone(),
        registry.names(),
        config.weight_config(),
        config.retry_policy(),
    )
}

fn alert_sinks(config: &Config) -> Result<FanoutSink> {
    let mut sinks = FanoutSink::default();
    sinks.push(Arc::new(LogSink));
    if let Some(url) = &config.alert_webhook_url {
        sinks.push(Arc::new(WebhookSink::new(url)?));
        info!("Webhook alerts enabled");
    }
    Ok(sinks)
}

/// Ingest quotes with one blocking task per event; quotes of the same event
/// keep their file order.
async fn ingest_quotes(aggregator: OddsAggregator, quotes: Vec<OddsQuote>) -> Result<Vec<OddsSnapshot>> {
    let mut by_event: BTreeMap<String, Vec<OddsQuote>> = BTreeMap::new();
    for quote in quotes {
        by_event.entry(quote.event_id.clone()).or_default().push(quote);
    }
    let tasks: Vec<_> = by_event
        .into_values()
        .map(|quotes| {
            let aggregator = aggregator.clone();
            tokio::task::spawn_blocking(move || {
                let mut last = None;
                for quote in quotes {
                    last = Some(aggregator.ingest(quote)?);
                }
                Ok::<_, CoreError>(last)
            })
        })
        .collect();

    let mut snapshots = Vec::new();
    for joined in futures_util::future::join_all(tasks).await {
        if let Some(snapshot) = joined.context("Ingest task panicked")?? {
            snapshots.push(snapshot);
        }
    }
    Ok(snapshots)
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    let db = Database::open(&config.database_path)
        .with_context(|| format!("Failed to open database {}", config.database_path))?;
    info!("Database opened: {}", config.database_path);

    let aggregator = OddsAggregator::new(
        db.clone(),
        config.aggregator_config(),
        config.retry_policy(),
    );

    match &config.command {
        Command::IngestQuote { file } => {
            let quotes = read_json::<OneOrMany<OddsQuote>>(file)?.into_vec();
            info!("Ingesting {} quote(s)", quotes.len());
            let snapshots = ingest_quotes(aggregator, quotes).await?;
            print_json(&snapshots)?;
        }

        Command::RecordResult { file } => {
            let results = read_json::<OneOrMany<EventResult>>(file)?.into_vec();
            for result in &results {
                db.upsert_event_result(result)?;
            }
            info!("Recorded {} result(s)", results.len());
        }

        Command::Predict {
            file,
            stake_bankroll,
        } => {
            let mut event: GameEvent = read_json(file)?;
            if event.odds.is_none() {
                match aggregator.get_consensus(&event.id) {
                    Ok(snapshot) => event.odds = Some(snapshot),
                    Err(CoreError::InsufficientMarketData { .. }) => {}
                    Err(e) => return Err(e.into()),
                }
            }

            let registry = MethodRegistry::with_defaults();
            let tracker = weight_tracker(&config, &db, &registry);
            let engine = PredictionEngine::new(
                db.clone(),
                registry,
                tracker,
                TemporalDecayCalculator::new(config.decay_config()),
                Calibrator::new(db.clone(), config.calibration_config()),
            );
            let record = engine
                .predict(&event)
                .with_context(|| format!("Prediction failed for event {}", event.id))?;

            let bankroll = stake_bankroll.unwrap_or(config.bankroll);
            let stake = StakeOptimizer::new(config.stake_config()).recommend(&record, bankroll);
            if stake.is_bet() {
                let alert = PredictionAlert::new(&record, &stake);
                if let Err(e) = alert_sinks(&config)?.send(&alert).await {
                    warn!("Alert delivery failed: {:#}", e);
                }
            }
            print_json(&serde_json::json!({ "prediction": record, "stake": stake }))?;
        }

        Command::Learn { sport } => {
            let registry = MethodRegistry::with_defaults();
            let cycle = LearningCycle::new(
                db.clone(),
                weight_tracker(&config, &db, &registry),
                Calibrator::new(db.clone(), config.calibration_config()),
                config.retry_policy().lease_ttl,
            );
            let sport = sport.clone();
            let summary = tokio::task::spawn_blocking(move || cycle.run(sport.as_deref()))
                .await
                .context("Learning cycle panicked")??;
            print_json(&summary)?;
        }

        Command::Consensus { event_id } => {
            let snapshot = aggregator.get_consensus(event_id)?;
            print_json(&snapshot)?;
        }

        Command::Weights { sport } => {
            let registry = MethodRegistry::with_defaults();
            let tracker = weight_tracker(&config, &db, &registry);
            let weights = tracker.get_weights(sport)?;
            let performance = tracker.get_performance(sport)?;
            let table: BTreeMap<_, _> = weights
                .into_iter()
                .map(|(method, weight)| {
                    let perf = performance.get(&method).copied();
                    (method, serde_json::json!({ "weight": weight, "performance": perf }))
                })
                .collect();
            print_json(&table)?;
        }

        Command::Divergence {
            public_pct,
            sharp_pct,
            line_movement,
            event_id,
        } => {
            let movement = match (line_movement, event_id) {
                (Some(m), _) => *m,
                (None, Some(id)) => aggregator.get_consensus(id)?.spread_movement(),
                (None, None) => 0.0,
            };
            let report = DivergenceDetector::new(config.divergence_config()).compare(
                *public_pct,
                *sharp_pct,
                movement,
            );
            print_json(&report)?;
        }

        Command::Stake {
            prediction_id,
            stake_bankroll,
        } => {
            let record = db
                .get_prediction(*prediction_id)?
                .ok_or(CoreError::NotFound {
                    kind: "prediction",
                    id: prediction_id.to_string(),
                })?;
            let bankroll = stake_bankroll.unwrap_or(config.bankroll);
            let stake = StakeOptimizer::new(config.stake_config()).recommend(&record, bankroll);
            print_json(&stake)?;
        }

        Command::Stats { sport, limit } => {
            let sport = sport.as_deref().map(sport_key);
            let stats = db.prediction_stats(sport.as_deref())?;
            let recent = db.list_predictions(sport.as_deref(), *limit, 0)?;
            let recent: Vec<_> = recent
                .iter()
                .map(|p| {
                    serde_json::json!({
                        "id": p.id,
                        "event_id": p.event_id,
                        "sport": p.sport,
                        "selection": p.selection(),
                        "edge": p.edge,
                        "status": p.status,
                    })
                })
                .collect();
            print_json(&serde_json::json!({
                "stats": stats,
                "hit_rate": stats.hit_rate(),
                "recent": recent,
            }))?;
        }
    }

    Ok(())
}
