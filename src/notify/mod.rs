//! Outbound alerts for new recommendations.
//!
//! Sinks are fired after the prediction is persisted; a failing sink only
//! produces a warning.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};
use url::Url;

use crate::db::models::{PredictionRecord, Side};
use crate::engine::stake::StakeRecommendation;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PredictionAlert {
    pub prediction_id: Option<i64>,
    pub event_id: String,
    pub sport: String,
    pub league: Option<String>,
    pub home_team: String,
    pub away_team: String,
    pub scheduled_at: DateTime<Utc>,
    pub selection: String,
    pub side: Side,
    pub probability: f64,
    pub confidence: f64,
    pub edge: f64,
    pub american_odds: f64,
    pub stake_fraction: f64,
    pub recommended_stake: f64,
}

impl PredictionAlert {
    pub fn new(prediction: &PredictionRecord, stake: &StakeRecommendation) -> Self {
        PredictionAlert {
            prediction_id: prediction.id,
            event_id: prediction.event_id.clone(),
            sport: prediction.sport.clone(),
            league: prediction.league.clone(),
            home_team: prediction.home_team.clone(),
            away_team: prediction.away_team.clone(),
            scheduled_at: prediction.scheduled_at,
            selection: prediction.selection().to_string(),
            side: prediction.side,
            probability: prediction.side_probability,
            confidence: prediction.confidence,
            edge: prediction.edge,
            american_odds: prediction.american_odds,
            stake_fraction: stake.fraction,
            recommended_stake: stake.stake,
        }
    }

    pub fn headline(&self) -> String {
        format!(
            "{} vs {}: back {} @ {:+} (p={:.1}%, edge={:+.2}%, stake {:.0})",
            self.home_team,
            self.away_team,
            self.selection,
            self.american_odds,
            self.probability * 100.0,
            self.edge * 100.0,
            self.recommended_stake
        )
    }
}

/// Trait that every alert destination must implement.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, alert: &PredictionAlert) -> Result<()>;

    /// Human-readable name for logging.
    fn name(&self) -> &str;
}

/// Writes alerts to the tracing log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogSink;

#[async_trait]
impl AlertSink for LogSink {
    async fn send(&self, alert: &PredictionAlert) -> Result<()> {
        info!("ALERT {}", alert.headline());
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// POSTs each alert as JSON to a webhook.
#[derive(Clone)]
pub struct WebhookSink {
    http: Client,
    url: Url,
}

impl WebhookSink {
    pub fn new(url: &str) -> Result<Self> {
        let url = Url::parse(url).with_context(|| format!("Invalid webhook URL '{}'", url))?;
        if url.scheme() != "http" && url.scheme() != "https" {
            bail!("Webhook URL must be http(s), got '{}'", url.scheme());
        }
        let http = Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(WebhookSink { http, url })
    }

    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl AlertSink for WebhookSink {
    async fn send(&self, alert: &PredictionAlert) -> Result<()> {
        let resp = self
            .http
            .post(self.url.clone())
            .json(alert)
            .send()
            .await
            .context("Webhook request failed")?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            bail!("Webhook returned {}: {}", status, body);
        }
        debug!("Alert for {} delivered to {}", alert.event_id, self.url);
        Ok(())
    }

    fn name(&self) -> &str {
        "webhook"
    }
}

/// Delivers to every inner sink concurrently.
#[derive(Clone, Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AlertSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn AlertSink>>) -> Self {
        FanoutSink { sinks }
    }

    pub fn push(&mut self, sink: Arc<dyn AlertSink>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

#[async_trait]
impl AlertSink for FanoutSink {
    /// Fails only when every sink failed.
    async fn send(&self, alert: &PredictionAlert) -> Result<()> {
        if self.sinks.is_empty() {
            return Ok(());
        }
        let results =
            futures_util::future::join_all(self.sinks.iter().map(|s| s.send(alert))).await;
        let mut failed = 0usize;
        for (sink, result) in self.sinks.iter().zip(results) {
            if let Err(e) = result {
                failed += 1;
                warn!("Alert sink {} failed: {:#}", sink.name(), e);
            }
        }
        if failed == self.sinks.len() {
            bail!("All {} alert sink(s) failed", failed);
        }
        Ok(())
    }

    fn name(&self) -> &str {
        "fanout"
    }
}
