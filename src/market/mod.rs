pub mod aggregator;
pub mod divergence;
pub mod price;

pub use aggregator::{AggregatorConfig, OddsAggregator};
pub use divergence::{DivergenceConfig, DivergenceDetector, DivergenceReport, MarketSignal};
