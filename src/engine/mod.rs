pub mod calibration;
pub mod decay;
pub mod learning;
pub mod methods;
pub mod predictor;
pub mod stake;
pub mod weights;

pub use calibration::{CalibrationConfig, Calibrator, PlattScaler};
pub use decay::{DecayConfig, DecayResult, TemporalDecayCalculator};
pub use learning::{CycleSummary, LearningCycle};
pub use methods::{Estimate, MethodRegistry, ScoringInput, ScoringMethod};
pub use predictor::PredictionEngine;
pub use stake::{kelly_fraction, StakeConfig, StakeOptimizer, StakeRecommendation};
pub use weights::{MethodOutcome, MethodWeightTracker, WeightConfig};
