//! Error types shared by every component boundary.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, CoreError>;

#[derive(Debug, Error)]
pub enum CoreError {
    /// No usable price for the event; a prediction without a price has no edge.
    #[error("insufficient market data for event {event_id}")]
    InsufficientMarketData { event_id: String },

    #[error("malformed event {event_id}: {reason}")]
    MalformedEvent { event_id: String, reason: String },

    /// Every scoring method failed or carried zero effective weight.
    #[error("no usable method scores for event {event_id}")]
    NoUsableScores { event_id: String },

    #[error("lock contention on {key}")]
    ConcurrencyConflict { key: String },

    #[error("gave up on {key} after {attempts} attempts")]
    Transient { key: String, attempts: u32 },

    #[error("data integrity violation: {0}")]
    DataIntegrity(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("database connection lock poisoned")]
    LockPoisoned,
}

impl CoreError {
    /// Only lock contention is worth retrying; input and integrity errors never are.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoreError::ConcurrencyConflict { .. } | CoreError::Transient { .. }
        )
    }

    pub fn malformed(event_id: &str, reason: impl Into<String>) -> Self {
        CoreError::MalformedEvent {
            event_id: event_id.to_string(),
            reason: reason.into(),
        }
    }
}

/// Failure of a single scoring plugin. Isolated by the engine, never fatal.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum MethodError {
    #[error("missing input: {0}")]
    MissingData(&'static str),

    #[error("invalid output: {0}")]
    InvalidOutput(String),

    #[error("{0}")]
    Failed(String),
}
