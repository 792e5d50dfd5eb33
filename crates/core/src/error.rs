use thiserror::Error;

pub type PivotResult<T> = Result<T, PivotError>;
pub type StoreResult<T> = Result<T, StoreError>;

/// Failure of a whole store batch. When a batch fails none of its operations
/// are visible to other batches.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store backend error: {0}")]
    Backend(String),

    #[error("Store connection error: {0}")]
    Connection(String),

    #[error("Wrong type at key {key}: expected {expected}")]
    WrongType { key: String, expected: &'static str },

    #[error("Unexpected reply to {op}: {detail}")]
    UnexpectedReply { op: &'static str, detail: String },

    #[error("Injected store failure: {0}")]
    Injected(String),
}

#[derive(Error, Debug)]
pub enum PivotError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Feature not registered: {0}")]
    UnknownFeature(String),

    #[error("Variant {variant} is not an arm of feature {feature}")]
    UnknownVariant { feature: String, variant: String },

    #[error("Invalid feature definition: {0}")]
    InvalidFeature(String),

    #[error("Reward must be finite, got {0}")]
    InvalidReward(f64),

    #[error("Corrupt bandit state at {key}: {detail}")]
    CorruptState { key: String, detail: String },

    /// Counts were incremented but the running means were not written back.
    #[error("Reward counted but values not updated for {features:?}: {source}")]
    PartialReward {
        features: Vec<String>,
        #[source]
        source: StoreError,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl From<config::ConfigError> for PivotError {
    fn from(err: config::ConfigError) -> Self {
        PivotError::Config(err.to_string())
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_converts_transparently() {
        let err: PivotError = StoreError::Backend("connection reset".to_string()).into();
        assert!(matches!(err, PivotError::Store(_)));
        assert_eq!(err.to_string(), "Store backend error: connection reset");
    }

    #[test]
    fn test_partial_reward_keeps_source() {
        let err = PivotError::PartialReward {
            features: vec!["checkout".to_string()],
            source: StoreError::Injected("batch 2".to_string()),
        };
        let source = std::error::Error::source(&err).map(|s| s.to_string());
        assert_eq!(source.as_deref(), Some("Injected store failure: batch 2"));
    }
}
