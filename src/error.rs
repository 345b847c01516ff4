use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    /// A model operation was attempted before `build`.
    #[error("precondition violated: {0}")]
    PreconditionViolation(String),

    #[error("model capacity exhausted: {0}")]
    CapacityExhausted(String),

    #[error("a training session is already in progress")]
    TrainingInProgress,

    #[error("training batch exceeded timeout of {0:?}")]
    TrainingTimeout(Duration),

    #[error("training session was cancelled")]
    TrainingCancelled,

    #[error("transient ingestion failure: {0}")]
    TransientIngestionFailure(String),

    #[error("invalid interaction: {0}")]
    InvalidInteraction(String),

    #[error("invalid recommendation options: {0}")]
    InvalidOptions(String),

    #[error("invalid model parameters: {0}")]
    InvalidParameters(String),

    #[error(transparent)]
    Collaborator(#[from] anyhow::Error),
}

impl EngineError {
    /// Whether the caller may retry the same call later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            EngineError::TrainingInProgress
                | EngineError::TrainingTimeout(_)
                | EngineError::TransientIngestionFailure(_)
        )
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
