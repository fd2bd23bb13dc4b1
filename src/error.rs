use std::time::Duration;
use thiserror::Error;

/// Result type for pipeline operations
pub type Result<T> = std::result::Result<T, PipelineError>;

/// Error type returned by user-supplied transforms, sources and sinks
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Result type returned by user-supplied transforms
pub type TransformResult<T> = std::result::Result<T, BoxError>;

/// Errors that can occur while building or running a pipeline
#[derive(Error, Debug)]
pub enum PipelineError {
    /// Operation attempted on a closed channel
    #[error("channel is closed")]
    ChannelClosed,

    /// Invalid pipeline topology or backend configuration
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// A stage failed while processing
    #[error(transparent)]
    Stage(#[from] StageError),

    /// A bounded wait exceeded its deadline
    #[error("timed out after {0:?}")]
    TimedOut(Duration),

    /// The pipeline was cancelled before it completed
    #[error("pipeline was cancelled")]
    Cancelled,

    /// A backend worker could not be spawned, joined or talked to
    #[error("worker error: {0}")]
    WorkerError(String),
}

impl PipelineError {
    pub(crate) fn config(message: impl Into<String>) -> Self {
        PipelineError::ConfigError(message.into())
    }

    /// Returns true for the recoverable timeout kind
    pub fn is_timeout(&self) -> bool {
        matches!(self, PipelineError::TimedOut(_))
    }
}

/// Failure of a single stage, carried in reports and across process boundaries
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("stage `{stage_name}` failed on {item_context}: {cause}")]
pub struct StageError {
    pub stage_name: String,
    pub item_context: String,
    pub cause: String,
}

impl StageError {
    /// Failure of `stage_name` while handling the item described by `item_context`
    pub fn new(
        stage_name: impl Into<String>,
        item_context: impl Into<String>,
        cause: impl ToString,
    ) -> Self {
        Self {
            stage_name: stage_name.into(),
            item_context: item_context.into(),
            cause: cause.to_string(),
        }
    }
}
