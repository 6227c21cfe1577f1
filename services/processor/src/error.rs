use thiserror::Error;

/// Errors raised by the filter pipeline and its storage collaborators
#[derive(Error, Debug, Clone, PartialEq)]
pub enum PipelineError {
    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Invalid processing parameters: {0}")]
    InvalidParameters(String),

    #[error("Image processing failed: {0}")]
    ProcessingFailed(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Queue unavailable: {0}")]
    QueueUnavailable(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),
}

impl PipelineError {
    /// Whether a later redelivery of the same work could succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::StorageUnavailable(_)
                | PipelineError::QueueUnavailable(_)
                | PipelineError::ProcessingFailed(_)
        )
    }

    /// Short machine-readable code, used in batch results and metric labels
    pub fn code(&self) -> &'static str {
        match self {
            PipelineError::Decode(_) => "DECODE_ERROR",
            PipelineError::InvalidParameters(_) => "INVALID_PARAMETERS",
            PipelineError::ProcessingFailed(_) => "PROCESSING_FAILED",
            PipelineError::StorageUnavailable(_) => "STORAGE_UNAVAILABLE",
            PipelineError::QueueUnavailable(_) => "QUEUE_UNAVAILABLE",
            PipelineError::NotFound(_) => "NOT_FOUND",
            PipelineError::InvalidState(_) => "INVALID_STATE",
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
