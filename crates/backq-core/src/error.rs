use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Payload size exceeds maximum allowed size of {max} bytes (got {actual})")]
    PayloadTooLarge { max: usize, actual: usize },

    #[error("Serialization error: {0}")]
    SerializationError(#[from] bincode::Error),

    #[error("Publisher not started: {0}")]
    PublisherNotStarted(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

pub type Result<T> = std::result::Result<T, CoreError>;
