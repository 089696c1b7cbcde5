// Error types for atelier

use crate::generation::runtime::InferenceFailure;
use thiserror::Error;

/// Result type for atelier operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the generation session and its backends
#[derive(Error, Debug)]
pub enum Error {
    /// A conditioned mode is missing a required input (init image)
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Another request for this session is still resolving, running or persisting
    #[error("A generation request is already in progress")]
    Busy,

    #[error(transparent)]
    Inference(#[from] InferenceFailure),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Tokenization error: {0}")]
    Tokenization(String),

    #[error("Image processing error: {0}")]
    ImageProcessing(String),

    #[error("Model loading error: {0}")]
    ModelLoading(String),

    #[error("HuggingFace Hub error: {0}")]
    HfHub(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// Message suitable for the notification collaborator
    pub fn user_message(&self) -> String {
        match self {
            Error::Inference(failure) => failure.user_message(),
            Error::Busy => "Generation is already in progress.".to_string(),
            other => format!("Generation error: {}", other),
        }
    }
}

impl From<image::ImageError> for Error {
    fn from(err: image::ImageError) -> Self {
        Error::ImageProcessing(err.to_string())
    }
}
