use thiserror::Error;

#[derive(Error, Debug)]
pub enum InpaintError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Decode error: {0}")]
    Decode(String),

    #[error("Fetch error: {0}")]
    Fetch(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, InpaintError>;

impl InpaintError {
    /// Transient failures worth another attempt (network hiccups, timeouts).
    pub fn is_recoverable(&self) -> bool {
        matches!(self, InpaintError::Fetch(_))
    }
}

impl From<anyhow::Error> for InpaintError {
    fn from(err: anyhow::Error) -> Self {
        InpaintError::Internal(err.to_string())
    }
}

impl From<image::ImageError> for InpaintError {
    fn from(err: image::ImageError) -> Self {
        InpaintError::Decode(err.to_string())
    }
}

impl From<base64::DecodeError> for InpaintError {
    fn from(err: base64::DecodeError) -> Self {
        InpaintError::Decode(format!("invalid base64: {}", err))
    }
}

impl From<reqwest::Error> for InpaintError {
    fn from(err: reqwest::Error) -> Self {
        InpaintError::Fetch(err.to_string())
    }
}

impl From<safetensors::SafeTensorError> for InpaintError {
    fn from(err: safetensors::SafeTensorError) -> Self {
        InpaintError::Checkpoint(err.to_string())
    }
}
