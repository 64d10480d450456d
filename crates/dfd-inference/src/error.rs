//! Error types for model loading and inference.

use dfd_media::MediaError;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Result type for inference operations.
pub type InferenceResult<T> = Result<T, InferenceError>;

/// Errors that can occur while loading models or classifying a video.
#[derive(Debug, Error)]
pub enum InferenceError {
    #[error("Weights unavailable: {0}")]
    WeightsUnavailable(String),

    #[error("Incompatible weights in {path}: {message}")]
    IncompatibleWeights { path: PathBuf, message: String },

    #[error("Forward pass failed: {0}")]
    Forward(String),

    #[error(transparent)]
    Media(#[from] MediaError),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl InferenceError {
    /// Create an incompatible weights error.
    pub fn incompatible(path: impl AsRef<Path>, message: impl Into<String>) -> Self {
        Self::IncompatibleWeights {
            path: path.as_ref().to_path_buf(),
            message: message.into(),
        }
    }

    /// Create a forward pass error.
    pub fn forward(message: impl Into<String>) -> Self {
        Self::Forward(message.into())
    }

    /// Create an internal error.
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal(message.into())
    }

    /// True if the failure was caused by the submitted video.
    pub fn is_invalid_input(&self) -> bool {
        matches!(self, InferenceError::Media(e) if e.is_invalid_input())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_input_only_for_bad_media() {
        let err: InferenceError = MediaError::invalid_video("zero frames").into();
        assert!(err.is_invalid_input());

        let err: InferenceError = MediaError::FfmpegNotFound.into();
        assert!(!err.is_invalid_input());

        assert!(!InferenceError::forward("nan").is_invalid_input());
        assert!(!InferenceError::WeightsUnavailable("none".into()).is_invalid_input());
    }

    #[test]
    fn test_incompatible_message_names_file() {
        let err = InferenceError::incompatible("models/gru.npz", "expected 3 arrays, found 2");
        let msg = err.to_string();
        assert!(msg.contains("models/gru.npz"));
        assert!(msg.contains("expected 3 arrays"));
    }
}
