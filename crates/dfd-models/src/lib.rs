//! Shared data models for the deepfake detection service.
//!
//! This crate provides Serde-serializable types for:
//! - Classification labels and predictions
//! - Upload metadata submitted alongside a video
//! - Persisted prediction records

pub mod label;
pub mod prediction;

// Re-export common types
pub use label::{Label, LabelParseError};
pub use prediction::{round_confidence, Prediction, PredictionId, PredictionMetadata, PredictionRecord};
