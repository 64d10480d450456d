//! Prediction results and persisted prediction records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::label::Label;

/// Round a probability to two decimals, the precision reported to clients.
pub fn round_confidence(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Result of classifying one video.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub label: Label,
    /// Probability of the reported label, in [0, 1], two decimals.
    pub confidence: f64,
}

impl Prediction {
    pub fn new(label: Label, confidence: f64) -> Self {
        Self {
            label,
            confidence: round_confidence(confidence.clamp(0.0, 1.0)),
        }
    }
}

/// Unique identifier for a stored prediction.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PredictionId(pub String);

impl PredictionId {
    /// Generate a new random prediction ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for PredictionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for PredictionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for PredictionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Optional metadata submitted alongside an uploaded video.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PredictionMetadata {
    /// Client-side file name of the upload
    pub filename: String,
    /// Declared duration in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_profile: Option<String>,
}

/// A prediction as stored in the document store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PredictionRecord {
    pub id: PredictionId,
    pub filename: String,
    pub label: Label,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_profile: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl PredictionRecord {
    /// Build a new record for a prediction made now.
    pub fn new(prediction: Prediction, metadata: PredictionMetadata) -> Self {
        Self {
            id: PredictionId::new(),
            filename: metadata.filename,
            label: prediction.label,
            confidence: prediction.confidence,
            duration: metadata.duration,
            user_email: metadata.user_email,
            user_name: metadata.user_name,
            user_profile: metadata.user_profile,
            timestamp: Utc::now(),
        }
    }

    pub fn prediction(&self) -> Prediction {
        Prediction {
            label: self.label,
            confidence: self.confidence,
        }
    }
}
