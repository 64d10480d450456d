//! Deepfake video classifier.
//!
//! This crate provides:
//! - NumPy `.npz` weight archives bound positionally to layers
//! - An Xception backbone producing one embedding per frame
//! - A GRU + sigmoid sequence classifier with random-init fallback
//! - Lazily loaded model components and the end-to-end `Detector`

pub mod backbone;
pub mod classifier;
pub mod config;
pub mod decision;
pub mod detector;
pub mod error;
pub mod extractor;
pub mod lazy;
pub mod metrics;
pub mod weights;

pub use backbone::{Xception, XceptionConfig};
pub use classifier::{DenseHead, Gru, GruClassifier, SequenceClassifier};
pub use config::ModelConfig;
pub use decision::DecisionPolicy;
pub use detector::{ComponentStatus, Detector, VideoClassifier, WeightsStatus};
pub use error::{InferenceError, InferenceResult};
pub use extractor::{FeatureExtractor, XceptionExtractor};
pub use lazy::LazyComponent;
pub use weights::{LayerProvenance, WeightArchive, WeightCursor, WeightSource};
