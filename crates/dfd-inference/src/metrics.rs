//! Inference metrics.
//!
//! - Model load latency and weight fallbacks per component
//! - Per-stage latency of the prediction pipeline
//! - Prediction counts by label and failure counts by stage

use metrics::{counter, histogram};

use crate::weights::WeightSource;

/// Metric name constants for consistency.
pub mod names {
    /// Time spent loading a model component, by component.
    pub const MODEL_LOAD_SECONDS: &str = "model_load_duration_seconds";

    /// Components that fell back from their preferred weights, by component and source used.
    pub const WEIGHT_FALLBACK_TOTAL: &str = "model_weight_fallback_total";

    /// Latency of one pipeline stage, by stage.
    pub const STAGE_SECONDS: &str = "inference_stage_duration_seconds";

    /// Completed predictions by label.
    pub const PREDICTIONS_TOTAL: &str = "inference_predictions_total";

    /// Failed predictions by stage.
    pub const FAILURES_TOTAL: &str = "inference_failures_total";
}

pub fn record_model_load(component: &str, seconds: f64) {
    histogram!(names::MODEL_LOAD_SECONDS, "component" => component.to_string()).record(seconds);
}

pub fn record_weight_fallback(component: &str, source: WeightSource) {
    counter!(
        names::WEIGHT_FALLBACK_TOTAL,
        "component" => component.to_string(),
        "source" => source.as_str()
    )
    .increment(1);
}

pub fn record_stage(stage: &'static str, seconds: f64) {
    histogram!(names::STAGE_SECONDS, "stage" => stage).record(seconds);
}

pub fn record_prediction(label: &'static str) {
    counter!(names::PREDICTIONS_TOTAL, "label" => label).increment(1);
}

pub fn record_failure(stage: &'static str) {
    counter!(names::FAILURES_TOTAL, "stage" => stage).increment(1);
}
