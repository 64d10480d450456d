//! End-to-end video classification.

use async_trait::async_trait;
use candle_core::Tensor;
use dfd_media::{Frame, FrameSampler};
use dfd_models::Prediction;
use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument};

use crate::backbone::XceptionConfig;
use crate::classifier::{GruClassifier, SequenceClassifier};
use crate::config::ModelConfig;
use crate::decision::DecisionPolicy;
use crate::error::{InferenceError, InferenceResult};
use crate::extractor::{FeatureExtractor, XceptionExtractor};
use crate::lazy::LazyComponent;
use crate::metrics;
use crate::weights::LayerProvenance;

/// Load state of one pipeline component.
#[derive(Debug, Clone, Serialize)]
pub struct ComponentStatus {
    pub loaded: bool,
    pub layers: Vec<LayerProvenance>,
}

impl ComponentStatus {
    fn not_loaded() -> Self {
        Self {
            loaded: false,
            layers: Vec::new(),
        }
    }
}

/// Load state of the whole model.
#[derive(Debug, Clone, Serialize)]
pub struct WeightsStatus {
    pub extractor: ComponentStatus,
    pub classifier: ComponentStatus,
}

impl WeightsStatus {
    pub fn all_loaded(&self) -> bool {
        self.extractor.loaded && self.classifier.loaded
    }

    /// True if any loaded layer runs on fallback weights.
    pub fn degraded(&self) -> bool {
        self.extractor
            .layers
            .iter()
            .chain(&self.classifier.layers)
            .any(LayerProvenance::is_degraded)
    }
}

/// Classifies a video file as real or fake.
#[async_trait]
pub trait VideoClassifier: Send + Sync {
    /// Classify the video at `path`.
    async fn classify(&self, path: &Path) -> InferenceResult<Prediction>;

    /// Load every model component now rather than on first request.
    async fn warm_up(&self) -> InferenceResult<()>;

    fn weights_status(&self) -> WeightsStatus;
}

/// Frame sampler, feature extractor and sequence classifier wired together.
pub struct Detector {
    sampler: FrameSampler,
    extractor: LazyComponent<dyn FeatureExtractor>,
    classifier: LazyComponent<dyn SequenceClassifier>,
    policy: DecisionPolicy,
}

impl Detector {
    /// Detector decoding with FFmpeg and loading weights from `config` on first use.
    pub fn new(config: ModelConfig) -> Self {
        let config = Arc::new(config);

        let extractor_config = Arc::clone(&config);
        let extractor = LazyComponent::new("extractor", move || {
            let extractor = XceptionExtractor::from_config(&extractor_config)?;
            Ok(Arc::new(extractor) as Arc<dyn FeatureExtractor>)
        });

        let classifier_config = Arc::clone(&config);
        let classifier = LazyComponent::new("classifier", move || {
            let input_dim = XceptionConfig::default().embedding_dim();
            let classifier = GruClassifier::from_config(&classifier_config, input_dim)?;
            Ok(Arc::new(classifier) as Arc<dyn SequenceClassifier>)
        });

        Self::from_parts(
            FrameSampler::ffmpeg(config.sampler_config()),
            extractor,
            classifier,
            config.decision_policy(),
        )
    }

    pub fn from_parts(
        sampler: FrameSampler,
        extractor: LazyComponent<dyn FeatureExtractor>,
        classifier: LazyComponent<dyn SequenceClassifier>,
        policy: DecisionPolicy,
    ) -> Self {
        Self {
            sampler,
            extractor,
            classifier,
            policy,
        }
    }

    pub fn policy(&self) -> DecisionPolicy {
        self.policy
    }

    /// Classify with the configured decision policy.
    pub async fn predict(&self, path: &Path) -> InferenceResult<Prediction> {
        self.predict_with_threshold(path, self.policy.threshold).await
    }

    /// Classify with an explicit threshold.
    #[instrument(skip(self, path), fields(path = %path.display()))]
    pub async fn predict_with_threshold(
        &self,
        path: &Path,
        threshold: f32,
    ) -> InferenceResult<Prediction> {
        let score = self.raw_score(path).await?;
        let prediction = self.policy.with_threshold(threshold).decide(score);

        metrics::record_prediction(prediction.label.as_str());
        info!(
            score,
            label = %prediction.label,
            confidence = prediction.confidence,
            "Video classified"
        );
        Ok(prediction)
    }

    /// Classifier score in [0, 1] before the decision rule.
    pub async fn raw_score(&self, path: &Path) -> InferenceResult<f32> {
        let start = Instant::now();
        let frames = self.sampler.sample(path).await.map_err(|e| {
            metrics::record_failure("sample");
            InferenceError::from(e)
        })?;
        metrics::record_stage("sample", start.elapsed().as_secs_f64());

        let extractor = self.extractor.get().await.map_err(|e| {
            metrics::record_failure("load");
            e
        })?;
        let classifier = self.classifier.get().await.map_err(|e| {
            metrics::record_failure("load");
            e
        })?;

        if extractor.embedding_dim() != classifier.input_dim() {
            return Err(InferenceError::internal(format!(
                "extractor emits {} features but classifier expects {}",
                extractor.embedding_dim(),
                classifier.input_dim()
            )));
        }

        tokio::task::spawn_blocking(move || run_models(&*extractor, &*classifier, &frames))
            .await
            .map_err(|e| InferenceError::internal(format!("inference task panicked: {}", e)))?
    }
}

/// Embed every frame and score the sequence.
fn run_models(
    extractor: &dyn FeatureExtractor,
    classifier: &dyn SequenceClassifier,
    frames: &[Frame],
) -> InferenceResult<f32> {
    let start = Instant::now();
    let embeddings: Tensor = extractor.embed(frames).map_err(|e| {
        metrics::record_failure("embed");
        e
    })?;
    metrics::record_stage("embed", start.elapsed().as_secs_f64());
    debug!(shape = ?embeddings.dims(), "Frames embedded");

    let start = Instant::now();
    let score = classifier.score(&embeddings).map_err(|e| {
        metrics::record_failure("classify");
        e
    })?;
    metrics::record_stage("classify", start.elapsed().as_secs_f64());

    Ok(score)
}

fn component_status<T, F>(component: &LazyComponent<T>, layers: F) -> ComponentStatus
where
    T: ?Sized + Send + Sync + 'static,
    F: Fn(&T) -> Vec<LayerProvenance>,
{
    match component.try_get() {
        Some(loaded) => ComponentStatus {
            loaded: true,
            layers: layers(loaded.as_ref()),
        },
        None => ComponentStatus::not_loaded(),
    }
}

#[async_trait]
impl VideoClassifier for Detector {
    async fn classify(&self, path: &Path) -> InferenceResult<Prediction> {
        self.predict(path).await
    }

    async fn warm_up(&self) -> InferenceResult<()> {
        self.extractor.get().await?;
        self.classifier.get().await?;
        Ok(())
    }

    fn weights_status(&self) -> WeightsStatus {
        WeightsStatus {
            extractor: component_status(&self.extractor, |e| e.provenance()),
            classifier: component_status(&self.classifier, |c| c.provenance()),
        }
    }
}
