//! Per-frame feature extraction.

use candle_core::{Device, Tensor};
use dfd_media::Frame;
use std::path::Path;
use std::time::Instant;
use tracing::{info, warn};

use crate::backbone::{Xception, XceptionConfig};
use crate::config::ModelConfig;
use crate::error::{InferenceError, InferenceResult};
use crate::metrics;
use crate::weights::{LayerProvenance, WeightArchive, WeightSource};

/// Maps frames to fixed-length embeddings.
pub trait FeatureExtractor: Send + Sync {
    /// Length of one embedding.
    fn embedding_dim(&self) -> usize;

    /// Embed `frames` into an `(n, embedding_dim)` tensor, one row per frame.
    fn embed(&self, frames: &[Frame]) -> InferenceResult<Tensor>;

    /// Weight provenance of the underlying network.
    fn provenance(&self) -> Vec<LayerProvenance> {
        Vec::new()
    }
}

/// Feature extractor backed by the Xception backbone.
pub struct XceptionExtractor {
    model: Xception,
    provenance: LayerProvenance,
    device: Device,
}

impl XceptionExtractor {
    /// Load the backbone from the configured artifacts.
    pub fn from_config(config: &ModelConfig) -> InferenceResult<Self> {
        Self::load(
            &config.xception_weights_path(),
            &config.xception_pretrained_path(),
            XceptionConfig::default(),
        )
    }

    /// Load custom weights, falling back to the generic pretrained ones.
    pub fn load(
        custom: &Path,
        pretrained: &Path,
        config: XceptionConfig,
    ) -> InferenceResult<Self> {
        let start = Instant::now();
        let device = Device::Cpu;

        let extractor = match Self::from_path(custom, config, WeightSource::Custom, &device) {
            Ok(extractor) => extractor,
            Err(custom_err) => {
                warn!(
                    path = %custom.display(),
                    error = %custom_err,
                    "Custom backbone weights unusable, falling back to pretrained weights"
                );
                metrics::record_weight_fallback("backbone", WeightSource::Pretrained);

                Self::from_path(pretrained, config, WeightSource::Pretrained, &device).map_err(
                    |pretrained_err| {
                        InferenceError::WeightsUnavailable(format!(
                            "no usable backbone weights (custom: {}; pretrained: {})",
                            custom_err, pretrained_err
                        ))
                    },
                )?
            }
        };

        let elapsed = start.elapsed().as_secs_f64();
        metrics::record_model_load("backbone", elapsed);
        info!(
            source = %extractor.provenance.source,
            embedding_dim = config.embedding_dim(),
            elapsed_secs = elapsed,
            "Backbone loaded"
        );

        Ok(extractor)
    }

    fn from_path(
        path: &Path,
        config: XceptionConfig,
        source: WeightSource,
        device: &Device,
    ) -> InferenceResult<Self> {
        let archive = WeightArchive::open(path, device)?;
        let model = Xception::load(archive, config)?;
        Ok(Self {
            model,
            provenance: LayerProvenance::new("backbone", source, Some(path.to_path_buf())),
            device: device.clone(),
        })
    }

    pub fn weight_source(&self) -> WeightSource {
        self.provenance.source
    }
}

/// Stack frames into an `(n, 3, size, size)` batch.
fn frames_to_batch(frames: &[Frame], device: &Device) -> InferenceResult<Tensor> {
    let first = frames
        .first()
        .ok_or_else(|| InferenceError::forward("no frames to embed"))?;
    let size = first.size() as usize;
    if frames.iter().any(|f| f.size() as usize != size) {
        return Err(InferenceError::forward("frames differ in size"));
    }

    let mut data = Vec::with_capacity(frames.len() * size * size * 3);
    for frame in frames {
        data.extend(frame.pixels().iter().copied());
    }

    Ok(Tensor::from_vec(data, (frames.len(), size, size, 3), device)?
        .permute((0, 3, 1, 2))?
        .contiguous()?)
}

impl FeatureExtractor for XceptionExtractor {
    fn embedding_dim(&self) -> usize {
        self.model.config().embedding_dim()
    }

    fn embed(&self, frames: &[Frame]) -> InferenceResult<Tensor> {
        let batch = frames_to_batch(frames, &self.device)?;
        self.model.forward(&batch)
    }

    fn provenance(&self) -> Vec<LayerProvenance> {
        vec![self.provenance.clone()]
    }
}
