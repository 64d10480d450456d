//! Sequence classification over frame embeddings.
//!
//! A single GRU layer (Keras semantics, `reset_after=True`) reads the
//! embeddings in frame order and a one-unit sigmoid dense layer turns the
//! final hidden state into a score in [0, 1].
//!
//! The two layers load from separate archives. A missing or incompatible
//! archive never fails the load: the layer is randomly initialized instead
//! and the degradation is logged and counted.

use candle_core::{DType, Device, Tensor};
use candle_nn::ops::sigmoid;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{info, warn};

use crate::config::ModelConfig;
use crate::error::{InferenceError, InferenceResult};
use crate::metrics;
use crate::weights::{LayerProvenance, WeightArchive, WeightSource};

/// Scores a sequence of frame embeddings.
pub trait SequenceClassifier: Send + Sync {
    /// Embedding length the classifier expects.
    fn input_dim(&self) -> usize;

    /// Score an `(n, input_dim)` sequence. Higher means more likely manipulated
    /// under the default decision policy.
    fn score(&self, sequence: &Tensor) -> InferenceResult<f32>;

    /// Weight provenance of each layer.
    fn provenance(&self) -> Vec<LayerProvenance> {
        Vec::new()
    }
}

/// Glorot-uniform initialized `(fan_in, fan_out)` kernel.
fn glorot_uniform(fan_in: usize, fan_out: usize, device: &Device) -> InferenceResult<Tensor> {
    let limit = (6.0 / (fan_in + fan_out) as f64).sqrt() as f32;
    Ok(Tensor::rand(-limit, limit, (fan_in, fan_out), device)?)
}

/// Gated recurrent unit layer.
pub struct Gru {
    /// (input_dim, 3 * units), gates ordered z, r, h
    kernel: Tensor,
    /// (units, 3 * units)
    recurrent: Tensor,
    input_bias: Tensor,
    recurrent_bias: Tensor,
    units: usize,
}

impl Gru {
    /// Archive layout: `kernel`, `recurrent_kernel` and a `(2, 3 * units)` bias.
    pub fn weight_shapes(input_dim: usize, units: usize) -> Vec<Vec<usize>> {
        vec![vec![input_dim, 3 * units], vec![units, 3 * units], vec![2, 3 * units]]
    }

    pub fn load(archive: WeightArchive, input_dim: usize, units: usize) -> InferenceResult<Self> {
        let shapes = Self::weight_shapes(input_dim, units);
        let mut w = archive.into_cursor();
        let kernel = w.take(&shapes[0])?;
        let recurrent = w.take(&shapes[1])?;
        let bias = w.take(&shapes[2])?;
        w.finish()?;

        Ok(Self {
            kernel,
            recurrent,
            input_bias: bias.get(0)?,
            recurrent_bias: bias.get(1)?,
            units,
        })
    }

    /// Random weights with zero bias.
    pub fn random(input_dim: usize, units: usize, device: &Device) -> InferenceResult<Self> {
        Ok(Self {
            kernel: glorot_uniform(input_dim, 3 * units, device)?,
            recurrent: glorot_uniform(units, 3 * units, device)?,
            input_bias: Tensor::zeros(3 * units, DType::F32, device)?,
            recurrent_bias: Tensor::zeros(3 * units, DType::F32, device)?,
            units,
        })
    }

    pub fn input_dim(&self) -> usize {
        self.kernel.dims()[0]
    }

    pub fn units(&self) -> usize {
        self.units
    }

    /// Run over an `(steps, input_dim)` sequence and return the final `(1, units)` state.
    pub fn forward(&self, sequence: &Tensor) -> InferenceResult<Tensor> {
        let (steps, dim) = sequence.dims2()?;
        if steps == 0 || dim != self.input_dim() {
            return Err(InferenceError::forward(format!(
                "GRU expects (steps, {}), got {:?}",
                self.input_dim(),
                sequence.dims()
            )));
        }
        let u = self.units;

        // Input projections for every step at once
        let projected = sequence
            .matmul(&self.kernel)?
            .broadcast_add(&self.input_bias)?;

        let mut h = Tensor::zeros((1, u), DType::F32, sequence.device())?;
        for t in 0..steps {
            let x = projected.narrow(0, t, 1)?;
            let r_h = h
                .matmul(&self.recurrent)?
                .broadcast_add(&self.recurrent_bias)?;

            let z = sigmoid(&x.narrow(1, 0, u)?.add(&r_h.narrow(1, 0, u)?)?)?;
            let r = sigmoid(&x.narrow(1, u, u)?.add(&r_h.narrow(1, u, u)?)?)?;
            let candidate = x
                .narrow(1, 2 * u, u)?
                .add(&r.mul(&r_h.narrow(1, 2 * u, u)?)?)?
                .tanh()?;

            h = z.mul(&h)?.add(&z.affine(-1.0, 1.0)?.mul(&candidate)?)?;
        }

        Ok(h)
    }
}

/// One-unit dense layer with sigmoid activation.
pub struct DenseHead {
    /// (units, 1)
    kernel: Tensor,
    bias: Tensor,
}

impl DenseHead {
    pub fn weight_shapes(units: usize) -> Vec<Vec<usize>> {
        vec![vec![units, 1], vec![1]]
    }

    pub fn load(archive: WeightArchive, units: usize) -> InferenceResult<Self> {
        let shapes = Self::weight_shapes(units);
        let mut w = archive.into_cursor();
        let kernel = w.take(&shapes[0])?;
        let bias = w.take(&shapes[1])?;
        w.finish()?;
        Ok(Self { kernel, bias })
    }

    pub fn random(units: usize, device: &Device) -> InferenceResult<Self> {
        Ok(Self {
            kernel: glorot_uniform(units, 1, device)?,
            bias: Tensor::zeros(1, DType::F32, device)?,
        })
    }

    pub fn forward(&self, state: &Tensor) -> InferenceResult<f32> {
        let logit = state.matmul(&self.kernel)?.broadcast_add(&self.bias)?;
        let values = sigmoid(&logit)?.flatten_all()?.to_vec1::<f32>()?;
        values
            .first()
            .copied()
            .ok_or_else(|| InferenceError::forward("dense layer produced no output"))
    }
}

/// GRU followed by the sigmoid head.
pub struct GruClassifier {
    gru: Gru,
    dense: DenseHead,
    provenance: Vec<LayerProvenance>,
}

impl GruClassifier {
    /// Load both layers from the configured artifacts.
    pub fn from_config(config: &ModelConfig, input_dim: usize) -> InferenceResult<Self> {
        Self::load(
            &config.gru_weights_path(),
            &config.dense_weights_path(),
            input_dim,
            config.gru_units,
        )
    }

    /// Load each layer independently, randomly initializing any that cannot load.
    pub fn load(
        gru_path: &Path,
        dense_path: &Path,
        input_dim: usize,
        units: usize,
    ) -> InferenceResult<Self> {
        let start = Instant::now();
        let device = Device::Cpu;

        let (gru, gru_source) = match WeightArchive::open(gru_path, &device)
            .and_then(|archive| Gru::load(archive, input_dim, units))
        {
            Ok(gru) => (gru, WeightSource::Custom),
            Err(e) => {
                warn!(
                    path = %gru_path.display(),
                    error = %e,
                    "GRU weights unusable, using RANDOM initialization; predictions are meaningless"
                );
                metrics::record_weight_fallback("gru", WeightSource::RandomInit);
                (Gru::random(input_dim, units, &device)?, WeightSource::RandomInit)
            }
        };

        let (dense, dense_source) = match WeightArchive::open(dense_path, &device)
            .and_then(|archive| DenseHead::load(archive, units))
        {
            Ok(dense) => (dense, WeightSource::Custom),
            Err(e) => {
                warn!(
                    path = %dense_path.display(),
                    error = %e,
                    "Dense weights unusable, using RANDOM initialization; predictions are meaningless"
                );
                metrics::record_weight_fallback("dense", WeightSource::RandomInit);
                (DenseHead::random(units, &device)?, WeightSource::RandomInit)
            }
        };

        let provenance = vec![
            layer_provenance("gru", gru_source, gru_path),
            layer_provenance("dense", dense_source, dense_path),
        ];

        let elapsed = start.elapsed().as_secs_f64();
        metrics::record_model_load("classifier", elapsed);
        info!(
            gru = %gru_source,
            dense = %dense_source,
            units,
            elapsed_secs = elapsed,
            "Sequence classifier loaded"
        );

        Ok(Self {
            gru,
            dense,
            provenance,
        })
    }

    /// Assemble from already-built layers.
    pub fn from_layers(gru: Gru, dense: DenseHead) -> Self {
        Self {
            gru,
            dense,
            provenance: Vec::new(),
        }
    }
}

fn layer_provenance(layer: &str, source: WeightSource, path: &Path) -> LayerProvenance {
    let path: Option<PathBuf> = match source {
        WeightSource::RandomInit => None,
        _ => Some(path.to_path_buf()),
    };
    LayerProvenance::new(layer, source, path)
}

impl SequenceClassifier for GruClassifier {
    fn input_dim(&self) -> usize {
        self.gru.input_dim()
    }

    fn score(&self, sequence: &Tensor) -> InferenceResult<f32> {
        let state = self.gru.forward(sequence)?;
        let score = self.dense.forward(&state)?;
        if !score.is_finite() {
            return Err(InferenceError::forward(format!(
                "classifier produced non-finite score {}",
                score
            )));
        }
        Ok(score)
    }

    fn provenance(&self) -> Vec<LayerProvenance> {
        self.provenance.clone()
    }
}
