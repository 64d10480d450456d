//! Xception convolutional backbone.
//!
//! Layer layout and numerics follow Keras `applications.Xception` with
//! `include_top=False, pooling="avg"`: valid-padded stem convolutions,
//! same-padded separable convolutions and max-pools, batch norm with
//! epsilon 1e-3, and global average pooling at the end.

use candle_core::Tensor;

use crate::error::{InferenceError, InferenceResult};
use crate::weights::{WeightArchive, WeightCursor};

const BN_EPSILON: f64 = 1e-3;

/// Smallest input side the valid-padded stem accepts.
const MIN_INPUT_SIZE: usize = 7;

/// Channel widths of the network.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct XceptionConfig {
    /// block1 conv1 and conv2
    pub stem: [usize; 2],
    /// Outputs of blocks 2, 3 and 4; the last is also the middle-flow width
    pub entry: [usize; 3],
    pub middle_blocks: usize,
    /// block13 separable conv outputs
    pub exit: [usize; 2],
    /// block14 separable conv outputs; the last is the embedding size
    pub head: [usize; 2],
}

impl Default for XceptionConfig {
    fn default() -> Self {
        Self {
            stem: [32, 64],
            entry: [128, 256, 728],
            middle_blocks: 8,
            exit: [728, 1024],
            head: [1536, 2048],
        }
    }
}

impl XceptionConfig {
    pub fn embedding_dim(&self) -> usize {
        self.head[1]
    }

    fn middle_width(&self) -> usize {
        self.entry[2]
    }

    /// Shapes of every weight array in Keras `get_weights()` order.
    pub fn weight_shapes(&self) -> Vec<Vec<usize>> {
        let mut shapes = Vec::new();
        let conv = |s: &mut Vec<Vec<usize>>, k: usize, cin: usize, cout: usize| {
            s.push(vec![k, k, cin, cout])
        };
        let bn = |s: &mut Vec<Vec<usize>>, c: usize| s.extend(std::iter::repeat(vec![c]).take(4));
        let sep = |s: &mut Vec<Vec<usize>>, cin: usize, cout: usize| {
            s.push(vec![3, 3, cin, 1]);
            s.push(vec![1, 1, cin, cout]);
        };

        conv(&mut shapes, 3, 3, self.stem[0]);
        bn(&mut shapes, self.stem[0]);
        conv(&mut shapes, 3, self.stem[0], self.stem[1]);
        bn(&mut shapes, self.stem[1]);

        let mut prev = self.stem[1];
        for &out in &self.entry {
            sep(&mut shapes, prev, out);
            bn(&mut shapes, out);
            sep(&mut shapes, out, out);
            bn(&mut shapes, out);
            conv(&mut shapes, 1, prev, out);
            bn(&mut shapes, out);
            prev = out;
        }

        for _ in 0..self.middle_blocks {
            for _ in 0..3 {
                sep(&mut shapes, prev, prev);
                bn(&mut shapes, prev);
            }
        }

        sep(&mut shapes, prev, self.exit[0]);
        bn(&mut shapes, self.exit[0]);
        sep(&mut shapes, self.exit[0], self.exit[1]);
        bn(&mut shapes, self.exit[1]);
        conv(&mut shapes, 1, prev, self.exit[1]);
        bn(&mut shapes, self.exit[1]);

        sep(&mut shapes, self.exit[1], self.head[0]);
        bn(&mut shapes, self.head[0]);
        sep(&mut shapes, self.head[0], self.head[1]);
        bn(&mut shapes, self.head[1]);

        shapes
    }
}

/// Batch norm folded into a per-channel scale and shift.
struct BatchNorm {
    scale: Tensor,
    shift: Tensor,
}

impl BatchNorm {
    fn load(weights: &mut WeightCursor, channels: usize) -> InferenceResult<Self> {
        let gamma = weights.take(&[channels])?;
        let beta = weights.take(&[channels])?;
        let mean = weights.take(&[channels])?;
        let var = weights.take(&[channels])?;

        let scale = gamma.div(&var.affine(1.0, BN_EPSILON)?.sqrt()?)?;
        let shift = beta.sub(&mean.mul(&scale)?)?;
        Ok(Self {
            scale: scale.reshape((1, channels, 1, 1))?,
            shift: shift.reshape((1, channels, 1, 1))?,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.broadcast_mul(&self.scale)?.broadcast_add(&self.shift)
    }
}

/// Dense convolution without bias, stored as (out, in, kh, kw).
struct Conv {
    weight: Tensor,
    stride: usize,
}

impl Conv {
    fn load(
        weights: &mut WeightCursor,
        kernel: usize,
        cin: usize,
        cout: usize,
        stride: usize,
    ) -> InferenceResult<Self> {
        let weight = weights
            .take(&[kernel, kernel, cin, cout])?
            .permute((3, 2, 0, 1))?
            .contiguous()?;
        Ok(Self { weight, stride })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.conv2d(&self.weight, 0, self.stride, 1, 1)
    }
}

/// 3x3 depthwise then 1x1 pointwise convolution, same padding.
struct SeparableConv {
    depthwise: Tensor,
    pointwise: Tensor,
    channels: usize,
}

impl SeparableConv {
    fn load(weights: &mut WeightCursor, cin: usize, cout: usize) -> InferenceResult<Self> {
        let depthwise = weights
            .take(&[3, 3, cin, 1])?
            .permute((2, 3, 0, 1))?
            .contiguous()?;
        let pointwise = weights
            .take(&[1, 1, cin, cout])?
            .permute((3, 2, 0, 1))?
            .contiguous()?;
        Ok(Self {
            depthwise,
            pointwise,
            channels: cin,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        x.conv2d(&self.depthwise, 1, 1, 1, self.channels)?
            .conv2d(&self.pointwise, 0, 1, 1, 1)
    }
}

/// Downsampling block with a strided 1x1 shortcut (blocks 2-4 and 13).
struct ReductionBlock {
    sep1: SeparableConv,
    bn1: BatchNorm,
    sep2: SeparableConv,
    bn2: BatchNorm,
    shortcut: Conv,
    shortcut_bn: BatchNorm,
    /// block2 follows an activation already; later blocks start with one
    pre_activation: bool,
}

impl ReductionBlock {
    fn load(
        weights: &mut WeightCursor,
        cin: usize,
        mid: usize,
        cout: usize,
        pre_activation: bool,
    ) -> InferenceResult<Self> {
        Ok(Self {
            sep1: SeparableConv::load(weights, cin, mid)?,
            bn1: BatchNorm::load(weights, mid)?,
            sep2: SeparableConv::load(weights, mid, cout)?,
            bn2: BatchNorm::load(weights, cout)?,
            shortcut: Conv::load(weights, 1, cin, cout, 2)?,
            shortcut_bn: BatchNorm::load(weights, cout)?,
            pre_activation,
        })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let residual = self.shortcut_bn.forward(&self.shortcut.forward(x)?)?;

        let y = if self.pre_activation { x.relu()? } else { x.clone() };
        let y = self.bn1.forward(&self.sep1.forward(&y)?)?.relu()?;
        let y = self.bn2.forward(&self.sep2.forward(&y)?)?;
        max_pool_same(&y)?.add(&residual)
    }
}

/// Identity-shortcut block of the middle flow.
struct MiddleBlock {
    layers: Vec<(SeparableConv, BatchNorm)>,
}

impl MiddleBlock {
    fn load(weights: &mut WeightCursor, channels: usize) -> InferenceResult<Self> {
        let layers = (0..3)
            .map(|_| {
                Ok((
                    SeparableConv::load(weights, channels, channels)?,
                    BatchNorm::load(weights, channels)?,
                ))
            })
            .collect::<InferenceResult<Vec<_>>>()?;
        Ok(Self { layers })
    }

    fn forward(&self, x: &Tensor) -> candle_core::Result<Tensor> {
        let mut y = x.clone();
        for (sep, bn) in &self.layers {
            y = bn.forward(&sep.forward(&y.relu()?)?)?;
        }
        y.add(x)
    }
}

/// Xception feature network producing one embedding per image.
pub struct Xception {
    config: XceptionConfig,
    conv1: Conv,
    bn1: BatchNorm,
    conv2: Conv,
    bn2: BatchNorm,
    entry: Vec<ReductionBlock>,
    middle: Vec<MiddleBlock>,
    exit: ReductionBlock,
    head: [(SeparableConv, BatchNorm); 2],
}

impl Xception {
    /// Bind the network to an archive, validating every array.
    pub fn load(archive: WeightArchive, config: XceptionConfig) -> InferenceResult<Self> {
        let expected = config.weight_shapes().len();
        if archive.len() != expected {
            return Err(InferenceError::incompatible(
                archive.path(),
                format!("expected {} arrays, found {}", expected, archive.len()),
            ));
        }

        let mut w = archive.into_cursor();

        let conv1 = Conv::load(&mut w, 3, 3, config.stem[0], 2)?;
        let bn1 = BatchNorm::load(&mut w, config.stem[0])?;
        let conv2 = Conv::load(&mut w, 3, config.stem[0], config.stem[1], 1)?;
        let bn2 = BatchNorm::load(&mut w, config.stem[1])?;

        let mut entry = Vec::with_capacity(config.entry.len());
        let mut prev = config.stem[1];
        for (i, &out) in config.entry.iter().enumerate() {
            entry.push(ReductionBlock::load(&mut w, prev, out, out, i > 0)?);
            prev = out;
        }

        let middle = (0..config.middle_blocks)
            .map(|_| MiddleBlock::load(&mut w, config.middle_width()))
            .collect::<InferenceResult<Vec<_>>>()?;

        let exit = ReductionBlock::load(&mut w, prev, config.exit[0], config.exit[1], true)?;

        let head = [
            (
                SeparableConv::load(&mut w, config.exit[1], config.head[0])?,
                BatchNorm::load(&mut w, config.head[0])?,
            ),
            (
                SeparableConv::load(&mut w, config.head[0], config.head[1])?,
                BatchNorm::load(&mut w, config.head[1])?,
            ),
        ];

        w.finish()?;

        Ok(Self {
            config,
            conv1,
            bn1,
            conv2,
            bn2,
            entry,
            middle,
            exit,
            head,
        })
    }

    pub fn config(&self) -> &XceptionConfig {
        &self.config
    }

    /// Embed a batch of images shaped (n, 3, h, w) into (n, embedding_dim).
    pub fn forward(&self, images: &Tensor) -> InferenceResult<Tensor> {
        let (_, channels, h, w) = images.dims4()?;
        if channels != 3 || h < MIN_INPUT_SIZE || w < MIN_INPUT_SIZE {
            return Err(InferenceError::forward(format!(
                "backbone expects (n, 3, h, w) with h, w >= {}, got {:?}",
                MIN_INPUT_SIZE,
                images.dims()
            )));
        }

        let mut x = self.bn1.forward(&self.conv1.forward(images)?)?.relu()?;
        x = self.bn2.forward(&self.conv2.forward(&x)?)?.relu()?;

        for block in &self.entry {
            x = block.forward(&x)?;
        }
        for block in &self.middle {
            x = block.forward(&x)?;
        }
        x = self.exit.forward(&x)?;
        for (sep, bn) in &self.head {
            x = bn.forward(&sep.forward(&x)?)?.relu()?;
        }

        Ok(x.mean((2, 3))?)
    }
}

/// TF-style same padding for one spatial dimension: (before, after).
fn same_padding(input: usize, kernel: usize, stride: usize) -> (usize, usize) {
    let output = input.div_ceil(stride);
    let total = ((output - 1) * stride + kernel).saturating_sub(input);
    (total / 2, total - total / 2)
}

/// Pad `dim` with negative infinity so padding never wins a max.
fn pad_neg_inf(x: &Tensor, dim: usize, before: usize, after: usize) -> candle_core::Result<Tensor> {
    if before == 0 && after == 0 {
        return Ok(x.clone());
    }
    let mut shape = x.dims().to_vec();
    let mut parts = Vec::with_capacity(3);
    if before > 0 {
        shape[dim] = before;
        parts.push(Tensor::full(f32::NEG_INFINITY, shape.clone(), x.device())?);
    }
    parts.push(x.clone());
    if after > 0 {
        shape[dim] = after;
        parts.push(Tensor::full(f32::NEG_INFINITY, shape, x.device())?);
    }
    Tensor::cat(&parts, dim)
}

/// 3x3 stride-2 max pool with same padding.
fn max_pool_same(x: &Tensor) -> candle_core::Result<Tensor> {
    let (_, _, h, w) = x.dims4()?;
    let (top, bottom) = same_padding(h, 3, 2);
    let (left, right) = same_padding(w, 3, 2);
    let x = pad_neg_inf(x, 2, top, bottom)?;
    let x = pad_neg_inf(&x, 3, left, right)?;
    x.max_pool2d_with_stride(3, 2)
}

/// Arrays for `config` with small deterministic values.
#[cfg(test)]
pub(crate) fn test_weights(config: &XceptionConfig, device: &candle_core::Device) -> Vec<Tensor> {
    config
        .weight_shapes()
        .iter()
        .enumerate()
        .map(|(i, shape)| {
            let count: usize = shape.iter().product();
            let data: Vec<f32> = (0..count)
                .map(|j| (((i * 31 + j * 17) % 23) as f32 - 11.0) / 40.0)
                .collect();
            let t = Tensor::from_vec(data, shape.as_slice(), device)?;
            // Batch-norm vectors stay positive so variances are valid
            if shape.len() == 1 {
                t.abs()?.affine(1.0, 0.5)
            } else {
                Ok(t)
            }
        })
        .collect::<candle_core::Result<Vec<_>>>()
        .expect("test weights")
}

/// Tiny network with the full block structure.
#[cfg(test)]
pub(crate) fn tiny_config() -> XceptionConfig {
    XceptionConfig {
        stem: [4, 6],
        entry: [8, 8, 12],
        middle_blocks: 2,
        exit: [12, 16],
        head: [16, 10],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_keras_weight_layout() {
        let shapes = XceptionConfig::default().weight_shapes();
        assert_eq!(shapes.len(), 234);
        let params: usize = shapes.iter().map(|s| s.iter().product::<usize>()).sum();
        assert_eq!(params, 20_861_480);
        assert_eq!(shapes[0], vec![3, 3, 3, 32]);
        assert_eq!(shapes.last().unwrap(), &vec![2048]);
    }

    #[test]
    fn test_same_padding() {
        assert_eq!(same_padding(147, 3, 2), (1, 1));
        assert_eq!(same_padding(74, 3, 2), (0, 1));
        assert_eq!(same_padding(37, 3, 2), (1, 1));
        assert_eq!(same_padding(19, 3, 2), (1, 1));
        assert_eq!(same_padding(74, 1, 2), (0, 0));
    }

    #[test]
    fn test_max_pool_same_ignores_padding() {
        let x = Tensor::full(-5f32, (1, 1, 5, 5), &Device::Cpu).unwrap();
        let y = max_pool_same(&x).unwrap();
        assert_eq!(y.dims(), &[1, 1, 3, 3]);
        let values = y.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert!(values.iter().all(|v| *v == -5.0));
    }

    fn tiny_archive(dir: &std::path::Path, config: &XceptionConfig) -> WeightArchive {
        let path = dir.join("xception.npz");
        WeightArchive::save(&path, &test_weights(config, &Device::Cpu)).unwrap();
        WeightArchive::open(&path, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_forward_shape_and_determinism() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let model = Xception::load(tiny_archive(dir.path(), &config), config).unwrap();

        let images = Tensor::rand(0f32, 1f32, (2, 3, 32, 32), &Device::Cpu).unwrap();
        let a = model.forward(&images).unwrap();
        let b = model.forward(&images).unwrap();
        assert_eq!(a.dims(), &[2, 10]);

        let a = a.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let b = b.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(a, b);
        assert!(a.iter().all(|v| v.is_finite() && *v >= 0.0));
    }

    #[test]
    fn test_load_rejects_wrong_array_count() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let archive = tiny_archive(dir.path(), &config);

        let err = Xception::load(archive, XceptionConfig::default()).err().unwrap();
        assert!(matches!(err, InferenceError::IncompatibleWeights { .. }));
    }

    #[test]
    fn test_load_rejects_wrong_shapes() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let archive = tiny_archive(dir.path(), &config);

        let wider = XceptionConfig {
            head: [16, 12],
            ..config
        };
        let err = Xception::load(archive, wider).err().unwrap();
        assert!(err.to_string().contains("expected"));
    }

    #[test]
    fn test_forward_rejects_small_input() {
        let dir = tempfile::tempdir().unwrap();
        let config = tiny_config();
        let model = Xception::load(tiny_archive(dir.path(), &config), config).unwrap();
        let images = Tensor::zeros((1, 3, 5, 5), candle_core::DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(model.forward(&images), Err(InferenceError::Forward(_))));
    }
}
