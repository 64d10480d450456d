//! Fixed-length frame sampling.
//!
//! A video is reduced to exactly `num_frames` frames taken at evenly spaced
//! positions. Videos with fewer decodable frames are padded with black frames
//! at the end so downstream models always see the same sequence length.

use async_trait::async_trait;
use metrics::{counter, histogram};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, warn};

use crate::command::{FfmpegCommand, FfmpegRunner};
use crate::error::{MediaError, MediaResult};
use crate::frame::Frame;
use crate::probe::probe_video;

/// Default number of frames per video.
pub const DEFAULT_NUM_FRAMES: usize = 10;

/// Default frame side length in pixels.
pub const DEFAULT_FRAME_SIZE: u32 = 299;

/// Sampler settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SamplerConfig {
    pub num_frames: usize,
    pub frame_size: u32,
}

impl Default for SamplerConfig {
    fn default() -> Self {
        Self {
            num_frames: DEFAULT_NUM_FRAMES,
            frame_size: DEFAULT_FRAME_SIZE,
        }
    }
}

/// Evenly spaced frame indices over `[0, total_frames - 1]`.
///
/// Positions are truncated toward zero and the last index is always
/// `total_frames - 1`. When the video has fewer frames than requested the
/// same index appears more than once.
pub fn sample_indices(total_frames: u64, n: usize) -> Vec<u64> {
    if total_frames == 0 || n == 0 {
        return Vec::new();
    }
    if n == 1 {
        return vec![0];
    }

    let last = total_frames - 1;
    let step = last as f64 / (n - 1) as f64;
    let mut indices: Vec<u64> = (0..n).map(|i| (i as f64 * step) as u64).collect();
    indices[n - 1] = last;
    indices
}

/// Source of decoded frames for a video file.
#[async_trait]
pub trait FrameSource: Send + Sync {
    /// Number of frames the container reports.
    async fn frame_count(&self, path: &Path) -> MediaResult<u64>;

    /// Decode the frames at `indices` (sorted, unique) as `size x size` RGB.
    ///
    /// Indices that cannot be decoded are absent from the result.
    async fn decode_frames(
        &self,
        path: &Path,
        indices: &[u64],
        size: u32,
    ) -> MediaResult<BTreeMap<u64, Frame>>;
}

/// Frame source backed by the FFmpeg and FFprobe binaries.
#[derive(Debug, Default, Clone)]
pub struct FfmpegFrameSource {
    runner: FfmpegRunner,
}

impl FfmpegFrameSource {
    pub fn new() -> Self {
        Self::default()
    }
}

/// `select` filter expression matching the given frame numbers.
fn select_expression(indices: &[u64]) -> String {
    let terms: Vec<String> = indices.iter().map(|i| format!("eq(n,{})", i)).collect();
    format!("select='{}'", terms.join("+"))
}

#[async_trait]
impl FrameSource for FfmpegFrameSource {
    async fn frame_count(&self, path: &Path) -> MediaResult<u64> {
        Ok(probe_video(path).await?.frame_count)
    }

    async fn decode_frames(
        &self,
        path: &Path,
        indices: &[u64],
        size: u32,
    ) -> MediaResult<BTreeMap<u64, Frame>> {
        if indices.is_empty() {
            return Ok(BTreeMap::new());
        }

        let filter = format!(
            "{},scale={}:{}:flags=bilinear",
            select_expression(indices),
            size,
            size
        );
        let cmd = FfmpegCommand::to_stdout(path)
            .video_filter(filter)
            .passthrough_timing()
            .raw_rgb24();

        let output = self.runner.capture(&cmd).await?;

        let frame_bytes = size as usize * size as usize * 3;
        let complete = output.stdout.len() / frame_bytes;

        if !output.success {
            if complete == 0 {
                return Err(output.into_error("Frame decoding failed"));
            }
            warn!(
                path = %path.display(),
                decoded = complete,
                requested = indices.len(),
                "FFmpeg exited with an error after decoding some frames"
            );
        }
        if output.stdout.len() % frame_bytes != 0 {
            warn!(
                trailing_bytes = output.stdout.len() % frame_bytes,
                "Discarding incomplete trailing frame"
            );
        }

        // Selected frames are emitted in stream order, which matches the sorted indices
        let mut frames = BTreeMap::new();
        for (chunk, &index) in output.stdout.chunks_exact(frame_bytes).zip(indices) {
            frames.insert(index, Frame::from_rgb24(chunk, size, size, size)?);
        }

        debug!(
            path = %path.display(),
            decoded = frames.len(),
            requested = indices.len(),
            "Decoded frames"
        );

        Ok(frames)
    }
}

/// Turns a video file into a fixed-length frame sequence.
#[derive(Clone)]
pub struct FrameSampler {
    source: Arc<dyn FrameSource>,
    config: SamplerConfig,
}

impl FrameSampler {
    pub fn new(source: Arc<dyn FrameSource>, config: SamplerConfig) -> Self {
        Self { source, config }
    }

    /// Sampler that decodes with FFmpeg.
    pub fn ffmpeg(config: SamplerConfig) -> Self {
        Self::new(Arc::new(FfmpegFrameSource::new()), config)
    }

    pub fn config(&self) -> SamplerConfig {
        self.config
    }

    /// Sample exactly `num_frames` frames from the video at `path`.
    pub async fn sample(&self, path: &Path) -> MediaResult<Vec<Frame>> {
        let start = Instant::now();
        let SamplerConfig {
            num_frames,
            frame_size,
        } = self.config;

        let total = self.source.frame_count(path).await?;
        if total == 0 {
            return Err(MediaError::invalid_video("video reports zero frames"));
        }

        let indices = sample_indices(total, num_frames);
        let mut unique = indices.clone();
        unique.dedup();

        let decoded = self.source.decode_frames(path, &unique, frame_size).await?;

        let mut frames: Vec<Frame> = indices
            .iter()
            .filter_map(|i| decoded.get(i).cloned())
            .collect();
        frames.truncate(num_frames);

        let padded = num_frames - frames.len();
        if padded > 0 {
            debug!(total_frames = total, padded, "Padding frame sequence");
            counter!("frame_sampler_padded_frames_total").increment(padded as u64);
        }
        frames.resize_with(num_frames, || Frame::zeros(frame_size));

        histogram!("frame_sampler_duration_seconds").record(start.elapsed().as_secs_f64());

        Ok(frames)
    }
}
