//! FFmpeg CLI wrapper for video frame sampling.
//!
//! This crate provides:
//! - Type-safe FFmpeg command building
//! - FFprobe stream inspection (dimensions, frame rate, frame count)
//! - Raw RGB frame decoding at arbitrary frame indices
//! - The fixed-length frame sampler feeding the classifier

pub mod command;
pub mod error;
pub mod frame;
pub mod probe;
pub mod sampler;

pub use command::{check_ffmpeg, check_ffprobe, FfmpegCommand, FfmpegRunner};
pub use error::{MediaError, MediaResult};
pub use frame::Frame;
pub use probe::{probe_video, VideoInfo};
pub use sampler::{sample_indices, FfmpegFrameSource, FrameSampler, FrameSource, SamplerConfig};
