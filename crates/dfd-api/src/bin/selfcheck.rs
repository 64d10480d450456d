//! Pre-flight check for a deployment.
//!
//! Usage: `dfd-selfcheck [VIDEO]`
//!
//! Verifies FFmpeg tooling and the upload directory, inspects every weight
//! archive, loads the model and prints where each layer's weights came from.
//! With a video argument it also probes and classifies that file.

use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use candle_core::Device;
use dfd_api::ApiConfig;
use dfd_inference::{
    DenseHead, Detector, Gru, ModelConfig, VideoClassifier, WeightArchive, XceptionConfig,
};
use dfd_media::{check_ffmpeg, check_ffprobe, probe_video};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .init();

    let video = std::env::args_os().nth(1).map(PathBuf::from);

    println!("== tools");
    println!("ffmpeg   {}", check_ffmpeg()?.display());
    println!("ffprobe  {}", check_ffprobe()?.display());

    println!("== uploads");
    let api_config = ApiConfig::from_env();
    check_upload_dir(&api_config.upload_dir)?;
    println!("writable {}", api_config.upload_dir.display());

    println!("== weights");
    let model_config = ModelConfig::from_env();
    let backbone = XceptionConfig::default();
    let expected = [
        (model_config.xception_weights_path(), backbone.weight_shapes()),
        (model_config.xception_pretrained_path(), backbone.weight_shapes()),
        (
            model_config.gru_weights_path(),
            Gru::weight_shapes(backbone.embedding_dim(), model_config.gru_units),
        ),
        (model_config.dense_weights_path(), DenseHead::weight_shapes(model_config.gru_units)),
    ];
    for (path, shapes) in &expected {
        inspect_archive(path, shapes);
    }

    println!("== model");
    let detector = Detector::new(model_config);
    detector.warm_up().await.context("loading model")?;
    let status = detector.weights_status();
    println!("{}", serde_json::to_string_pretty(&status)?);
    if status.degraded() {
        println!("WARNING: some layers run on fallback weights; predictions are unreliable");
    }

    if let Some(video) = video {
        println!("== video");
        let info = probe_video(&video)
            .await
            .with_context(|| format!("probing {}", video.display()))?;
        println!(
            "{}: {:.2}s, {}x{}, {:.2} fps, {} frames",
            video.display(),
            info.duration,
            info.width,
            info.height,
            info.fps,
            info.frame_count
        );
        let prediction = detector
            .predict(&video)
            .await
            .with_context(|| format!("classifying {}", video.display()))?;
        println!("{}", serde_json::to_string(&prediction)?);
    }

    Ok(())
}

fn check_upload_dir(dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("creating {}", dir.display()))?;
    let probe = tempfile::NamedTempFile::new_in(dir)
        .with_context(|| format!("{} is not writable", dir.display()))?;
    probe.close()?;
    if !dir.is_dir() {
        bail!("{} is not a directory", dir.display());
    }
    Ok(())
}

/// Missing or mismatched archives are reported, not fatal; the model falls
/// back for those layers.
fn inspect_archive(path: &Path, expected: &[Vec<usize>]) {
    match WeightArchive::open(path, &Device::Cpu) {
        Ok(archive) => match archive.check_shapes(expected) {
            Ok(()) => println!("ok       {} ({} arrays)", path.display(), archive.len()),
            Err(e) => {
                println!("MISMATCH {}: {}", path.display(), e);
                if let Some(first) = archive.shapes().first() {
                    println!("         first array shape {:?}", first);
                }
            }
        },
        Err(e) => println!("MISSING  {}: {}", path.display(), e),
    }
}
