//! Model configuration.

use dfd_media::SamplerConfig;
use dfd_models::Label;
use std::path::{Path, PathBuf};

use crate::decision::DecisionPolicy;

/// Model artifact locations and pipeline parameters.
#[derive(Debug, Clone)]
pub struct ModelConfig {
    /// Directory that relative weight paths are resolved against
    pub model_dir: PathBuf,
    /// Backbone weights trained for this task
    pub xception_weights: PathBuf,
    /// Generic ImageNet backbone weights, used when the custom ones fail
    pub xception_pretrained_weights: PathBuf,
    pub gru_weights: PathBuf,
    pub dense_weights: PathBuf,
    /// Frames sampled per video
    pub num_frames: usize,
    /// Frame side length fed to the backbone
    pub frame_size: u32,
    /// GRU hidden units
    pub gru_units: usize,
    /// Score threshold for the high-score label
    pub threshold: f32,
    /// Label reported when the score reaches the threshold
    pub high_score_label: Label,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("saved_models"),
            xception_weights: PathBuf::from("xception_weights.npz"),
            xception_pretrained_weights: PathBuf::from("xception_imagenet.npz"),
            gru_weights: PathBuf::from("gru_weights.npz"),
            dense_weights: PathBuf::from("dense_weights.npz"),
            num_frames: 10,
            frame_size: 299,
            gru_units: 256,
            threshold: 0.5,
            high_score_label: Label::Fake,
        }
    }
}

impl ModelConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let path_var = |key: &str, default: PathBuf| {
            std::env::var(key).map(PathBuf::from).unwrap_or(default)
        };

        Self {
            model_dir: path_var("MODEL_DIR", defaults.model_dir),
            xception_weights: path_var("XCEPTION_WEIGHTS", defaults.xception_weights),
            xception_pretrained_weights: path_var(
                "XCEPTION_PRETRAINED_WEIGHTS",
                defaults.xception_pretrained_weights,
            ),
            gru_weights: path_var("GRU_WEIGHTS", defaults.gru_weights),
            dense_weights: path_var("DENSE_WEIGHTS", defaults.dense_weights),
            num_frames: std::env::var("NUM_FRAMES")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.num_frames),
            frame_size: std::env::var("FRAME_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.frame_size),
            gru_units: std::env::var("GRU_UNITS")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|n| *n > 0)
                .unwrap_or(defaults.gru_units),
            threshold: std::env::var("DECISION_THRESHOLD")
                .ok()
                .and_then(|s| s.parse().ok())
                .filter(|t: &f32| (0.0..=1.0).contains(t))
                .unwrap_or(defaults.threshold),
            high_score_label: std::env::var("HIGH_SCORE_LABEL")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.high_score_label),
        }
    }

    /// Resolve a weight path against the model directory.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.model_dir.join(path)
        }
    }

    pub fn xception_weights_path(&self) -> PathBuf {
        self.resolve(&self.xception_weights)
    }

    pub fn xception_pretrained_path(&self) -> PathBuf {
        self.resolve(&self.xception_pretrained_weights)
    }

    pub fn gru_weights_path(&self) -> PathBuf {
        self.resolve(&self.gru_weights)
    }

    pub fn dense_weights_path(&self) -> PathBuf {
        self.resolve(&self.dense_weights)
    }

    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            num_frames: self.num_frames,
            frame_size: self.frame_size,
        }
    }

    pub fn decision_policy(&self) -> DecisionPolicy {
        DecisionPolicy::new(self.threshold, self.high_score_label)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: &[&str] = &[
        "MODEL_DIR",
        "XCEPTION_WEIGHTS",
        "GRU_WEIGHTS",
        "NUM_FRAMES",
        "DECISION_THRESHOLD",
        "HIGH_SCORE_LABEL",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_from_env_defaults() {
        clear_env();
        let config = ModelConfig::from_env();
        assert_eq!(config.num_frames, 10);
        assert_eq!(config.frame_size, 299);
        assert_eq!(config.gru_units, 256);
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.high_score_label, Label::Fake);
        assert_eq!(
            config.gru_weights_path(),
            PathBuf::from("saved_models/gru_weights.npz")
        );
    }

    #[test]
    #[serial]
    fn test_from_env_overrides() {
        clear_env();
        std::env::set_var("MODEL_DIR", "/opt/models");
        std::env::set_var("XCEPTION_WEIGHTS", "/weights/backbone.npz");
        std::env::set_var("NUM_FRAMES", "16");
        std::env::set_var("DECISION_THRESHOLD", "0.65");
        std::env::set_var("HIGH_SCORE_LABEL", "real");

        let config = ModelConfig::from_env();
        assert_eq!(config.num_frames, 16);
        assert_eq!(config.threshold, 0.65);
        assert_eq!(config.high_score_label, Label::Real);
        assert_eq!(
            config.xception_weights_path(),
            PathBuf::from("/weights/backbone.npz")
        );
        assert_eq!(
            config.gru_weights_path(),
            PathBuf::from("/opt/models/gru_weights.npz")
        );

        clear_env();
    }

    #[test]
    #[serial]
    fn test_from_env_ignores_invalid_values() {
        clear_env();
        std::env::set_var("NUM_FRAMES", "0");
        std::env::set_var("DECISION_THRESHOLD", "1.5");
        std::env::set_var("HIGH_SCORE_LABEL", "unsure");

        let config = ModelConfig::from_env();
        assert_eq!(config.num_frames, 10);
        assert_eq!(config.threshold, 0.5);
        assert_eq!(config.high_score_label, Label::Fake);

        clear_env();
    }
}
