//! Application state.

use std::sync::Arc;

use dfd_inference::{Detector, ModelConfig, VideoClassifier};

use crate::config::ApiConfig;
use crate::store::{self, PredictionStore, StoreResult};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: ApiConfig,
    pub classifier: Arc<dyn VideoClassifier>,
    /// `None` when persistence is disabled
    pub store: Option<Arc<dyn PredictionStore>>,
}

impl AppState {
    pub fn new(
        config: ApiConfig,
        classifier: Arc<dyn VideoClassifier>,
        store: Option<Arc<dyn PredictionStore>>,
    ) -> Self {
        Self {
            config,
            classifier,
            store,
        }
    }

    /// Build the detector and prediction store from the environment.
    ///
    /// Model weights are not read here; the detector loads them on first use.
    pub async fn from_env(config: ApiConfig) -> StoreResult<Self> {
        let model_config = ModelConfig::from_env();
        tracing::info!(
            model_dir = %model_config.model_dir.display(),
            num_frames = model_config.num_frames,
            frame_size = model_config.frame_size,
            "Model config loaded"
        );

        let classifier: Arc<dyn VideoClassifier> = Arc::new(Detector::new(model_config));
        let store = store::from_config(&config).await?;
        Ok(Self::new(config, classifier, store))
    }
}
