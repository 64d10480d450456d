//! Axum HTTP API for deepfake video classification.
//!
//! This crate provides:
//! - `POST /predict` multipart upload classified by the inference pipeline
//! - Prediction history with in-memory or Firestore persistence
//! - Health, readiness and Prometheus metrics endpoints

pub mod config;
pub mod error;
pub mod handlers;
pub mod metrics;
pub mod middleware;
pub mod routes;
pub mod state;
pub mod store;

pub use config::{ApiConfig, PersistenceBackend};
pub use error::{ApiError, ApiResult};
pub use routes::create_router;
pub use state::AppState;
pub use store::{MemoryStore, PredictionStore};
