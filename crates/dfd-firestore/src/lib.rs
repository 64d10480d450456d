//! Firestore REST API client.
//!
//! This crate provides:
//! - Service account authentication via gcp_auth with a refreshing token cache
//! - Document get/create and structured queries with retry and metrics
//! - The prediction history repository

pub mod client;
pub mod error;
pub mod metrics;
pub mod prediction_repo;
pub mod retry;
pub mod token_cache;
pub mod types;

pub use client::{FirestoreClient, FirestoreConfig};
pub use error::{FirestoreError, FirestoreResult};
pub use prediction_repo::PredictionRepository;
pub use retry::RetryConfig;
pub use types::{Direction, Document, FromFirestoreValue, StructuredQuery, ToFirestoreValue, Value};
