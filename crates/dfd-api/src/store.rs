//! Prediction history backends.

use std::sync::Arc;

use async_trait::async_trait;
use dfd_firestore::{FirestoreClient, FirestoreConfig, FirestoreError, PredictionRepository};
use dfd_models::PredictionRecord;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::info;

use crate::config::{ApiConfig, PersistenceBackend};

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Firestore(#[from] FirestoreError),
}

/// Append-only store of prediction records.
#[async_trait]
pub trait PredictionStore: Send + Sync {
    fn backend(&self) -> PersistenceBackend;

    async fn record(&self, record: &PredictionRecord) -> StoreResult<()>;

    /// Newest first; `None` returns everything.
    async fn list_recent(&self, limit: Option<usize>) -> StoreResult<Vec<PredictionRecord>>;

    /// Check the backend is reachable.
    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

/// Records kept in process memory.
#[derive(Default)]
pub struct MemoryStore {
    records: RwLock<Vec<PredictionRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PredictionStore for MemoryStore {
    fn backend(&self) -> PersistenceBackend {
        PersistenceBackend::Memory
    }

    async fn record(&self, record: &PredictionRecord) -> StoreResult<()> {
        self.records.write().await.push(record.clone());
        Ok(())
    }

    async fn list_recent(&self, limit: Option<usize>) -> StoreResult<Vec<PredictionRecord>> {
        // Insertion order breaks timestamp ties, latest first.
        let mut records: Vec<PredictionRecord> = self.records.read().await.iter().rev().cloned().collect();
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        if let Some(limit) = limit {
            records.truncate(limit);
        }
        Ok(records)
    }
}

/// Records kept in a Firestore collection.
pub struct FirestoreStore {
    repo: PredictionRepository,
}

impl FirestoreStore {
    pub fn new(repo: PredictionRepository) -> Self {
        Self { repo }
    }
}

#[async_trait]
impl PredictionStore for FirestoreStore {
    fn backend(&self) -> PersistenceBackend {
        PersistenceBackend::Firestore
    }

    async fn record(&self, record: &PredictionRecord) -> StoreResult<()> {
        Ok(self.repo.record(record).await?)
    }

    async fn list_recent(&self, limit: Option<usize>) -> StoreResult<Vec<PredictionRecord>> {
        Ok(self.repo.list_recent(limit).await?)
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(self.repo.ping().await?)
    }
}

/// Build the store selected by the configuration.
pub async fn from_config(config: &ApiConfig) -> StoreResult<Option<Arc<dyn PredictionStore>>> {
    let store: Arc<dyn PredictionStore> = match config.persistence {
        PersistenceBackend::None => {
            info!("Prediction persistence disabled");
            return Ok(None);
        }
        PersistenceBackend::Memory => Arc::new(MemoryStore::new()),
        PersistenceBackend::Firestore => {
            let client = FirestoreClient::new(FirestoreConfig::from_env()?).await?;
            Arc::new(FirestoreStore::new(PredictionRepository::new(
                client,
                config.predictions_collection.clone(),
            )))
        }
    };
    info!(backend = %store.backend(), "Prediction persistence enabled");
    Ok(Some(store))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, Utc};
    use dfd_models::{Label, Prediction, PredictionMetadata};

    fn record(name: &str, age_secs: i64) -> PredictionRecord {
        let mut record = PredictionRecord::new(
            Prediction::new(Label::Real, 0.7),
            PredictionMetadata {
                filename: name.to_string(),
                ..Default::default()
            },
        );
        record.timestamp = Utc::now() - Duration::seconds(age_secs);
        record
    }

    #[tokio::test]
    async fn test_memory_store_newest_first() {
        let store = MemoryStore::new();
        store.record(&record("old.mp4", 300)).await.unwrap();
        store.record(&record("new.mp4", 1)).await.unwrap();
        store.record(&record("mid.mp4", 60)).await.unwrap();

        let names: Vec<String> = store
            .list_recent(None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.filename)
            .collect();
        assert_eq!(names, vec!["new.mp4", "mid.mp4", "old.mp4"]);

        let limited = store.list_recent(Some(1)).await.unwrap();
        assert_eq!(limited.len(), 1);
        assert_eq!(limited[0].filename, "new.mp4");
    }

    #[tokio::test]
    async fn test_disabled_backend_builds_no_store() {
        let config = ApiConfig::default();
        assert!(from_config(&config).await.unwrap().is_none());

        let config = ApiConfig {
            persistence: PersistenceBackend::Memory,
            ..ApiConfig::default()
        };
        let store = from_config(&config).await.unwrap().unwrap();
        assert_eq!(store.backend(), PersistenceBackend::Memory);
        tokio_test::assert_ok!(store.ping().await);
    }
}
