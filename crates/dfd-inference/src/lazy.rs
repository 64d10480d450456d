//! Lazily loaded, process-wide model components.

use std::sync::Arc;
use tokio::sync::OnceCell;
use tracing::{debug, error};

use crate::error::{InferenceError, InferenceResult};

type Loader<T> = Arc<dyn Fn() -> InferenceResult<Arc<T>> + Send + Sync>;

/// A component built on first use and shared read-only afterwards.
///
/// Loading runs on the blocking pool. Concurrent first callers wait for a
/// single load. A failed load leaves the component empty so the next call
/// tries again; a successful load is never repeated.
pub struct LazyComponent<T: ?Sized + Send + Sync + 'static> {
    name: &'static str,
    cell: OnceCell<Arc<T>>,
    loader: Loader<T>,
}

impl<T: ?Sized + Send + Sync + 'static> LazyComponent<T> {
    pub fn new<F>(name: &'static str, loader: F) -> Self
    where
        F: Fn() -> InferenceResult<Arc<T>> + Send + Sync + 'static,
    {
        Self {
            name,
            cell: OnceCell::new(),
            loader: Arc::new(loader),
        }
    }

    /// A component that is already loaded.
    pub fn ready(name: &'static str, value: Arc<T>) -> Self {
        let missing = move || -> InferenceResult<Arc<T>> {
            Err(InferenceError::internal(format!("{} has no loader", name)))
        };
        Self {
            name,
            cell: OnceCell::new_with(Some(value)),
            loader: Arc::new(missing),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_loaded(&self) -> bool {
        self.cell.initialized()
    }

    /// The component if it has been loaded.
    pub fn try_get(&self) -> Option<Arc<T>> {
        self.cell.get().cloned()
    }

    /// Get the component, loading it if necessary.
    pub async fn get(&self) -> InferenceResult<Arc<T>> {
        let value = self
            .cell
            .get_or_try_init(|| async {
                debug!(component = self.name, "Loading model component");
                let loader = Arc::clone(&self.loader);
                let result = tokio::task::spawn_blocking(move || loader())
                    .await
                    .map_err(|e| InferenceError::internal(format!("{} loader panicked: {}", self.name, e)))
                    .and_then(|r| r);
                if let Err(e) = &result {
                    error!(component = self.name, error = %e, "Model component failed to load");
                }
                result
            })
            .await?;
        Ok(Arc::clone(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn test_loads_once() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let component = LazyComponent::new("answer", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(42u32))
        });

        assert!(!component.is_loaded());
        assert!(component.try_get().is_none());

        let (a, b) = tokio::join!(component.get(), component.get());
        assert_eq!(*a.unwrap(), 42);
        assert_eq!(*b.unwrap(), 42);
        assert_eq!(*component.get().await.unwrap(), 42);

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(component.is_loaded());
    }

    #[tokio::test]
    async fn test_failed_load_is_retried() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();
        let component = LazyComponent::new("flaky", move || {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(InferenceError::WeightsUnavailable("not yet".into()))
            } else {
                Ok(Arc::new("loaded".to_string()))
            }
        });

        tokio_test::assert_err!(component.get().await);
        assert!(!component.is_loaded());
        assert_eq!(component.get().await.unwrap().as_str(), "loaded");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_ready_component() {
        let component: LazyComponent<str> = LazyComponent::ready("static", Arc::from("value"));
        assert!(component.is_loaded());
        assert_eq!(&*component.get().await.unwrap(), "value");
        assert_eq!(component.name(), "static");
    }
}
