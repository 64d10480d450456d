//! Firestore REST API client.
//!
//! - Service account auth with a cached, refreshing token
//! - Pooled HTTP client with connect and request timeouts
//! - Retry with exponential backoff for transient failures
//! - A tracing span and request metrics per HTTP call

use std::sync::Arc;
use std::time::{Duration, Instant};

use gcp_auth::{CustomServiceAccount, TokenProvider};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use tracing::{debug, info_span, Instrument};

use crate::error::{FirestoreError, FirestoreResult};
use crate::metrics::record_request;
use crate::retry::{with_retry, with_retry_create, RetryConfig};
use crate::token_cache::TokenCache;
use crate::types::{Document, RunQueryRequest, RunQueryResponse, StructuredQuery};

/// Firestore client configuration.
#[derive(Debug, Clone)]
pub struct FirestoreConfig {
    pub project_id: String,
    /// Database ID (usually "(default)")
    pub database_id: String,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub retry: RetryConfig,
}

impl FirestoreConfig {
    pub fn new(project_id: impl Into<String>) -> Self {
        Self {
            project_id: project_id.into(),
            database_id: "(default)".to_string(),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            retry: RetryConfig::default(),
        }
    }

    /// Create config from environment variables.
    pub fn from_env() -> FirestoreResult<Self> {
        let project_id = std::env::var("GCP_PROJECT_ID")
            .or_else(|_| std::env::var("FIREBASE_PROJECT_ID"))
            .map(|s| s.trim().to_string())
            .unwrap_or_default();

        if project_id.is_empty() {
            return Err(FirestoreError::auth_error(
                "GCP_PROJECT_ID or FIREBASE_PROJECT_ID must be set to access Firestore",
            ));
        }

        let mut config = Self::new(project_id);
        if let Ok(database_id) = std::env::var("FIRESTORE_DATABASE_ID") {
            if !database_id.trim().is_empty() {
                config.database_id = database_id.trim().to_string();
            }
        }
        if let Some(secs) = std::env::var("FIRESTORE_CONNECT_TIMEOUT_SECS")
            .ok()
            .and_then(|s| s.parse().ok())
        {
            config.connect_timeout = Duration::from_secs(secs);
        }
        config.retry = RetryConfig::from_env();
        Ok(config)
    }

    /// Root of the document tree, e.g. `.../databases/(default)/documents`.
    pub fn documents_url(&self) -> String {
        format!(
            "https://firestore.googleapis.com/v1/projects/{}/databases/{}/documents",
            self.project_id, self.database_id
        )
    }
}

/// Firestore REST API client. Cheap to clone.
#[derive(Clone)]
pub struct FirestoreClient {
    http: Client,
    config: FirestoreConfig,
    base_url: String,
    token_cache: Arc<TokenCache>,
}

impl FirestoreClient {
    /// Create a client authenticated with the service account named by
    /// `GOOGLE_APPLICATION_CREDENTIALS`.
    pub async fn new(config: FirestoreConfig) -> FirestoreResult<Self> {
        let auth = Self::create_auth_provider()?;
        Self::with_provider(config, auth)
    }

    pub fn with_provider(config: FirestoreConfig, auth: Arc<dyn TokenProvider>) -> FirestoreResult<Self> {
        let http = Client::builder()
            .timeout(config.timeout)
            .connect_timeout(config.connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .pool_max_idle_per_host(10)
            .user_agent(concat!("dfd-firestore/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(FirestoreError::Network)?;

        Ok(Self {
            http,
            base_url: config.documents_url(),
            config,
            token_cache: Arc::new(TokenCache::new(auth)),
        })
    }

    fn create_auth_provider() -> FirestoreResult<Arc<dyn TokenProvider>> {
        let service_account = CustomServiceAccount::from_env()
            .map_err(|e| FirestoreError::auth_error(format!("Failed to load service account: {}", e)))?;

        match service_account {
            Some(sa) => Ok(Arc::new(sa)),
            None => Err(FirestoreError::auth_error(
                "GOOGLE_APPLICATION_CREDENTIALS not set. \
                 Set it to the path of your service account JSON file.",
            )),
        }
    }

    pub fn config(&self) -> &FirestoreConfig {
        &self.config
    }

    /// URL of a document within the database.
    pub fn document_url(&self, collection: &str, doc_id: &str) -> String {
        format!("{}/{}/{}", self.base_url, collection, urlencoding::encode(doc_id))
    }

    /// Get a document. Missing documents are `Ok(None)`.
    pub async fn get_document(&self, collection: &str, doc_id: &str) -> FirestoreResult<Option<Document>> {
        let url = self.document_url(collection, doc_id);
        with_retry(&self.config.retry, "get_document", || async {
            match self.send("get_document", || self.http.get(&url)).await {
                Ok(response) => parse_json(response).await.map(Some),
                Err(FirestoreError::NotFound(_)) => Ok(None),
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Create a document with an explicit ID. Fails with `AlreadyExists` if
    /// the ID was already taken before this call.
    pub async fn create_document(
        &self,
        collection: &str,
        doc_id: &str,
        document: &Document,
    ) -> FirestoreResult<Document> {
        let url = format!(
            "{}/{}?documentId={}",
            self.base_url,
            collection,
            urlencoding::encode(doc_id)
        );
        let body = Document::new(document.fields.clone().unwrap_or_default());

        with_retry_create(
            &self.config.retry,
            "create_document",
            || async {
                let response = self
                    .send("create_document", || self.http.post(&url).json(&body))
                    .await?;
                parse_json(response).await
            },
            || async {
                self.get_document(collection, doc_id)
                    .await?
                    .ok_or_else(|| FirestoreError::not_found(format!("{}/{}", collection, doc_id)))
            },
        )
        .await
    }

    /// Run a structured query under `parent` (a document path relative to the
    /// database root, or empty for top-level collections).
    pub async fn run_query(&self, parent: &str, query: StructuredQuery) -> FirestoreResult<Vec<Document>> {
        let url = if parent.is_empty() {
            format!("{}:runQuery", self.base_url)
        } else {
            format!("{}/{}:runQuery", self.base_url, parent.trim_matches('/'))
        };
        let body = RunQueryRequest {
            structured_query: query,
        };

        let rows: Vec<RunQueryResponse> = with_retry(&self.config.retry, "run_query", || async {
            let response = self.send("run_query", || self.http.post(&url).json(&body)).await?;
            parse_json(response).await
        })
        .await?;

        Ok(rows.into_iter().filter_map(|r| r.document).collect())
    }

    /// Send one authorized request and map error statuses.
    ///
    /// A 401 drops the cached token and the request is sent once more with a
    /// fresh one.
    async fn send<F>(&self, operation: &'static str, build: F) -> FirestoreResult<Response>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut reauthorized = false;
        loop {
            let token = self.token_cache.get_token().await?;
            let response = self.execute(operation, build().bearer_auth(token)).await?;
            let status = response.status();

            if status.is_success() {
                return Ok(response);
            }
            if status == StatusCode::UNAUTHORIZED && !reauthorized {
                debug!(operation, "Access token rejected, refreshing");
                self.token_cache.invalidate().await;
                reauthorized = true;
                continue;
            }
            return Err(error_from_response(response).await);
        }
    }

    async fn execute(&self, operation: &'static str, request: RequestBuilder) -> FirestoreResult<Response> {
        let span = info_span!("firestore_request", operation, status = tracing::field::Empty);
        let started = Instant::now();

        let result = request.send().instrument(span.clone()).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(response) => {
                let status = response.status().as_u16();
                span.record("status", status as u64);
                record_request(operation, status, latency_ms);
                Ok(response)
            }
            Err(e) => {
                record_request(operation, 0, latency_ms);
                Err(FirestoreError::Network(e))
            }
        }
    }
}

async fn parse_json<T: DeserializeOwned>(response: Response) -> FirestoreResult<T> {
    let bytes = response.bytes().await?;
    serde_json::from_slice(&bytes)
        .map_err(|e| FirestoreError::invalid_response(format!("Failed to decode response: {}", e)))
}

async fn error_from_response(response: Response) -> FirestoreError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok());
    let body = response.text().await.unwrap_or_default();

    match (FirestoreError::from_http_status(status, error_message(&body)), retry_after) {
        (FirestoreError::RateLimited(_), Some(secs)) => FirestoreError::RateLimited(secs * 1000),
        (err, _) => err,
    }
}

/// Pull `error.message` out of a Google API error body.
fn error_message(body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| v["error"]["message"].as_str().map(str::to_string))
        .unwrap_or_else(|| body.chars().take(512).collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_env() {
        for key in [
            "GCP_PROJECT_ID",
            "FIREBASE_PROJECT_ID",
            "FIRESTORE_DATABASE_ID",
            "FIRESTORE_CONNECT_TIMEOUT_SECS",
        ] {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_config_requires_project() {
        clear_env();
        assert!(matches!(
            FirestoreConfig::from_env(),
            Err(FirestoreError::AuthError(_))
        ));

        std::env::set_var("GCP_PROJECT_ID", "  ");
        tokio_test::assert_err!(FirestoreConfig::from_env());
        clear_env();
    }

    #[test]
    #[serial]
    fn test_config_from_env() {
        clear_env();
        std::env::set_var("FIREBASE_PROJECT_ID", "deepfake-demo");
        std::env::set_var("FIRESTORE_CONNECT_TIMEOUT_SECS", "2");
        let config = FirestoreConfig::from_env().unwrap();
        clear_env();

        assert_eq!(config.project_id, "deepfake-demo");
        assert_eq!(config.database_id, "(default)");
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
        assert_eq!(
            config.documents_url(),
            "https://firestore.googleapis.com/v1/projects/deepfake-demo/databases/(default)/documents"
        );
    }

    #[test]
    fn test_error_message_extraction() {
        let body = r#"{"error": {"code": 409, "message": "Document already exists", "status": "ALREADY_EXISTS"}}"#;
        assert_eq!(error_message(body), "Document already exists");
        assert_eq!(error_message("upstream timeout"), "upstream timeout");
    }
}
