//! Cached OAuth access tokens for the Firestore REST API.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use gcp_auth::TokenProvider;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::{FirestoreError, FirestoreResult};

/// Refresh this long before the token expires.
const REFRESH_MARGIN: Duration = Duration::from_secs(60);

/// Used when the provider reports an expiry we cannot convert.
const FALLBACK_TTL: Duration = Duration::from_secs(50 * 60);

pub const FIRESTORE_SCOPE: &str = "https://www.googleapis.com/auth/datastore";

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    expires_at: Instant,
}

impl CachedToken {
    fn is_fresh(&self, now: Instant) -> bool {
        now + REFRESH_MARGIN < self.expires_at
    }

    fn is_usable(&self, now: Instant) -> bool {
        now < self.expires_at
    }
}

/// Convert a wall-clock expiry into a monotonic deadline.
fn deadline(expires: DateTime<Utc>, wall_now: DateTime<Utc>, now: Instant) -> Instant {
    if expires <= wall_now {
        return now;
    }
    match (expires - wall_now).to_std() {
        Ok(ttl) => now + ttl,
        Err(_) => now + FALLBACK_TTL,
    }
}

/// Shared token cache. Readers take the fast path; one writer refreshes.
pub struct TokenCache {
    provider: Arc<dyn TokenProvider>,
    cached: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(provider: Arc<dyn TokenProvider>) -> Self {
        Self {
            provider,
            cached: RwLock::new(None),
        }
    }

    /// Drop the cached token, forcing a refresh on next use.
    pub async fn invalidate(&self) {
        *self.cached.write().await = None;
    }

    /// Whether no fresh token is cached.
    pub async fn needs_refresh(&self) -> bool {
        self.cached
            .read()
            .await
            .as_ref()
            .map_or(true, |t| !t.is_fresh(Instant::now()))
    }

    /// Get an access token, refreshing if it is close to expiry.
    ///
    /// If the refresh fails but the old token has not expired yet, the old
    /// token is returned.
    pub async fn get_token(&self) -> FirestoreResult<String> {
        if let Some(token) = self.cached.read().await.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        let mut cached = self.cached.write().await;
        if let Some(token) = cached.as_ref() {
            if token.is_fresh(Instant::now()) {
                return Ok(token.value.clone());
            }
        }

        match self.provider.token(&[FIRESTORE_SCOPE]).await {
            Ok(token) => {
                let expires_at = deadline(token.expires_at(), Utc::now(), Instant::now());
                let value = token.as_str().to_string();
                debug!(
                    ttl_secs = expires_at.saturating_duration_since(Instant::now()).as_secs(),
                    "Refreshed Firestore access token"
                );
                *cached = Some(CachedToken {
                    value: value.clone(),
                    expires_at,
                });
                Ok(value)
            }
            Err(e) => match cached.as_ref() {
                Some(token) if token.is_usable(Instant::now()) => {
                    warn!(error = %e, "Token refresh failed, reusing unexpired token");
                    Ok(token.value.clone())
                }
                _ => Err(FirestoreError::auth_error(format!(
                    "Failed to obtain access token: {}",
                    e
                ))),
            },
        }
    }
}
