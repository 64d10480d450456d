//! API configuration.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

/// Where prediction records are kept.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PersistenceBackend {
    /// Records are not stored and `/predictions` is unavailable.
    #[default]
    None,
    /// Process-local, lost on restart.
    Memory,
    Firestore,
}

impl PersistenceBackend {
    pub fn as_str(&self) -> &'static str {
        match self {
            PersistenceBackend::None => "none",
            PersistenceBackend::Memory => "memory",
            PersistenceBackend::Firestore => "firestore",
        }
    }
}

impl fmt::Display for PersistenceBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PersistenceBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "none" | "off" => Ok(PersistenceBackend::None),
            "memory" => Ok(PersistenceBackend::Memory),
            "firestore" => Ok(PersistenceBackend::Firestore),
            other => Err(format!("unknown persistence backend: {}", other)),
        }
    }
}

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub host: String,
    pub port: u16,
    pub cors_origins: Vec<String>,
    /// Max request body size in bytes
    pub max_body_size: usize,
    /// Environment (development/production)
    pub environment: String,
    /// Directory receiving uploads while they are classified
    pub upload_dir: PathBuf,
    /// Longest declared duration accepted, in seconds (inclusive)
    pub max_upload_duration_secs: f64,
    pub persistence: PersistenceBackend,
    pub predictions_collection: String,
    pub metrics_enabled: bool,
    /// Load model weights at startup instead of on the first request
    pub warm_up: bool,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            max_body_size: 200 * 1024 * 1024,
            environment: "development".to_string(),
            upload_dir: PathBuf::from("uploads"),
            max_upload_duration_secs: 30.0,
            persistence: PersistenceBackend::None,
            predictions_collection: "predictions".to_string(),
            metrics_enabled: true,
            warm_up: false,
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        let persistence = match std::env::var("PERSISTENCE_BACKEND") {
            Ok(value) => value.parse().unwrap_or_else(|e| {
                tracing::warn!("{}, persistence disabled", e);
                PersistenceBackend::None
            }),
            Err(_) => defaults.persistence,
        };

        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: env_parse("API_PORT").unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| {
                    s.split(',')
                        .map(|s| s.trim().to_string())
                        .filter(|s| !s.is_empty())
                        .collect()
                })
                .unwrap_or(defaults.cors_origins),
            max_body_size: env_parse("MAX_BODY_SIZE").unwrap_or(defaults.max_body_size),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            upload_dir: std::env::var("UPLOAD_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_dir),
            max_upload_duration_secs: env_parse::<f64>("MAX_UPLOAD_DURATION_SECS")
                .filter(|d| d.is_finite() && *d > 0.0)
                .unwrap_or(defaults.max_upload_duration_secs),
            persistence,
            predictions_collection: std::env::var("PREDICTIONS_COLLECTION")
                .ok()
                .filter(|s| !s.trim().is_empty())
                .unwrap_or(defaults.predictions_collection),
            metrics_enabled: env_flag("METRICS_ENABLED").unwrap_or(defaults.metrics_enabled),
            warm_up: env_flag("MODEL_WARMUP").unwrap_or(defaults.warm_up),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.eq_ignore_ascii_case("production")
    }
}

fn env_parse<T: FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    const KEYS: [&str; 7] = [
        "API_PORT",
        "CORS_ORIGINS",
        "UPLOAD_DIR",
        "MAX_UPLOAD_DURATION_SECS",
        "PERSISTENCE_BACKEND",
        "METRICS_ENABLED",
        "MODEL_WARMUP",
    ];

    fn clear_env() {
        for key in KEYS {
            std::env::remove_var(key);
        }
    }

    #[test]
    #[serial]
    fn test_defaults() {
        clear_env();
        let config = ApiConfig::from_env();
        assert_eq!(config.port, 8000);
        assert_eq!(config.max_upload_duration_secs, 30.0);
        assert_eq!(config.persistence, PersistenceBackend::None);
        assert_eq!(config.cors_origins, vec!["*"]);
        assert!(config.metrics_enabled);
        assert!(!config.warm_up);
    }

    #[test]
    #[serial]
    fn test_from_env() {
        clear_env();
        std::env::set_var("API_PORT", "9100");
        std::env::set_var("CORS_ORIGINS", "https://a.example, https://b.example,");
        std::env::set_var("UPLOAD_DIR", "/tmp/dfd-uploads");
        std::env::set_var("MAX_UPLOAD_DURATION_SECS", "-4");
        std::env::set_var("PERSISTENCE_BACKEND", "Memory");
        std::env::set_var("METRICS_ENABLED", "false");
        std::env::set_var("MODEL_WARMUP", "1");
        let config = ApiConfig::from_env();
        clear_env();

        assert_eq!(config.port, 9100);
        assert_eq!(config.cors_origins, vec!["https://a.example", "https://b.example"]);
        assert_eq!(config.upload_dir, PathBuf::from("/tmp/dfd-uploads"));
        assert_eq!(config.max_upload_duration_secs, 30.0);
        assert_eq!(config.persistence, PersistenceBackend::Memory);
        assert!(!config.metrics_enabled);
        assert!(config.warm_up);
    }

    #[test]
    fn test_backend_parsing() {
        assert_eq!("".parse::<PersistenceBackend>(), Ok(PersistenceBackend::None));
        assert_eq!(" firestore ".parse::<PersistenceBackend>(), Ok(PersistenceBackend::Firestore));
        assert!("mongo".parse::<PersistenceBackend>().is_err());
    }
}
