//! Typed configuration from environment variables or a TOML file.
//!
//! Loaded once at startup. Malformed values fail fast with
//! [`Error::Config`]; absent values fall back to defaults.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use opentelemetry::KeyValue;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Error, Result};
use crate::manager::ManagerConfig;
use crate::policy::RetryPolicy;
use crate::store::{JsonFileStore, MemoryStore, PersistenceStore, SqliteStore};
use crate::telemetry::TelemetryConfig;

const DEFAULT_JSON_PATH: &str = "outbox-queue.json";
const DEFAULT_SQLITE_PATH: &str = "outbox-queue.db";

/// Which persistence backend holds the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Memory,
    #[default]
    Json,
    Sqlite,
}

impl StoreBackend {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Json => "json",
            Self::Sqlite => "sqlite",
        }
    }
}

impl std::str::FromStr for StoreBackend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "memory" => Ok(Self::Memory),
            "json" => Ok(Self::Json),
            "sqlite" => Ok(Self::Sqlite),
            other => Err(Error::Config(format!(
                "unknown store backend {other:?} (expected memory, json or sqlite)"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub store_backend: StoreBackend,
    /// File for the json and sqlite backends.
    pub store_path: Option<PathBuf>,
    pub submission_interval_secs: u64,
    /// 0 disables the cap.
    pub max_concurrent: usize,
    /// Per-attempt time limit. 0, the default, disables it.
    pub request_time_limit_secs: u64,
    pub progress_interval_ms: u64,
    /// Attempts per unit before it is dropped. Unset means retry forever.
    pub max_attempts: Option<u32>,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            store_backend: StoreBackend::default(),
            store_path: None,
            submission_interval_secs: 10,
            max_concurrent: 10,
            request_time_limit_secs: 0,
            progress_interval_ms: 100,
            max_attempts: None,
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; `from_env` with the environment swapped out.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let defaults = Self::default();
        let config = Self {
            store_backend: match lookup("OUTBOX_STORE") {
                Some(value) => value.parse()?,
                None => defaults.store_backend,
            },
            store_path: lookup("OUTBOX_STORE_PATH").map(PathBuf::from),
            submission_interval_secs: parsed(&lookup, "OUTBOX_SUBMISSION_INTERVAL_SECS")?
                .unwrap_or(defaults.submission_interval_secs),
            max_concurrent: parsed(&lookup, "OUTBOX_MAX_CONCURRENT")?
                .unwrap_or(defaults.max_concurrent),
            request_time_limit_secs: parsed(&lookup, "OUTBOX_REQUEST_TIME_LIMIT_SECS")?
                .unwrap_or(defaults.request_time_limit_secs),
            progress_interval_ms: parsed(&lookup, "OUTBOX_PROGRESS_INTERVAL_MS")?
                .unwrap_or(defaults.progress_interval_ms),
            max_attempts: parsed(&lookup, "OUTBOX_MAX_ATTEMPTS")?,
            otel_endpoint: lookup("OTEL_ENDPOINT"),
            log_level: lookup("LOG_LEVEL").unwrap_or(defaults.log_level),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(source: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(source).map_err(|e| Error::Config(format!("invalid config file: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML config file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&source)
    }

    fn validate(&self) -> Result<()> {
        if self.submission_interval_secs == 0 {
            return Err(Error::Config("submission_interval_secs must be at least 1".into()));
        }
        if self.max_attempts == Some(0) {
            return Err(Error::Config("max_attempts must be at least 1 when set".into()));
        }
        Ok(())
    }

    pub fn manager_config(&self) -> ManagerConfig {
        ManagerConfig {
            submission_interval: Duration::from_secs(self.submission_interval_secs),
            max_concurrent: (self.max_concurrent > 0).then_some(self.max_concurrent),
            request_time_limit: (self.request_time_limit_secs > 0)
                .then(|| Duration::from_secs(self.request_time_limit_secs)),
            progress_interval: Duration::from_millis(self.progress_interval_ms),
            retry: match self.max_attempts {
                Some(max) => RetryPolicy::limited(max),
                None => RetryPolicy::unlimited(),
            },
        }
    }

    /// Telemetry settings for this queue, tagged with how it is stored and
    /// driven so exported data can be told apart per deployment.
    pub fn telemetry_config(&self, service_name: &str) -> TelemetryConfig {
        let mut resource_attributes = vec![
            KeyValue::new("outbox.store.backend", self.store_backend.as_str()),
            KeyValue::new(
                "outbox.submission_interval_secs",
                self.submission_interval_secs as i64,
            ),
            KeyValue::new("outbox.max_concurrent", self.max_concurrent as i64),
        ];
        if let Some(path) = self.resolved_store_path() {
            resource_attributes.push(KeyValue::new(
                "outbox.store.path",
                path.display().to_string(),
            ));
        }
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
            resource_attributes,
        }
    }

    /// Path the file-backed stores use.
    pub fn resolved_store_path(&self) -> Option<PathBuf> {
        match self.store_backend {
            StoreBackend::Memory => None,
            StoreBackend::Json => Some(
                self.store_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_JSON_PATH)),
            ),
            StoreBackend::Sqlite => Some(
                self.store_path
                    .clone()
                    .unwrap_or_else(|| PathBuf::from(DEFAULT_SQLITE_PATH)),
            ),
        }
    }

    /// Open the configured store.
    pub fn open_store(&self) -> Result<Arc<dyn PersistenceStore>> {
        let path = self.resolved_store_path();
        let store: Arc<dyn PersistenceStore> = match (self.store_backend, path) {
            (StoreBackend::Json, Some(path)) => {
                let store = JsonFileStore::new(path);
                info!(path = %store.path().display(), "using json queue store");
                Arc::new(store)
            }
            (StoreBackend::Sqlite, Some(path)) => Arc::new(SqliteStore::open(path)?),
            _ => Arc::new(MemoryStore::new()),
        };
        Ok(store)
    }
}

fn parsed<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    lookup(name)
        .map(|raw| {
            raw.trim()
                .parse()
                .map_err(|e| Error::Config(format!("invalid value for {name}: {raw:?} ({e})")))
        })
        .transpose()
}
