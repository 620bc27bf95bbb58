//! Querier configuration.
//!
//! Loaded from the TOML file named by `QUERIER_CONFIG` (if set), then
//! overridden field by field from `QUERIER_*` environment variables.
//! Every field has a default, so an empty file is a valid config.

use crate::cache::BoundaryTruncation;
use crate::{QuerierError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuerierConfig {
    /// HTTP listen address
    pub listen_addr: String,

    /// Most recent window, in seconds, that is never cached
    pub flux_interval_secs: u64,

    /// How long cached series stay valid
    pub cache_ttl_secs: u64,

    /// Entries kept by the in-memory cache (0 disables caching)
    pub cache_max_entries: usize,

    /// Largest `limit + offset` a paginated traces list may ask for
    pub max_trace_pagination: u64,

    /// Per-request deadline (0 = none)
    pub query_timeout_secs: u64,

    /// Rows a single store query may return before it is rejected
    pub max_result_rows: usize,

    /// DuckDB file; in-memory when unset
    pub database_path: Option<PathBuf>,

    pub log_boundary_truncation: BoundaryTruncation,

    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive used when `RUST_LOG` is not set
    pub level: String,
    /// Emit JSON lines instead of the compact human format
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl Default for QuerierConfig {
    fn default() -> Self {
        Self {
            listen_addr: "0.0.0.0:8080".to_string(),
            flux_interval_secs: 300,
            cache_ttl_secs: 3600,
            cache_max_entries: 10_000,
            max_trace_pagination: 10_000,
            query_timeout_secs: 60,
            max_result_rows: 1_000_000,
            database_path: None,
            log_boundary_truncation: BoundaryTruncation::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl QuerierConfig {
    /// Load from `QUERIER_CONFIG` (or defaults) and apply environment
    /// overrides.
    pub fn load() -> Result<Self> {
        let mut config = match std::env::var("QUERIER_CONFIG") {
            Ok(path) => Self::from_file(&path)?,
            Err(_) => Self::default(),
        };
        config.apply_overrides(|name| std::env::var(name).ok())?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| {
            QuerierError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> Result<Self> {
        Ok(toml::from_str(contents)?)
    }

    /// Apply `QUERIER_*` overrides looked up through `lookup`.
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(addr) = lookup("QUERIER_LISTEN_ADDR") {
            self.listen_addr = addr;
        }
        if let Some(port) = lookup("PORT") {
            let port: u16 = parse_var("PORT", &port)?;
            let host = self
                .listen_addr
                .rsplit_once(':')
                .map(|(host, _)| host.to_string())
                .unwrap_or_else(|| "0.0.0.0".to_string());
            self.listen_addr = format!("{}:{}", host, port);
        }
        if let Some(v) = lookup("QUERIER_FLUX_INTERVAL_SECS") {
            self.flux_interval_secs = parse_var("QUERIER_FLUX_INTERVAL_SECS", &v)?;
        }
        if let Some(v) = lookup("QUERIER_CACHE_TTL_SECS") {
            self.cache_ttl_secs = parse_var("QUERIER_CACHE_TTL_SECS", &v)?;
        }
        if let Some(v) = lookup("QUERIER_CACHE_MAX_ENTRIES") {
            self.cache_max_entries = parse_var("QUERIER_CACHE_MAX_ENTRIES", &v)?;
        }
        if let Some(v) = lookup("QUERIER_MAX_TRACE_PAGINATION") {
            self.max_trace_pagination = parse_var("QUERIER_MAX_TRACE_PAGINATION", &v)?;
        }
        if let Some(v) = lookup("QUERIER_QUERY_TIMEOUT_SECS") {
            self.query_timeout_secs = parse_var("QUERIER_QUERY_TIMEOUT_SECS", &v)?;
        }
        if let Some(v) = lookup("QUERIER_MAX_RESULT_ROWS") {
            self.max_result_rows = parse_var("QUERIER_MAX_RESULT_ROWS", &v)?;
        }
        if let Some(v) = lookup("QUERIER_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("QUERIER_LOG_LEVEL") {
            self.logging.level = v;
        }
        if let Some(v) = lookup("QUERIER_LOG_JSON") {
            self.logging.json = parse_var("QUERIER_LOG_JSON", &v)?;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.listen_addr.is_empty() {
            return Err(QuerierError::Config(
                "listen_addr cannot be empty".to_string(),
            ));
        }
        if self.max_trace_pagination == 0 {
            return Err(QuerierError::Config(
                "max_trace_pagination must be > 0".to_string(),
            ));
        }
        if self.max_result_rows == 0 {
            return Err(QuerierError::Config(
                "max_result_rows must be > 0".to_string(),
            ));
        }
        if self.cache_max_entries > 0 && self.cache_ttl_secs == 0 {
            return Err(QuerierError::Config(
                "cache_ttl_secs must be > 0 when caching is enabled".to_string(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T>(name: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    value
        .trim()
        .parse()
        .map_err(|e| QuerierError::Config(format!("Invalid {}={:?}: {}", name, value, e)))
}
