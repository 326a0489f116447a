//! # Worker Configuration
//!
//! [`WorkerConfig`] is loaded from an optional YAML file and then overridden
//! field by field from `BRRTW_*` environment variables. Every field has a
//! default, so an empty file (or no file) is a valid configuration.
//!
//! | Env var | Field |
//! |---------|-------|
//! | `BRRTW_WORKER_NAME` | `name` |
//! | `BRRTW_MAX_REQUESTS` | `max_requests` |
//! | `BRRTW_MAX_CONSECUTIVE_FAILURES` | `max_consecutive_failures` |
//! | `BRRTW_STACK_SIZE` | `stack_size` (decimal or `0x` hex) |
//! | `BRRTW_CACHE_MAX_ENTRIES` | `cache.max_entries` |
//! | `BRRTW_CACHE_SWEEP_INTERVAL` | `cache.sweep_interval` |
//! | `BRRTW_INHERIT_ENV` | `inherit_process_env` |
//! | `BRRTW_UPLOAD_DIR` | `upload_dir` |

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default coroutine stack size (64KB).
pub const DEFAULT_STACK_SIZE: usize = 0x10000;

/// Scoped cache tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// LRU bound; 0 means unbounded
    pub max_entries: usize,
    /// Sweep expired entries every N requests; 0 leaves purging to reads
    pub sweep_interval: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_entries: 0,
            sweep_interval: 64,
        }
    }
}

/// Settings for one worker.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Label used in log lines
    pub name: String,
    /// Stop accepting units after this many requests (0 = never)
    pub max_requests: u64,
    /// Consecutive handler failures treated as worker-fatal (0 = disabled)
    pub max_consecutive_failures: u32,
    /// Coroutine stack size used by the runner
    pub stack_size: usize,
    pub cache: CacheConfig,
    /// Seed environment persistence from the process environment
    pub inherit_process_env: bool,
    /// Variables injected into environment persistence at start
    pub env: BTreeMap<String, String>,
    /// Response headers staged at the start of every request
    pub default_headers: BTreeMap<String, String>,
    /// Directory for upload temp files (system temp dir when unset)
    pub upload_dir: Option<PathBuf>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "worker".to_string(),
            max_requests: 0,
            max_consecutive_failures: 0,
            stack_size: DEFAULT_STACK_SIZE,
            cache: CacheConfig::default(),
            inherit_process_env: true,
            env: BTreeMap::new(),
            default_headers: BTreeMap::new(),
            upload_dir: None,
        }
    }
}

fn parse_stack_size(s: &str) -> Option<usize> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        usize::from_str_radix(hex, 16).ok()
    } else {
        s.parse().ok()
    }
}

fn parse_bool(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn env_parsed<T>(var: &str, parse: impl FnOnce(&str) -> Option<T>) -> Option<T> {
    let raw = std::env::var(var).ok()?;
    let parsed = parse(&raw);
    if parsed.is_none() {
        warn!(var = %var, value = %raw, "Ignoring unparseable environment override");
    }
    parsed
}

impl WorkerConfig {
    /// Defaults with `BRRTW_*` overrides applied.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Load a YAML file, then apply `BRRTW_*` overrides.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let mut config = Self::from_yaml_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        debug!(path = %path.display(), name = %config.name, "Loaded worker config");
        Ok(config)
    }

    /// Parse YAML without consulting the environment.
    pub fn from_yaml_str(raw: &str) -> Result<Self, ConfigError> {
        // serde_yaml reads an empty document as null
        if raw.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Overwrite fields from `BRRTW_*` variables that are set and parse.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(name) = std::env::var("BRRTW_WORKER_NAME") {
            self.name = name;
        }
        if let Some(v) = env_parsed("BRRTW_MAX_REQUESTS", |s| s.trim().parse().ok()) {
            self.max_requests = v;
        }
        if let Some(v) = env_parsed("BRRTW_MAX_CONSECUTIVE_FAILURES", |s| s.trim().parse().ok()) {
            self.max_consecutive_failures = v;
        }
        if let Some(v) = env_parsed("BRRTW_STACK_SIZE", parse_stack_size) {
            self.stack_size = v;
        }
        if let Some(v) = env_parsed("BRRTW_CACHE_MAX_ENTRIES", |s| s.trim().parse().ok()) {
            self.cache.max_entries = v;
        }
        if let Some(v) = env_parsed("BRRTW_CACHE_SWEEP_INTERVAL", |s| s.trim().parse().ok()) {
            self.cache.sweep_interval = v;
        }
        if let Some(v) = env_parsed("BRRTW_INHERIT_ENV", parse_bool) {
            self.inherit_process_env = v;
        }
        if let Ok(dir) = std::env::var("BRRTW_UPLOAD_DIR") {
            self.upload_dir = (!dir.is_empty()).then(|| PathBuf::from(dir));
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.stack_size == 0 {
            return Err(ConfigError::Invalid {
                field: "stack_size",
                reason: "must be greater than zero".to_string(),
            });
        }
        for name in self.env.keys() {
            if name.is_empty() || name.contains('=') {
                return Err(ConfigError::Invalid {
                    field: "env",
                    reason: format!("invalid variable name {name:?}"),
                });
            }
        }
        for name in self.default_headers.keys() {
            if http::HeaderName::from_bytes(name.as_bytes()).is_err() {
                return Err(ConfigError::Invalid {
                    field: "default_headers",
                    reason: format!("invalid header name {name:?}"),
                });
            }
        }
        Ok(())
    }

    /// Render as YAML (used by `brrtworker config`).
    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = WorkerConfig::default();
        assert_eq!(config.name, "worker");
        assert_eq!(config.max_requests, 0);
        assert_eq!(config.stack_size, 0x10000);
        assert_eq!(config.cache.sweep_interval, 64);
        assert!(config.inherit_process_env);
    }

    #[test]
    fn test_parse_stack_size() {
        assert_eq!(parse_stack_size("0x8000"), Some(32768));
        assert_eq!(parse_stack_size("65536"), Some(65536));
        assert_eq!(parse_stack_size("lots"), None);
    }

    #[test]
    fn test_parse_bool() {
        assert_eq!(parse_bool("TRUE"), Some(true));
        assert_eq!(parse_bool("0"), Some(false));
        assert_eq!(parse_bool("maybe"), None);
    }

    #[test]
    fn test_partial_yaml_keeps_defaults() {
        let config = WorkerConfig::from_yaml_str(
            "name: api\nmax_requests: 500\ncache:\n  max_entries: 128\nenv:\n  APP_ENV: prod\n",
        )
        .unwrap();
        assert_eq!(config.name, "api");
        assert_eq!(config.max_requests, 500);
        assert_eq!(config.cache.max_entries, 128);
        assert_eq!(config.cache.sweep_interval, 64);
        assert_eq!(config.env.get("APP_ENV").map(String::as_str), Some("prod"));
    }

    #[test]
    fn test_empty_yaml_is_default() {
        assert_eq!(WorkerConfig::from_yaml_str("").unwrap(), WorkerConfig::default());
    }

    #[test]
    fn test_invalid_values_rejected() {
        assert!(matches!(
            WorkerConfig::from_yaml_str("stack_size: 0\n"),
            Err(ConfigError::Invalid { field: "stack_size", .. })
        ));
        assert!(matches!(
            WorkerConfig::from_yaml_str("default_headers:\n  \"bad header\": x\n"),
            Err(ConfigError::Invalid { field: "default_headers", .. })
        ));
        assert!(matches!(
            WorkerConfig::from_yaml_str("max_requests: [1]\n"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn test_yaml_round_trip_through_to_yaml() {
        let mut config = WorkerConfig::default();
        config.default_headers.insert("X-Powered-By".into(), "brrtworker".into());
        let yaml = config.to_yaml().unwrap();
        assert_eq!(WorkerConfig::from_yaml_str(&yaml).unwrap(), config);
    }
}
