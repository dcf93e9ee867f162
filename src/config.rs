// Coordinator configuration.
// Defaults, an optional JSON config file, and environment overrides.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cache::paths;
use crate::error::{FetchError, Result};
use crate::invalidation::InvalidationRule;

pub const ENV_BASE_URL: &str = "SCOPED_FETCH_BASE_URL";
pub const ENV_TIMEOUT_SECS: &str = "SCOPED_FETCH_TIMEOUT_SECS";
pub const ENV_CACHE_DIR: &str = "SCOPED_FETCH_CACHE_DIR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// Origin all endpoints are resolved against.
    pub base_url: Option<String>,
    /// TTL applied when a read does not name one.
    pub default_ttl_secs: u64,
    /// How far past its TTL an entry may be served while rate limited or cooling down.
    pub stale_window_secs: u64,
    pub cooldown_ms: u64,
    /// Pause applied on a 429 without a usable retry hint.
    pub default_retry_after_secs: u64,
    pub max_retry_after_secs: u64,
    /// Delay before a stale-while-revalidate refresh starts.
    pub revalidate_delay_ms: u64,
    pub request_timeout_secs: u64,
    pub user_agent: String,
    /// Entry limit for the in-memory store; zero is unbounded.
    pub memory_cache_capacity: usize,
    /// Use a disk store rooted here instead of memory.
    pub cache_dir: Option<PathBuf>,
    pub invalidation_rules: Vec<InvalidationRule>,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            default_ttl_secs: 5 * 60,
            stale_window_secs: 24 * 60 * 60,
            cooldown_ms: 1000,
            default_retry_after_secs: 30,
            max_retry_after_secs: 10 * 60,
            revalidate_delay_ms: 100,
            request_timeout_secs: 30,
            user_agent: concat!("scoped-fetch/", env!("CARGO_PKG_VERSION")).to_string(),
            memory_cache_capacity: 1000,
            cache_dir: None,
            invalidation_rules: Vec::new(),
        }
    }
}

impl CoordinatorConfig {
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_rules(mut self, rules: Vec<InvalidationRule>) -> Self {
        self.invalidation_rules = rules;
        self
    }

    /// Parse a JSON document; missing fields take their defaults.
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FetchError::Config(e.to_string()))
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| FetchError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&contents)
    }

    /// Defaults, then the platform config file if present, then the environment.
    pub fn load() -> Result<Self> {
        let mut config = match paths::config_path() {
            Some(path) if path.exists() => Self::from_file(&path)?,
            _ => Self::default(),
        };
        config.apply_env(|name| std::env::var(name).ok())?;
        Ok(config)
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(base_url) = var(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.base_url = Some(base_url);
        }
        if let Some(timeout) = var(ENV_TIMEOUT_SECS) {
            self.request_timeout_secs = timeout
                .trim()
                .parse()
                .map_err(|_| FetchError::Config(format!("{ENV_TIMEOUT_SECS}={timeout}")))?;
        }
        if let Some(dir) = var(ENV_CACHE_DIR).filter(|v| !v.trim().is_empty()) {
            self.cache_dir = Some(PathBuf::from(dir));
        }
        Ok(())
    }

    /// The configured base URL, if it is non-empty.
    pub fn base_url(&self) -> Option<&str> {
        self.base_url
            .as_deref()
            .map(str::trim)
            .filter(|url| !url.is_empty())
    }

    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn stale_window(&self) -> Duration {
        Duration::from_secs(self.stale_window_secs)
    }

    pub fn cooldown(&self) -> Duration {
        Duration::from_millis(self.cooldown_ms)
    }

    pub fn default_retry_after(&self) -> Duration {
        Duration::from_secs(self.default_retry_after_secs)
    }

    pub fn max_retry_after(&self) -> Duration {
        Duration::from_secs(self.max_retry_after_secs)
    }

    pub fn revalidate_delay(&self) -> Duration {
        Duration::from_millis(self.revalidate_delay_ms)
    }
}
