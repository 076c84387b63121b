//! Configuration passed explicitly into the core's constructors

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Which backoff strategy a retry policy uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    Exponential,
    Linear,
    Fibonacci,
    #[default]
    JitteredExponential,
    Adaptive,
}

/// Retry policy settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub strategy: BackoffKind,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            strategy: BackoffKind::JitteredExponential,
            base_delay_ms: 1_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetrySettings {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Catalog API client settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    /// Requested spacing between API calls
    pub min_interval_ms: u64,
    /// Absolute minimum spacing; `min_interval_ms` can never go below it
    pub rate_limit_floor_ms: u64,
    pub cache_ttl_secs: u64,
    pub request_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub user_agent: String,
    pub retry: RetrySettings,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "https://civitai.com/api/v1".to_string(),
            api_key: None,
            min_interval_ms: 2_000,
            rate_limit_floor_ms: 2_000,
            cache_ttl_secs: 900,
            request_timeout_secs: 30,
            connect_timeout_secs: 10,
            user_agent: format!("modelfetch/{}", env!("CARGO_PKG_VERSION")),
            retry: RetrySettings::default(),
        }
    }
}

impl ApiConfig {
    pub fn min_interval(&self) -> Duration {
        Duration::from_millis(self.min_interval_ms)
    }

    pub fn rate_limit_floor(&self) -> Duration {
        Duration::from_millis(self.rate_limit_floor_ms)
    }

    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

/// Download engine settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub download_dir: PathBuf,
    pub connect_timeout_secs: u64,
    /// Maximum silence between two body chunks
    pub read_timeout_secs: u64,
    pub progress_interval_ms: u64,
    pub progress_bytes: u64,
    pub user_agent: String,
    pub retry: RetrySettings,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let download_dir = directories::UserDirs::new()
            .and_then(|d| d.download_dir().map(|p| p.join("modelfetch")))
            .unwrap_or_else(|| PathBuf::from("downloads"));

        Self {
            download_dir,
            connect_timeout_secs: 30,
            read_timeout_secs: 60,
            progress_interval_ms: 500,
            progress_bytes: 4 * 1024 * 1024,
            user_agent: format!("modelfetch/{}", env!("CARGO_PKG_VERSION")),
            retry: RetrySettings::default(),
        }
    }
}

impl EngineConfig {
    pub fn with_download_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.download_dir = dir.into();
        self
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }
}

/// Everything `FetchCore` needs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub api: ApiConfig,
    pub engine: EngineConfig,
    /// SQLite file for download history; in-memory history when unset
    pub history_db: Option<PathBuf>,
}
