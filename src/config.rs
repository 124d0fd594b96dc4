//! Configuration and settings management
//!
//! Loads settings from configuration files and environment variables and
//! turns them into the typed pipeline configuration.

use crate::pipeline::{
    governor, upload, BucketConfig, GovernorConfig, PipelineConfig, DEFAULT_DOWNLOAD_POOL_SIZE,
    DEFAULT_DOWNLOAD_TIMEOUT,
};
use crate::state::{self, StoreConfig};
use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

/// Default number of songs kept in the in-memory song cache
pub const DEFAULT_SONG_CACHE_CAPACITY: u64 = 10_000;

/// Application settings loaded from files and environment variables
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Settings {
    /// Telegram Bot API token
    pub telegram_token: String,

    /// Comma-separated list of allowed user IDs; empty allows everyone
    #[serde(rename = "allowed_users")]
    pub allowed_users_str: Option<String>,

    /// Directory for temporary downloads
    pub download_dir: Option<PathBuf>,

    /// Per-chat outbound rate (messages per second)
    #[serde(default = "default_chat_rate")]
    pub chat_rate_per_sec: f64,
    /// Per-chat burst
    #[serde(default = "default_chat_burst")]
    pub chat_burst: u32,
    /// Global outbound rate (messages per second); 0 disables the global bucket
    #[serde(default = "default_global_rate")]
    pub global_rate_per_sec: f64,
    /// Global burst
    #[serde(default = "default_global_burst")]
    pub global_burst: u32,
    /// Seconds of inactivity before a chat's bucket is forgotten
    #[serde(default = "default_throttle_idle_secs")]
    pub throttle_idle_secs: u64,
    /// Seconds between idle-bucket sweeps
    #[serde(default = "default_throttle_sweep_secs")]
    pub throttle_sweep_secs: u64,
    /// Attempts per rate-limited chat call
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Concurrent downloads
    #[serde(default = "default_download_pool_size")]
    pub download_pool_size: usize,
    /// Download timeout in seconds
    #[serde(default = "default_download_timeout_secs")]
    pub download_timeout_secs: u64,
    /// Tasks that may wait for upload
    #[serde(default = "default_upload_queue_capacity")]
    pub upload_queue_capacity: usize,
    /// Milliseconds between queued-status refreshes
    #[serde(default = "default_status_reconcile_ms")]
    pub status_reconcile_ms: u64,

    /// Pagination state window in seconds
    #[serde(default = "default_pagination_ttl_secs")]
    pub pagination_ttl_secs: u64,
    /// Cross-reference token window in seconds
    #[serde(default = "default_cross_ref_ttl_secs")]
    pub cross_ref_ttl_secs: u64,
    /// Maximum live cross-reference tokens
    #[serde(default = "default_cross_ref_max_entries")]
    pub cross_ref_max_entries: usize,
    /// Page marker window in seconds
    #[serde(default = "default_page_marker_ttl_secs")]
    pub page_marker_ttl_secs: u64,

    /// Songs kept in the in-memory song cache
    #[serde(default = "default_song_cache_capacity")]
    pub song_cache_capacity: u64,
}

const fn default_chat_rate() -> f64 {
    governor::DEFAULT_CHAT_RATE
}

const fn default_chat_burst() -> u32 {
    governor::DEFAULT_CHAT_BURST
}

const fn default_global_rate() -> f64 {
    governor::DEFAULT_GLOBAL_RATE
}

const fn default_global_burst() -> u32 {
    governor::DEFAULT_GLOBAL_BURST
}

const fn default_throttle_idle_secs() -> u64 {
    governor::DEFAULT_IDLE_TTL.as_secs()
}

const fn default_throttle_sweep_secs() -> u64 {
    governor::DEFAULT_SWEEP_INTERVAL.as_secs()
}

const fn default_max_attempts() -> u32 {
    governor::DEFAULT_MAX_ATTEMPTS
}

const fn default_download_pool_size() -> usize {
    DEFAULT_DOWNLOAD_POOL_SIZE
}

const fn default_download_timeout_secs() -> u64 {
    DEFAULT_DOWNLOAD_TIMEOUT.as_secs()
}

const fn default_upload_queue_capacity() -> usize {
    upload::DEFAULT_QUEUE_CAPACITY
}

#[allow(clippy::cast_possible_truncation)]
const fn default_status_reconcile_ms() -> u64 {
    upload::DEFAULT_RECONCILE_INTERVAL.as_millis() as u64
}

const fn default_pagination_ttl_secs() -> u64 {
    state::PAGINATION_TTL.as_secs()
}

const fn default_cross_ref_ttl_secs() -> u64 {
    state::CROSS_REF_TTL.as_secs()
}

const fn default_cross_ref_max_entries() -> usize {
    state::CROSS_REF_MAX_ENTRIES
}

const fn default_page_marker_ttl_secs() -> u64 {
    state::PAGE_MARKER_TTL.as_secs()
}

const fn default_song_cache_capacity() -> u64 {
    DEFAULT_SONG_CACHE_CAPACITY
}

impl Settings {
    /// Create new settings by loading from environment and files
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use oxide_music::config::Settings;
    ///
    /// let settings = Settings::new().expect("Failed to load configuration");
    /// ```
    ///
    /// # Errors
    ///
    /// Returns a `ConfigError` if loading fails.
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = std::env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let s = Config::builder()
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{run_mode}")).required(false))
            // not checked into git
            .add_source(File::with_name("config/local").required(false))
            // e.g. `APP__DOWNLOAD_POOL_SIZE=8`
            .add_source(Environment::with_prefix("APP").separator("__"))
            // plain UPPER_SNAKE_CASE variables; empty ones count as unset
            .add_source(Environment::default().ignore_empty(true))
            .build()?;

        s.try_deserialize()
    }

    /// Returns a set of Telegram IDs that are allowed to use the bot
    #[must_use]
    pub fn allowed_users(&self) -> HashSet<i64> {
        self.allowed_users_str
            .as_ref()
            .map(|s| {
                s.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
                    .filter(|token| !token.is_empty())
                    .filter_map(|id| id.parse::<i64>().ok())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Typed pipeline configuration derived from these settings
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig::from_settings(self)
    }
}

impl PipelineConfig {
    /// Build the pipeline configuration from loaded settings
    #[must_use]
    pub fn from_settings(settings: &Settings) -> Self {
        let global = (settings.global_rate_per_sec > 0.0).then_some(BucketConfig {
            rate_per_sec: settings.global_rate_per_sec,
            burst: settings.global_burst,
        });

        Self {
            governor: GovernorConfig {
                per_chat: BucketConfig {
                    rate_per_sec: settings.chat_rate_per_sec,
                    burst: settings.chat_burst,
                },
                global,
                idle_ttl: Duration::from_secs(settings.throttle_idle_secs),
                sweep_interval: Duration::from_secs(settings.throttle_sweep_secs),
                max_attempts: settings.max_attempts,
            },
            download_pool_size: settings.download_pool_size,
            upload_queue_capacity: settings.upload_queue_capacity,
            status_reconcile_interval: Duration::from_millis(settings.status_reconcile_ms),
            download_dir: settings
                .download_dir
                .clone()
                .unwrap_or_else(|| Self::default().download_dir),
            download_timeout: Duration::from_secs(settings.download_timeout_secs),
            stores: StoreConfig {
                pagination_ttl: Duration::from_secs(settings.pagination_ttl_secs),
                cross_ref_ttl: Duration::from_secs(settings.cross_ref_ttl_secs),
                cross_ref_max_entries: settings.cross_ref_max_entries,
                page_marker_ttl: Duration::from_secs(settings.page_marker_ttl_secs),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;

    fn minimal() -> Result<Settings, config::ConfigError> {
        Config::builder()
            .set_override("telegram_token", "dummy")?
            .build()?
            .try_deserialize()
    }

    #[test]
    fn defaults_match_pipeline_defaults() -> Result<(), Box<dyn std::error::Error>> {
        let settings = minimal()?;
        let mut expected = PipelineConfig::default();
        expected.download_dir = settings.pipeline_config().download_dir;

        assert_eq!(settings.pipeline_config(), expected);
        assert!(settings.allowed_users().is_empty());
        Ok(())
    }

    #[test]
    fn zero_global_rate_disables_global_bucket() -> Result<(), Box<dyn std::error::Error>> {
        let mut settings = minimal()?;
        settings.global_rate_per_sec = 0.0;
        assert_eq!(settings.pipeline_config().governor.global, None);
        Ok(())
    }

    #[test]
    fn allowed_users_accept_mixed_separators() -> Result<(), Box<dyn std::error::Error>> {
        let mut settings = minimal()?;
        settings.allowed_users_str = Some("1, 2;3 x  4".to_string());
        assert_eq!(settings.allowed_users(), HashSet::from([1, 2, 3, 4]));
        Ok(())
    }

    #[test]
    fn env_overrides_are_loaded() -> Result<(), Box<dyn std::error::Error>> {
        env::set_var("TELEGRAM_TOKEN", "env_token");
        env::set_var("APP__DOWNLOAD_POOL_SIZE", "9");
        env::set_var("UPLOAD_QUEUE_CAPACITY", "");

        let settings = Settings::new()?;
        assert_eq!(settings.telegram_token, "env_token");
        assert_eq!(settings.download_pool_size, 9);
        assert_eq!(settings.upload_queue_capacity, upload::DEFAULT_QUEUE_CAPACITY);

        env::remove_var("TELEGRAM_TOKEN");
        env::remove_var("APP__DOWNLOAD_POOL_SIZE");
        env::remove_var("UPLOAD_QUEUE_CAPACITY");
        Ok(())
    }
}
