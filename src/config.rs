//! Layered engine configuration.
//!
//! Sources, later ones winning: built-in defaults, `transferbox.toml` (or an
//! explicit path), `TRANSFERBOX_*` environment variables, then any
//! serialised CLI overrides.

use anyhow::{Context, Result};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::core::options::{
    DEFAULT_BUFFER_SIZE, DEFAULT_MAX_CONCURRENCY, MAX_CONCURRENCY, MIN_CONCURRENCY, OnConflict,
    TransferOptions,
};
use crate::core::retry::{
    DEFAULT_BACKOFF_MULTIPLIER, DEFAULT_INITIAL_DELAY, DEFAULT_MAX_ATTEMPTS, DEFAULT_MAX_DELAY,
    RetryConfig,
};

pub const DEFAULT_CONFIG_FILE: &str = "transferbox.toml";
pub const ENV_PREFIX: &str = "TRANSFERBOX_";

const MIN_BUFFER_SIZE: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub buffer_size: usize,
    pub verify_checksum: bool,
    pub on_conflict: OnConflict,
    pub continue_on_error: bool,
    pub preserve_permissions: bool,
    pub fsync: bool,
    pub max_concurrency: usize,
    pub max_retries: u32,
    pub retry_delay_ms: u64,
    pub max_retry_delay_ms: u64,
    pub backoff_multiplier: f64,
    pub progress_interval_ms: u64,
    pub stop_timeout_ms: u64,
    pub orphan_max_age_hours: u64,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        let options = TransferOptions::default();
        Self {
            buffer_size: DEFAULT_BUFFER_SIZE,
            verify_checksum: options.verify_checksum,
            on_conflict: options.on_conflict,
            continue_on_error: options.continue_on_error,
            preserve_permissions: options.preserve_permissions,
            fsync: options.fsync,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_retries: DEFAULT_MAX_ATTEMPTS,
            retry_delay_ms: DEFAULT_INITIAL_DELAY.as_millis() as u64,
            max_retry_delay_ms: DEFAULT_MAX_DELAY.as_millis() as u64,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
            progress_interval_ms: options.progress_interval.as_millis() as u64,
            stop_timeout_ms: 5_000,
            orphan_max_age_hours: 24,
            verbose: false,
            json_logs: false,
        }
    }
}

impl EngineConfig {
    /// Load from the default config file location plus environment and overrides.
    pub fn new<T: Serialize>(overrides: Option<&T>) -> Result<Self> {
        Self::load(Path::new(DEFAULT_CONFIG_FILE), overrides)
    }

    pub fn load<T: Serialize>(path: &Path, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(EngineConfig::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        figment
            .extract()
            .with_context(|| format!("Failed to load configuration from {}", path.display()))
    }

    pub fn transfer_options(&self) -> TransferOptions {
        let backoff_multiplier = if self.backoff_multiplier.is_finite() && self.backoff_multiplier >= 1.0 {
            self.backoff_multiplier
        } else {
            1.0
        };

        TransferOptions {
            buffer_size: self.buffer_size.max(MIN_BUFFER_SIZE),
            verify_checksum: self.verify_checksum,
            on_conflict: self.on_conflict,
            continue_on_error: self.continue_on_error,
            preserve_permissions: self.preserve_permissions,
            fsync: self.fsync,
            max_concurrency: self.max_concurrency.clamp(MIN_CONCURRENCY, MAX_CONCURRENCY),
            retry: RetryConfig {
                max_attempts: self.max_retries.max(1),
                initial_delay: Duration::from_millis(self.retry_delay_ms),
                max_delay: Duration::from_millis(self.max_retry_delay_ms),
                backoff_multiplier,
            },
            progress_interval: Duration::from_millis(self.progress_interval_ms),
        }
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_millis(self.stop_timeout_ms)
    }

    pub fn orphan_max_age(&self) -> Duration {
        Duration::from_secs(self.orphan_max_age_hours.saturating_mul(60 * 60))
    }
}
