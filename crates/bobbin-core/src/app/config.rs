//! BobbinConfig - 設定
//!
//! TOML から読み込み、省略されたフィールドはすべてデフォルト値になります。
//!
//! ```toml
//! namespace = "billing"
//!
//! [deferred]
//! max_workers = 16
//!
//! [scheduler]
//! lock_lease_ms = 10000
//! ```
//!
//! 時間はすべて `*_ms`（ミリ秒の整数）で持ちます。

use crate::deferred::DeferredOptions;
use crate::domain::RetryPolicy;
use crate::scheduler::SchedulerOptions;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BobbinConfig {
    /// Prefix of every queue, topic and store key.
    pub namespace: String,
    pub deferred: DeferredConfig,
    pub scheduler: SchedulerConfig,
    pub transport: TransportConfig,
}

impl Default for BobbinConfig {
    fn default() -> Self {
        Self {
            namespace: "bobbin".to_string(),
            deferred: DeferredConfig::default(),
            scheduler: SchedulerConfig::default(),
            transport: TransportConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeferredConfig {
    pub max_workers: usize,
    pub delay_when_requeuing_message_ms: u64,
    pub emit_status_events: bool,
    pub event_ttl_ms: u64,
}

impl Default for DeferredConfig {
    fn default() -> Self {
        Self {
            max_workers: 100,
            delay_when_requeuing_message_ms: 1_000,
            emit_status_events: false,
            event_ttl_ms: 3_600_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    pub lock_lease_ms: u64,
    pub lock_retry_delay_ms: u64,
    pub recovery_interval_ms: u64,
    pub outcome_cache_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            lock_lease_ms: 30_000,
            lock_retry_delay_ms: 100,
            recovery_interval_ms: 5_000,
            outcome_cache_size: 1024,
        }
    }
}

/// Backoff applied to store and broker calls that fail with `Unavailable`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    pub max_elapsed_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 50,
            multiplier: 2.0,
            max_delay_ms: 2_000,
            max_elapsed_ms: 60_000,
        }
    }
}

impl BobbinConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }
}

impl From<&DeferredConfig> for DeferredOptions {
    fn from(config: &DeferredConfig) -> Self {
        Self {
            max_workers: config.max_workers,
            delay_when_requeuing_message: Duration::from_millis(config.delay_when_requeuing_message_ms),
            emit_status_events: config.emit_status_events,
            event_ttl: Duration::from_millis(config.event_ttl_ms),
        }
    }
}

impl From<&SchedulerConfig> for SchedulerOptions {
    fn from(config: &SchedulerConfig) -> Self {
        Self {
            lock_lease: Duration::from_millis(config.lock_lease_ms),
            lock_retry_delay: Duration::from_millis(config.lock_retry_delay_ms),
            recovery_interval: Duration::from_millis(config.recovery_interval_ms),
            outcome_cache_size: config.outcome_cache_size,
        }
    }
}

impl From<&TransportConfig> for RetryPolicy {
    fn from(config: &TransportConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.base_delay_ms),
            multiplier: config.multiplier,
            max_delay: Duration::from_millis(config.max_delay_ms),
            max_elapsed: Duration::from_millis(config.max_elapsed_ms),
        }
    }
}
