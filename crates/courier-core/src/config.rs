//! Configuration model and loader.
//!
//! Merge order (later overrides earlier):
//! 1. Compiled defaults
//! 2. A TOML file, when given
//! 3. `COURIER_*` environment variables (`COURIER_RECOVERY_INTERVAL_SECS=30`)

use std::path::Path;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::app::sync::SyncStrategy;
use crate::domain::RetryPolicyTable;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config load failed: {0}")]
    Load(#[from] Box<figment::Error>),

    #[error("invalid config: {0}")]
    Invalid(String),
}

impl From<figment::Error> for ConfigError {
    fn from(e: figment::Error) -> Self {
        Self::Load(Box::new(e))
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CourierConfig {
    pub broker: BrokerConfig,
    pub retry: RetryConfig,
    pub recovery: RecoveryConfig,
    pub sync: SyncConfig,
    pub dead_letter: DeadLetterConfig,
    pub logging: LoggingConfig,
}

/// Broker topology.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub exchange: String,
    pub routing_key: String,

    /// Delayed retries go here with a per-message TTL and dead-letter back into the work queue.
    pub retry_exchange: String,
    pub retry_routing_key: String,

    /// Target of `FORWARD_TO_QUEUE` unless a strategy says otherwise.
    pub archive_queue: String,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            exchange: "courier.events".to_string(),
            routing_key: "courier.default".to_string(),
            retry_exchange: "courier.retry".to_string(),
            retry_routing_key: "courier.retry".to_string(),
            archive_queue: "dead-letter-archive-queue".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Keyed by topic; "default" is the fallback.
    pub policies: RetryPolicyTable,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    pub enabled: bool,
    pub interval_secs: u64,

    /// A task left in PROCESSING longer than this is treated as abandoned.
    pub processing_timeout_secs: u64,
    pub unpublished_batch: usize,
    pub timeout_batch: usize,
    pub retryable_batch: usize,

    pub consistency_sample: usize,
    pub consistency_timeout_secs: u64,

    /// COMPLETED rows older than this are deleted.
    pub retention_days: u32,
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 60,
            processing_timeout_secs: 60,
            unpublished_batch: 100,
            timeout_batch: 50,
            retryable_batch: 50,
            consistency_sample: 1000,
            consistency_timeout_secs: 30,
            retention_days: 7,
        }
    }
}

impl RecoveryConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_secs)
    }

    pub fn consistency_timeout(&self) -> Duration {
        Duration::from_secs(self.consistency_timeout_secs)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub strategy: SyncStrategy,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeadLetterConfig {
    /// REQUEUE is refused at or above this retry count.
    pub requeue_ceiling: u32,

    /// Records kept by the in-memory dead-letter store before the oldest is dropped.
    pub archive_capacity: usize,
}

impl Default for DeadLetterConfig {
    fn default() -> Self {
        Self {
            requeue_ceiling: 10,
            archive_capacity: 10_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    pub level: String,
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

impl CourierConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let r = &self.recovery;
        if r.enabled && r.interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "recovery.interval_secs must be positive".to_string(),
            ));
        }
        if r.unpublished_batch == 0 || r.timeout_batch == 0 || r.retryable_batch == 0 {
            return Err(ConfigError::Invalid(
                "recovery batch sizes must be positive".to_string(),
            ));
        }
        if self.dead_letter.archive_capacity == 0 {
            return Err(ConfigError::Invalid(
                "dead_letter.archive_capacity must be positive".to_string(),
            ));
        }
        if self.broker.retry_exchange.is_empty() {
            return Err(ConfigError::Invalid(
                "broker.retry_exchange must not be empty".to_string(),
            ));
        }
        Ok(())
    }
}

/// Defaults + `COURIER_*` environment overrides.
pub fn load_config() -> Result<CourierConfig, ConfigError> {
    extract(base_figment().merge(env_provider()))
}

/// Defaults + the given file + environment overrides. A missing file is skipped.
pub fn load_config_from_path(path: &Path) -> Result<CourierConfig, ConfigError> {
    extract(base_figment().merge(Toml::file(path)).merge(env_provider()))
}

/// Defaults + inline TOML only. Used by tests.
pub fn load_config_from_str(toml_content: &str) -> Result<CourierConfig, ConfigError> {
    extract(base_figment().merge(Toml::string(toml_content)))
}

fn base_figment() -> Figment {
    Figment::new().merge(Serialized::defaults(CourierConfig::default()))
}

fn extract(figment: Figment) -> Result<CourierConfig, ConfigError> {
    let config: CourierConfig = figment.extract()?;
    config.validate()?;
    Ok(config)
}

const SECTIONS: [&str; 6] = ["dead_letter", "recovery", "logging", "broker", "retry", "sync"];

/// Maps `COURIER_<SECTION>_<KEY>` to `<section>.<key>`.
///
/// Only the first underscore after the section name is a separator, so
/// `COURIER_BROKER_RETRY_EXCHANGE` becomes `broker.retry_exchange`.
fn env_provider() -> Env {
    Env::prefixed("COURIER_").map(|key| {
        let key = key.as_str().to_ascii_lowercase();
        SECTIONS
            .iter()
            .find_map(|section| {
                key.strip_prefix(section)
                    .and_then(|rest| rest.strip_prefix('_'))
                    .map(|rest| format!("{section}.{rest}"))
            })
            .unwrap_or(key)
            .into()
    })
}
