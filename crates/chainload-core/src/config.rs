// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Runtime configuration and its storage port.

use std::time::Duration;

use chainload_sched::{SchedulerConfig, SchedulerError};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;

/// Key under which [`RuntimeConfig`] is stored.
pub const RUNTIME_CONFIG_KEY: &str = "runtime";

/// Default liveness re-check interval of the synchronous bridge.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 20;

/// Where runtime documents live. Implemented by `chainload-config-fs` and by
/// the in-memory store in `chainload-dry-tests`.
pub trait ConfigStore {
    /// Raw JSON stored under `key`; [`ConfigError::NotFound`] when absent.
    fn load_raw(&self, key: &str) -> Result<Vec<u8>, ConfigError>;
    /// Replace the document stored under `key`.
    fn save_raw(&self, key: &str, data: &[u8]) -> Result<(), ConfigError>;
}

/// Failure to load, parse, validate or store a runtime document.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Nothing stored under the key.
    #[error("not found")]
    NotFound,
    /// The store could not be read or written.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// The stored document is not valid JSON for the requested type.
    #[error("serde error: {0}")]
    Serde(#[from] serde_json::Error),
    /// The value parsed but cannot be used.
    #[error("invalid config: {0}")]
    Invalid(String),
    /// Store-specific failure.
    #[error("other: {0}")]
    Other(String),
}

impl From<SchedulerError> for ConfigError {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::InvalidConfig(msg) => Self::Invalid(msg),
            other => Self::Other(other.to_string()),
        }
    }
}

/// JSON codec over a [`ConfigStore`], used to load the [`RuntimeConfig`]
/// that scheduler pools and bridges are built from.
pub struct ConfigService<S> {
    store: S,
}

impl<S> ConfigService<S> {
    /// Service over `store`.
    pub const fn new(store: S) -> Self {
        Self { store }
    }

    /// Give back the store.
    pub fn into_inner(self) -> S {
        self.store
    }
}

impl<S> ConfigService<S>
where
    S: ConfigStore,
{
    /// Decode the document under `key`; `Ok(None)` when absent or empty.
    pub fn load<T>(&self, key: &str) -> Result<Option<T>, ConfigError>
    where
        T: DeserializeOwned,
    {
        match self.store.load_raw(key) {
            Ok(bytes) if bytes.is_empty() => Ok(None),
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(ConfigError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Encode `value` as pretty JSON under `key`.
    pub fn save<T>(&self, key: &str, value: &T) -> Result<(), ConfigError>
    where
        T: Serialize,
    {
        let data = serde_json::to_vec_pretty(value)?;
        self.store.save_raw(key, &data)
    }

    /// Load the stored [`RuntimeConfig`], falling back to defaults when
    /// absent. A stored but invalid config is an error.
    pub fn load_runtime(&self) -> Result<RuntimeConfig, ConfigError> {
        let config: RuntimeConfig = self.load(RUNTIME_CONFIG_KEY)?.unwrap_or_default();
        config.validate()?;
        Ok(config)
    }

    /// Validate and persist `config` under [`RUNTIME_CONFIG_KEY`].
    pub fn save_runtime(&self, config: &RuntimeConfig) -> Result<(), ConfigError> {
        config.validate()?;
        self.save(RUNTIME_CONFIG_KEY, config)
    }
}

/// Synchronous bridge tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    /// How often (milliseconds) a waiting bridge re-checks that the loader
    /// is still started.
    pub poll_interval_ms: u64,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
        }
    }
}

impl BridgeConfig {
    /// Poll interval as a [`Duration`].
    pub const fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Everything a chain runtime is built from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Fallback scheduler pool.
    pub scheduler: SchedulerConfig,
    /// Synchronous bridge.
    pub bridge: BridgeConfig,
}

impl RuntimeConfig {
    /// Reject configurations that could never make progress.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scheduler.validate()?;
        if self.bridge.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "bridge.poll_interval_ms must be at least 1".into(),
            ));
        }
        Ok(())
    }
}
