// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Worker pool sizing for the fallback scheduler.

use std::num::NonZeroUsize;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::SchedulerError;

/// Default idle time before a worker above `min_workers` retires.
pub const DEFAULT_KEEP_ALIVE_MS: u64 = 1_000;

/// Default worker thread name prefix. Threads are named `{prefix}-{n}`.
pub const DEFAULT_THREAD_NAME_PREFIX: &str = "fallback-delivery";

/// Sizing and naming for a [`crate::FallbackScheduler`] worker pool.
///
/// The defaults follow available parallelism: `cores + 1` pre-started
/// workers, growing to `2 * cores + 1` while every live worker is busy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Workers started eagerly and never retired.
    pub min_workers: usize,
    /// Hard ceiling on live workers.
    pub max_workers: usize,
    /// Idle time (milliseconds) before a worker above the minimum retires.
    pub keep_alive_ms: u64,
    /// Prefix for worker thread names.
    pub thread_name_prefix: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        let cores = std::thread::available_parallelism().map_or(1, NonZeroUsize::get);
        Self {
            min_workers: cores + 1,
            max_workers: cores * 2 + 1,
            keep_alive_ms: DEFAULT_KEEP_ALIVE_MS,
            thread_name_prefix: DEFAULT_THREAD_NAME_PREFIX.to_string(),
        }
    }
}

impl SchedulerConfig {
    /// A pool of exactly `workers` threads (no growth, no retirement).
    pub fn fixed(workers: usize) -> Self {
        Self {
            min_workers: workers,
            max_workers: workers,
            ..Self::default()
        }
    }

    /// Override the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Idle keep-alive as a [`Duration`].
    pub fn keep_alive(&self) -> Duration {
        Duration::from_millis(self.keep_alive_ms)
    }

    /// Reject pools that could never run work or could never grow.
    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.min_workers == 0 {
            return Err(SchedulerError::InvalidConfig(
                "min_workers must be at least 1".into(),
            ));
        }
        if self.max_workers < self.min_workers {
            return Err(SchedulerError::InvalidConfig(format!(
                "max_workers ({}) must be >= min_workers ({})",
                self.max_workers, self.min_workers
            )));
        }
        if self.thread_name_prefix.is_empty() {
            return Err(SchedulerError::InvalidConfig(
                "thread_name_prefix must not be empty".into(),
            ));
        }
        Ok(())
    }
}
