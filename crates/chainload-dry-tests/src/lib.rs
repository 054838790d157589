// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Shared test doubles and fixtures for chainload crates.
//!
//! # Modules
//!
//! - [`config`] - In-memory config store fake for testing without filesystem
//! - [`sources`] - Scripted [`ChainSource`](chainload_core::ChainSource) fakes with probes
//! - [`loaders`] - Host loaders built on [`LoaderCore`](chainload_core::LoaderCore)
//! - [`listener`] - Delivery recorder with blocking waits
//! - [`affinity`] - Counting affinity thread
#![forbid(unsafe_code)]

pub mod affinity;
pub mod config;
pub mod listener;
pub mod loaders;
pub mod sources;

use chainload_sched::{FallbackScheduler, SchedulerConfig, SchedulerError};

pub use affinity::TestAffinity;
pub use config::InMemoryConfigStore;
pub use listener::RecordingListener;
pub use loaders::{DirectLoader, ImmediateLoader, ScriptedLoader, ThreadedLoader};
pub use sources::{EventLog, Gate, ScriptedSource, SourceProbe};

/// A fixed-size scheduler with recognisable thread names.
pub fn test_scheduler(workers: usize) -> Result<FallbackScheduler, SchedulerError> {
    FallbackScheduler::new(SchedulerConfig::fixed(workers).with_thread_name_prefix("dry-delivery"))
}
