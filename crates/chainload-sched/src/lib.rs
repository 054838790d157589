// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Owner-partitioned fallback executor.
//!
//! [`FallbackScheduler`] runs closures on a bounded pool of named worker
//! threads. Each closure is submitted under an [`OwnerId`]:
//!
//! - closures of one owner run strictly one at a time, in submission order;
//! - closures of different owners may run in parallel;
//! - submission never blocks and never runs work on the caller's thread.
//!
//! The chain loaders in `chainload-core` use one owner per loader so that
//! every delivery of a loader is serialized without a lock per loader.
#![forbid(unsafe_code)]

mod config;
mod error;
mod owner;
mod partition;
mod scheduler;

pub use config::{SchedulerConfig, DEFAULT_KEEP_ALIVE_MS, DEFAULT_THREAD_NAME_PREFIX};
pub use error::SchedulerError;
pub use owner::OwnerId;
pub use scheduler::{FallbackScheduler, SchedulerStats};
