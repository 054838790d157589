// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chain loaders over an owner-partitioned fallback scheduler.
//!
//! - [`LoadResult`]: tri-state delivery (complete, partial, failure).
//! - [`ChainLoader`]: tries a [`ChainSource`] locally, falls back to a
//!   delegate [`Loader`] and reprocesses its deliveries on the
//!   [`FallbackScheduler`], one at a time per loader.
//! - [`SyncBridge`]: blocks for the first delivery of any [`Loader`].
//! - [`LoaderCore`] and [`Affinity`]: the lifecycle and thread-affinity
//!   pieces a host framework would otherwise provide.
#![forbid(unsafe_code)]

pub mod affinity;
pub mod bridge;
pub mod chain;
pub mod config;
mod error;
pub mod lifecycle;
mod result;

pub use affinity::{run_blocking, Affinity, AffinityJob, AffinityThread, InlineAffinity};
pub use bridge::SyncBridge;
pub use chain::{Attempt, ChainLoader, ChainSource, Delegate, Phase};
pub use chainload_sched::{FallbackScheduler, OwnerId, SchedulerConfig, SchedulerError};
pub use config::{BridgeConfig, ConfigError, ConfigService, ConfigStore, RuntimeConfig};
pub use error::{ChainError, SharedSource};
pub use lifecycle::{ListenerId, LoadListener, Loader, LoaderCore, LoaderId};
pub use result::{DeliveryKind, LoadResult};
