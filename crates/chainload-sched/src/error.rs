// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scheduler error type.

use std::time::Duration;

use thiserror::Error;

/// Errors raised while building or managing a [`crate::FallbackScheduler`].
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// The pool configuration cannot produce a working scheduler.
    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
    /// The OS refused to start a worker thread.
    #[error("failed to spawn worker thread: {0}")]
    Spawn(#[from] std::io::Error),
    /// The scheduler no longer accepts work.
    #[error("scheduler is shut down")]
    ShutDown,
    /// Queued or running work did not finish within the drain timeout.
    #[error("scheduler did not become idle within {0:?}")]
    DrainTimeout(Duration),
    /// A blocking management call was made from inside a work item.
    #[error("cannot drain the scheduler from one of its own workers")]
    CalledFromWorker,
}
