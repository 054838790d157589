// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Thread-affinity contexts.
//!
//! Some lifecycle calls (reset, in particular) must happen on one designated
//! context, the way UI frameworks pin loader callbacks to their main
//! thread. [`Affinity`] abstracts that context and [`run_blocking`] hands a
//! closure to it and waits for the answer.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};

use tracing::{debug, error, warn};

use crate::ChainError;

/// A job posted to an affinity context.
pub type AffinityJob = Box<dyn FnOnce() + Send + 'static>;

/// A context that certain lifecycle calls must run on.
pub trait Affinity: Send + Sync {
    /// Whether the calling thread already is the affinity context.
    fn is_current(&self) -> bool;
    /// Queue `job` to run on the context.
    fn post(&self, job: AffinityJob) -> Result<(), ChainError>;
}

/// Run `job` on `affinity` and wait for its return value.
///
/// Runs inline when already on the context. Fails with
/// [`ChainError::AffinityUnavailable`] if the context rejects the job or
/// drops it without running it to completion.
pub fn run_blocking<R, F>(affinity: &dyn Affinity, job: F) -> Result<R, ChainError>
where
    R: Send + 'static,
    F: FnOnce() -> R + Send + 'static,
{
    if affinity.is_current() {
        return Ok(job());
    }
    let (tx, rx) = mpsc::sync_channel(1);
    affinity.post(Box::new(move || {
        let _ = tx.send(job());
    }))?;
    rx.recv().map_err(|_| ChainError::AffinityUnavailable)
}

/// Every thread counts as the affinity context.
#[derive(Debug, Clone, Copy, Default)]
pub struct InlineAffinity;

impl Affinity for InlineAffinity {
    fn is_current(&self) -> bool {
        true
    }

    fn post(&self, job: AffinityJob) -> Result<(), ChainError> {
        job();
        Ok(())
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// A dedicated thread draining posted jobs in order, like a UI looper.
///
/// A panicking job is logged and skipped; the thread keeps running. The
/// thread exits when the context is shut down or dropped.
pub struct AffinityThread {
    name: String,
    thread_id: ThreadId,
    tx: Mutex<Option<mpsc::Sender<AffinityJob>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for AffinityThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AffinityThread")
            .field("name", &self.name)
            .field("running", &lock(&self.tx).is_some())
            .finish_non_exhaustive()
    }
}

impl AffinityThread {
    /// Start the context thread.
    pub fn spawn(name: impl Into<String>) -> std::io::Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<AffinityJob>();
        let handle = thread::Builder::new().name(name.clone()).spawn(move || {
            for job in rx {
                if catch_unwind(AssertUnwindSafe(job)).is_err() {
                    error!("affinity job panicked");
                }
            }
            debug!("affinity thread exiting");
        })?;
        Ok(Self {
            name,
            thread_id: handle.thread().id(),
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// The thread's name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop accepting jobs, let queued ones finish and join the thread
    /// (unless called from the thread itself).
    pub fn shutdown(&self) {
        drop(lock(&self.tx).take());
        let handle = lock(&self.handle).take();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl Affinity for AffinityThread {
    fn is_current(&self) -> bool {
        thread::current().id() == self.thread_id
    }

    fn post(&self, job: AffinityJob) -> Result<(), ChainError> {
        let guard = lock(&self.tx);
        let Some(tx) = guard.as_ref() else {
            warn!(affinity = %self.name, "affinity context shut down; job rejected");
            return Err(ChainError::AffinityUnavailable);
        };
        tx.send(job).map_err(|_| {
            warn!(affinity = %self.name, "affinity thread gone; job rejected");
            ChainError::AffinityUnavailable
        })
    }
}

impl Drop for AffinityThread {
    fn drop(&mut self) {
        self.shutdown();
    }
}
