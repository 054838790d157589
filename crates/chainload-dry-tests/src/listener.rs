// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Delivery recorder.

use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chainload_core::{LoadListener, LoaderId};

/// Records every delivery and lets tests block until enough arrived.
pub struct RecordingListener<D> {
    seen: Mutex<Vec<(LoaderId, D)>>,
    arrived: Condvar,
}

impl<D: Clone> RecordingListener<D> {
    /// A shared, empty recorder ready to register.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            seen: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Vec<(LoaderId, D)>> {
        self.seen.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliveries so far.
    pub fn values(&self) -> Vec<D> {
        self.lock().iter().map(|(_, d)| d.clone()).collect()
    }

    /// Loader ids of deliveries so far.
    pub fn senders(&self) -> Vec<LoaderId> {
        self.lock().iter().map(|(id, _)| *id).collect()
    }

    /// Number of deliveries so far.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Whether nothing was delivered yet.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Wait until at least `n` deliveries arrived (or `timeout`), then
    /// return them all.
    pub fn wait_for(&self, n: usize, timeout: Duration) -> Vec<D> {
        let seen = self.lock();
        let (seen, _) = self
            .arrived
            .wait_timeout_while(seen, timeout, |s| s.len() < n)
            .unwrap_or_else(PoisonError::into_inner);
        seen.iter().map(|(_, d)| d.clone()).collect()
    }
}

impl<D: Clone + Send> LoadListener<D> for RecordingListener<D> {
    fn on_load_complete(&self, loader: LoaderId, data: &D) {
        self.lock().push((loader, data.clone()));
        self.arrived.notify_all();
    }
}
