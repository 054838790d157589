// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Blocking access to callback-driven loaders.
//!
//! [`SyncBridge::get`] resets a loader, runs it until its first delivery
//! and resets it again. Resets are marshalled onto the bridge's
//! [`Affinity`] context. Waiting happens on the calling thread only; the
//! bridge never executes loader logic itself unless the loader offers a
//! direct path through [`Loader::load_blocking`].

use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, trace};

use crate::affinity::{run_blocking, Affinity, InlineAffinity};
use crate::config::BridgeConfig;
use crate::lifecycle::{LoadListener, Loader, LoaderId};
use crate::ChainError;

/// Converts any [`Loader`] into a blocking call.
#[derive(Clone)]
pub struct SyncBridge {
    affinity: Arc<dyn Affinity>,
    poll_interval: Duration,
}

impl fmt::Debug for SyncBridge {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncBridge")
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl Default for SyncBridge {
    fn default() -> Self {
        Self::inline()
    }
}

impl SyncBridge {
    /// Bridge marshalling resets onto `affinity`, polling at the default
    /// interval.
    pub fn new(affinity: Arc<dyn Affinity>) -> Self {
        Self::from_config(affinity, &BridgeConfig::default())
    }

    /// Bridge whose affinity context is whichever thread calls it.
    pub fn inline() -> Self {
        Self::new(Arc::new(InlineAffinity))
    }

    /// Bridge tuned by `config`.
    pub fn from_config(affinity: Arc<dyn Affinity>, config: &BridgeConfig) -> Self {
        Self {
            affinity,
            poll_interval: config.poll_interval(),
        }
    }

    /// Override the liveness poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// The liveness poll interval.
    pub const fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    /// The context resets run on.
    pub fn affinity(&self) -> &Arc<dyn Affinity> {
        &self.affinity
    }

    /// Block until `loader` delivers, and return the first delivery.
    ///
    /// The loader is reset before starting and again afterwards, whatever
    /// the outcome. Fails with [`ChainError::Cancelled`] if the loader stops
    /// being started (reset or abandoned elsewhere) before delivering.
    pub fn get<D, L>(&self, loader: &L) -> Result<D, ChainError>
    where
        D: Clone + Send + 'static,
        L: Loader<D> + Clone + 'static,
    {
        let id = loader.id();
        trace!(loader = %id, "bridge: resolving synchronously");
        self.reset_on_affinity::<D, L>(loader)?;
        let outcome = self.resolve(loader);
        let after = self.reset_on_affinity::<D, L>(loader);
        let value = outcome?;
        after?;
        Ok(value)
    }

    fn resolve<D, L>(&self, loader: &L) -> Result<D, ChainError>
    where
        D: Clone + Send + 'static,
        L: Loader<D>,
    {
        if let Some(direct) = loader.load_blocking(self) {
            return direct;
        }

        let slot = Arc::new(FirstDelivery::<D>::default());
        let listener = loader.register_listener(Arc::clone(&slot) as Arc<dyn LoadListener<D>>);
        loader.start_loading();
        let result = slot.wait(self.poll_interval, || {
            loader.is_started() && !loader.is_abandoned()
        });
        loader.unregister_listener(listener);
        if result.is_err() {
            debug!(loader = %loader.id(), "bridge: loader stopped before delivering");
        }
        result
    }

    fn reset_on_affinity<D, L>(&self, loader: &L) -> Result<(), ChainError>
    where
        L: Loader<D> + Clone + 'static,
    {
        let target = loader.clone();
        run_blocking(self.affinity.as_ref(), move || target.reset())
    }
}

/// One-shot slot filled by the first delivery.
struct FirstDelivery<D> {
    slot: Mutex<Option<D>>,
    filled: Condvar,
}

impl<D> Default for FirstDelivery<D> {
    fn default() -> Self {
        Self {
            slot: Mutex::new(None),
            filled: Condvar::new(),
        }
    }
}

impl<D: Clone + Send> LoadListener<D> for FirstDelivery<D> {
    fn on_load_complete(&self, loader: LoaderId, data: &D) {
        let mut slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
        if slot.is_none() {
            *slot = Some(data.clone());
            self.filled.notify_all();
        } else {
            trace!(loader = %loader, "bridge: later delivery ignored");
        }
    }
}

impl<D> FirstDelivery<D> {
    /// Wait for the slot, checking `alive` every `poll` without holding the
    /// slot lock.
    fn wait(&self, poll: Duration, alive: impl Fn() -> bool) -> Result<D, ChainError> {
        loop {
            {
                let slot = self.slot.lock().unwrap_or_else(PoisonError::into_inner);
                let (mut slot, _) = self
                    .filled
                    .wait_timeout_while(slot, poll, |s| s.is_none())
                    .unwrap_or_else(PoisonError::into_inner);
                if let Some(data) = slot.take() {
                    return Ok(data);
                }
            }
            if !alive() {
                return Err(ChainError::Cancelled);
            }
        }
    }
}
