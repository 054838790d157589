// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Host loader interface and a minimal lifecycle implementation.
//!
//! [`Loader`] is the narrow surface the chain machinery and the synchronous
//! bridge need from any loader. [`LoaderCore`] supplies the lifecycle flags
//! and listener fan-out that concrete loaders would otherwise inherit from a
//! host framework.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chainload_sched::OwnerId;
use tracing::trace;

use crate::{ChainError, SyncBridge};

/// Identity of one loader instance; doubles as its scheduler partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LoaderId(OwnerId);

impl LoaderId {
    /// Allocate a fresh process-unique id.
    pub fn allocate() -> Self {
        Self(OwnerId::allocate())
    }

    /// The scheduler partition this loader's work runs under.
    pub const fn owner(self) -> OwnerId {
        self.0
    }
}

impl From<LoaderId> for OwnerId {
    fn from(id: LoaderId) -> Self {
        id.0
    }
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loader#{}", self.0.value())
    }
}

/// Handle returned by [`Loader::register_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

static NEXT_LISTENER: AtomicU64 = AtomicU64::new(1);

impl ListenerId {
    fn allocate() -> Self {
        Self(NEXT_LISTENER.fetch_add(1, Ordering::Relaxed))
    }
}

/// Receives deliveries from a loader.
pub trait LoadListener<D>: Send + Sync {
    /// Called once per delivery, on whichever thread delivered.
    fn on_load_complete(&self, loader: LoaderId, data: &D);
}

impl<D, F> LoadListener<D> for F
where
    F: Fn(LoaderId, &D) + Send + Sync,
{
    fn on_load_complete(&self, loader: LoaderId, data: &D) {
        self(loader, data);
    }
}

/// The lifecycle surface of a loader producing `D`.
pub trait Loader<D>: Send + Sync {
    /// Stable identity of this instance.
    fn id(&self) -> LoaderId;
    /// Begin (or resume) loading; may redeliver a cached result.
    fn start_loading(&self);
    /// Start a fresh load regardless of cached state.
    fn force_load(&self);
    /// Cancel in-flight work and drop cached state. Idempotent.
    fn reset(&self);
    /// Stop delivering to listeners without resetting.
    fn abandon(&self);
    /// Between `start_loading` and `reset`.
    fn is_started(&self) -> bool;
    /// Reset and not started since.
    fn is_reset(&self) -> bool;
    /// Abandoned since the last start.
    fn is_abandoned(&self) -> bool;
    /// Subscribe to deliveries.
    fn register_listener(&self, listener: Arc<dyn LoadListener<D>>) -> ListenerId;
    /// Unsubscribe. Returns `false` if `id` was not registered.
    fn unregister_listener(&self, id: ListenerId) -> bool;

    /// Produce one result on the calling thread, bypassing the listener
    /// machinery. `None` means the loader has no such path and the bridge
    /// must drive it through its lifecycle instead.
    fn load_blocking(&self, bridge: &SyncBridge) -> Option<Result<D, ChainError>> {
        let _ = bridge;
        None
    }
}

impl<D, L> Loader<D> for Arc<L>
where
    L: Loader<D> + ?Sized,
{
    fn id(&self) -> LoaderId {
        (**self).id()
    }
    fn start_loading(&self) {
        (**self).start_loading();
    }
    fn force_load(&self) {
        (**self).force_load();
    }
    fn reset(&self) {
        (**self).reset();
    }
    fn abandon(&self) {
        (**self).abandon();
    }
    fn is_started(&self) -> bool {
        (**self).is_started()
    }
    fn is_reset(&self) -> bool {
        (**self).is_reset()
    }
    fn is_abandoned(&self) -> bool {
        (**self).is_abandoned()
    }
    fn register_listener(&self, listener: Arc<dyn LoadListener<D>>) -> ListenerId {
        (**self).register_listener(listener)
    }
    fn unregister_listener(&self, id: ListenerId) -> bool {
        (**self).unregister_listener(id)
    }
    fn load_blocking(&self, bridge: &SyncBridge) -> Option<Result<D, ChainError>> {
        (**self).load_blocking(bridge)
    }
}

struct CoreState<D> {
    started: bool,
    reset: bool,
    abandoned: bool,
    listeners: Vec<(ListenerId, Arc<dyn LoadListener<D>>)>,
}

/// Lifecycle flags, listener registry and delivery fan-out.
///
/// A new core is reset and not started. Listeners are invoked outside the
/// internal lock, so a listener may call back into the loader.
pub struct LoaderCore<D> {
    id: LoaderId,
    state: Mutex<CoreState<D>>,
}

impl<D> fmt::Debug for LoaderCore<D> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LoaderCore")
            .field("id", &self.id)
            .field("started", &state.started)
            .field("reset", &state.reset)
            .field("abandoned", &state.abandoned)
            .field("listeners", &state.listeners.len())
            .finish()
    }
}

impl<D> Default for LoaderCore<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> LoaderCore<D> {
    /// A reset, unstarted core with a fresh id.
    pub fn new() -> Self {
        Self::with_id(LoaderId::allocate())
    }

    /// A reset, unstarted core with a caller-chosen id.
    pub fn with_id(id: LoaderId) -> Self {
        Self {
            id,
            state: Mutex::new(CoreState {
                started: false,
                reset: true,
                abandoned: false,
                listeners: Vec::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, CoreState<D>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// This core's id.
    pub const fn id(&self) -> LoaderId {
        self.id
    }

    /// Enter the started state. Returns `true` if it was not started.
    pub fn start(&self) -> bool {
        let mut state = self.lock();
        let was_started = state.started;
        state.started = true;
        state.reset = false;
        state.abandoned = false;
        !was_started
    }

    /// Enter the reset state. Returns `true` if it was not already reset.
    pub fn reset(&self) -> bool {
        let mut state = self.lock();
        let was_reset = state.reset;
        state.started = false;
        state.abandoned = false;
        state.reset = true;
        !was_reset
    }

    /// Mark abandoned; deliveries stop reaching listeners.
    pub fn abandon(&self) {
        self.lock().abandoned = true;
    }

    /// See [`Loader::is_started`].
    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    /// See [`Loader::is_reset`].
    pub fn is_reset(&self) -> bool {
        self.lock().reset
    }

    /// See [`Loader::is_abandoned`].
    pub fn is_abandoned(&self) -> bool {
        self.lock().abandoned
    }

    /// See [`Loader::register_listener`].
    pub fn register_listener(&self, listener: Arc<dyn LoadListener<D>>) -> ListenerId {
        let id = ListenerId::allocate();
        self.lock().listeners.push((id, listener));
        id
    }

    /// See [`Loader::unregister_listener`].
    pub fn unregister_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        let before = state.listeners.len();
        state.listeners.retain(|(l, _)| *l != id);
        state.listeners.len() != before
    }

    /// Registered listener count.
    pub fn listener_count(&self) -> usize {
        self.lock().listeners.len()
    }

    /// Hand `data` to every listener if started and not abandoned.
    ///
    /// Returns how many listeners were notified.
    pub fn deliver(&self, data: &D) -> usize {
        let listeners: Vec<_> = {
            let state = self.lock();
            if !state.started || state.abandoned {
                trace!(loader = %self.id, "delivery suppressed; loader not active");
                return 0;
            }
            state.listeners.iter().map(|(_, l)| Arc::clone(l)).collect()
        };
        for listener in &listeners {
            listener.on_load_complete(self.id, data);
        }
        listeners.len()
    }
}
