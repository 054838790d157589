// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Host loaders for driving chains and the bridge in tests.
//!
//! All of them keep their lifecycle in a [`LoaderCore`], so they behave like
//! a framework loader would: deliveries reach listeners only while started.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chainload_core::{ChainError, ListenerId, LoadListener, Loader, LoaderCore, LoaderId, SyncBridge};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

macro_rules! delegate_core {
    () => {
        fn id(&self) -> LoaderId {
            self.inner.core.id()
        }
        fn is_started(&self) -> bool {
            self.inner.core.is_started()
        }
        fn is_reset(&self) -> bool {
            self.inner.core.is_reset()
        }
        fn is_abandoned(&self) -> bool {
            self.inner.core.is_abandoned()
        }
        fn register_listener(&self, listener: Arc<dyn LoadListener<D>>) -> ListenerId {
            self.inner.core.register_listener(listener)
        }
        fn unregister_listener(&self, id: ListenerId) -> bool {
            self.inner.core.unregister_listener(id)
        }
    };
}

// ── ScriptedLoader ─────────────────────────────────────────────────────

struct ScriptedInner<D> {
    core: LoaderCore<D>,
    starts: AtomicUsize,
    force_loads: AtomicUsize,
    resets: AtomicUsize,
    reset_threads: Mutex<Vec<Option<String>>>,
}

/// A loader that only delivers when the test tells it to.
pub struct ScriptedLoader<D> {
    inner: Arc<ScriptedInner<D>>,
}

impl<D> Clone for ScriptedLoader<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> Default for ScriptedLoader<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D> ScriptedLoader<D> {
    /// A fresh, reset loader.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(ScriptedInner {
                core: LoaderCore::new(),
                starts: AtomicUsize::new(0),
                force_loads: AtomicUsize::new(0),
                resets: AtomicUsize::new(0),
                reset_threads: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Deliver `data` now, on the calling thread. Returns listeners notified.
    pub fn deliver(&self, data: &D) -> usize {
        self.inner.core.deliver(data)
    }

    /// `start_loading` calls.
    pub fn starts(&self) -> usize {
        self.inner.starts.load(Ordering::SeqCst)
    }

    /// `force_load` calls.
    pub fn force_loads(&self) -> usize {
        self.inner.force_loads.load(Ordering::SeqCst)
    }

    /// `reset` calls.
    pub fn resets(&self) -> usize {
        self.inner.resets.load(Ordering::SeqCst)
    }

    /// Name of the thread each `reset` ran on.
    pub fn reset_threads(&self) -> Vec<Option<String>> {
        lock(&self.inner.reset_threads).clone()
    }

    /// Registered listener count.
    pub fn listener_count(&self) -> usize {
        self.inner.core.listener_count()
    }
}

impl<D: Send + 'static> Loader<D> for ScriptedLoader<D> {
    delegate_core!();

    fn start_loading(&self) {
        self.inner.core.start();
        self.inner.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn force_load(&self) {
        self.inner.force_loads.fetch_add(1, Ordering::SeqCst);
    }

    fn reset(&self) {
        self.inner.core.reset();
        self.inner.resets.fetch_add(1, Ordering::SeqCst);
        lock(&self.inner.reset_threads).push(thread::current().name().map(str::to_owned));
    }

    fn abandon(&self) {
        self.inner.core.abandon();
    }
}

// ── ImmediateLoader ────────────────────────────────────────────────────

struct ImmediateInner<D> {
    core: LoaderCore<D>,
    script: Vec<D>,
}

/// Delivers its whole script synchronously inside `start_loading` and
/// `force_load`.
pub struct ImmediateLoader<D> {
    inner: Arc<ImmediateInner<D>>,
}

impl<D> Clone for ImmediateLoader<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> ImmediateLoader<D> {
    /// Deliver `script` in order on every load.
    pub fn new(script: Vec<D>) -> Self {
        Self {
            inner: Arc::new(ImmediateInner {
                core: LoaderCore::new(),
                script,
            }),
        }
    }

    fn run(&self) {
        for data in &self.inner.script {
            self.inner.core.deliver(data);
        }
    }
}

impl<D: Send + Sync + 'static> Loader<D> for ImmediateLoader<D> {
    delegate_core!();

    fn start_loading(&self) {
        self.inner.core.start();
        self.run();
    }

    fn force_load(&self) {
        self.run();
    }

    fn reset(&self) {
        self.inner.core.reset();
    }

    fn abandon(&self) {
        self.inner.core.abandon();
    }
}

// ── ThreadedLoader ─────────────────────────────────────────────────────

struct ThreadedInner<D> {
    core: LoaderCore<D>,
    script: Vec<D>,
    delay: Duration,
    gap: Duration,
    generation: AtomicU64,
}

/// Delivers its script from a background thread after `delay`, pausing
/// `gap` between deliveries. A reset stops an in-flight script.
pub struct ThreadedLoader<D> {
    inner: Arc<ThreadedInner<D>>,
}

impl<D> Clone for ThreadedLoader<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D: Send + Sync + 'static> ThreadedLoader<D> {
    /// Deliver `script` after `delay`.
    pub fn new(script: Vec<D>, delay: Duration) -> Self {
        Self::with_gap(script, delay, Duration::ZERO)
    }

    /// Deliver `script` after `delay`, `gap` apart.
    pub fn with_gap(script: Vec<D>, delay: Duration, gap: Duration) -> Self {
        Self {
            inner: Arc::new(ThreadedInner {
                core: LoaderCore::new(),
                script,
                delay,
                gap,
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn spawn_cycle(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        thread::spawn(move || {
            thread::sleep(inner.delay);
            for (i, data) in inner.script.iter().enumerate() {
                if inner.generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if i > 0 {
                    thread::sleep(inner.gap);
                }
                inner.core.deliver(data);
            }
        });
    }
}

impl<D: Send + Sync + 'static> Loader<D> for ThreadedLoader<D> {
    delegate_core!();

    fn start_loading(&self) {
        self.inner.core.start();
        self.spawn_cycle();
    }

    fn force_load(&self) {
        self.spawn_cycle();
    }

    fn reset(&self) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        self.inner.core.reset();
    }

    fn abandon(&self) {
        self.inner.core.abandon();
    }
}

// ── DirectLoader ───────────────────────────────────────────────────────

struct DirectInner<D> {
    core: LoaderCore<D>,
    answer: Result<D, ChainError>,
    direct_calls: AtomicUsize,
}

/// Offers a direct blocking path; the bridge should never need its
/// listeners.
pub struct DirectLoader<D> {
    inner: Arc<DirectInner<D>>,
}

impl<D> Clone for DirectLoader<D> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<D> DirectLoader<D> {
    /// Answer every direct call with `answer`.
    pub fn new(answer: Result<D, ChainError>) -> Self {
        Self {
            inner: Arc::new(DirectInner {
                core: LoaderCore::new(),
                answer,
                direct_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// `load_blocking` calls.
    pub fn direct_calls(&self) -> usize {
        self.inner.direct_calls.load(Ordering::SeqCst)
    }
}

impl<D: Clone + Send + Sync + 'static> Loader<D> for DirectLoader<D> {
    delegate_core!();

    fn start_loading(&self) {
        self.inner.core.start();
        if let Ok(data) = &self.inner.answer {
            self.inner.core.deliver(data);
        }
    }

    fn force_load(&self) {
        if let Ok(data) = &self.inner.answer {
            self.inner.core.deliver(data);
        }
    }

    fn reset(&self) {
        self.inner.core.reset();
    }

    fn abandon(&self) {
        self.inner.core.abandon();
    }

    fn load_blocking(&self, _bridge: &SyncBridge) -> Option<Result<D, ChainError>> {
        self.inner.direct_calls.fetch_add(1, Ordering::SeqCst);
        Some(self.inner.answer.clone())
    }
}
