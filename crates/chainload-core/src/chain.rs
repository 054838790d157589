// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Chain loader state machine.
//!
//! A [`ChainLoader`] first asks its [`ChainSource`] for a local value. If the
//! source defers, the loader starts its delegate and runs every delegate
//! delivery through [`ChainSource::reprocess`] before delivering it to its
//! own listeners.
//!
//! # Phases
//!
//! `Initialized → LoadingSelf → LoadingChain`, back to `LoadingSelf` once a
//! delivery ends the cycle, and back to `Initialized` on reset or when an
//! unfinished cycle is abandoned.
//!
//! Once a cycle has entered the chain, every delegate delivery is reprocessed
//! while this loader is started, including deliveries after a COMPLETE. Only
//! reset and a new local attempt detach the cycle from the delegate.
//!
//! # Ordering
//!
//! Local attempts, reprocessing and cached redeliveries are all submitted to
//! the [`FallbackScheduler`] under this loader's [`LoaderId`], so they run
//! one at a time and in order. Each cycle carries a generation number; work
//! from an older generation is cancelled instead of delivered.

use std::fmt;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe, Location};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use chainload_sched::FallbackScheduler;
use tracing::{debug, error, trace, warn};

use crate::lifecycle::{ListenerId, LoadListener, Loader, LoaderCore, LoaderId};
use crate::{ChainError, DeliveryKind, LoadResult, SyncBridge};

/// Outcome of a local attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attempt<T> {
    /// Produced locally.
    Value(T),
    /// No local value; fall back to the delegate. Only legal when the loader
    /// has one.
    Defer,
}

/// The behaviour a concrete chain loader supplies.
///
/// Only [`attempt`](Self::attempt) is required. Every hook runs on a
/// scheduler worker, or on the caller's thread inside
/// [`SyncBridge::get`].
pub trait ChainSource: Send + Sync + 'static {
    /// Value type carried by this chain.
    type Output: Clone + Send + Sync + 'static;

    /// Try to produce a value without the delegate.
    fn attempt(&self) -> Result<Attempt<Self::Output>, ChainError>;

    /// Post-process one delegate delivery.
    ///
    /// Called once per delegate value, in delegate order, never concurrently
    /// for one loader. Delegate failures bypass this hook.
    fn reprocess(
        &self,
        value: Self::Output,
        kind: DeliveryKind,
    ) -> Result<Self::Output, ChainError> {
        let _ = kind;
        Ok(value)
    }

    /// A result this loader delivered has been superseded or dropped.
    fn release(&self, result: &LoadResult<Self::Output>) {
        let _ = result;
    }

    /// A result was produced by cancelled work and will not be delivered.
    /// [`release`](Self::release) follows.
    fn on_canceled(&self, result: &LoadResult<Self::Output>) {
        let _ = result;
    }

    /// The loader was started.
    fn on_start_loading(&self) {}

    /// The loader was reset.
    fn on_reset(&self) {}

    /// The loader was abandoned.
    fn on_abandon(&self) {}
}

/// Shared handle to a delegate loader.
pub type Delegate<T> = Arc<dyn Loader<LoadResult<T>>>;

/// Where a chain loader is in its loading cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Fresh or reset; nothing attempted yet.
    Initialized,
    /// The local attempt is pending or the last cycle has ended.
    LoadingSelf,
    /// Waiting on delegate deliveries.
    LoadingChain,
}

struct ChainState<T> {
    phase: Phase,
    last: Option<LoadResult<T>>,
    generation: u64,
    /// The current cycle deferred to the delegate.
    chained: bool,
    /// A delivery ended the current cycle.
    settled: bool,
    /// Sequence number handed to the most recent delegate delivery.
    next_seq: u64,
    /// Sequence number of the most recently reprocessed delivery.
    applied_seq: u64,
}

impl<T> ChainState<T> {
    fn new_cycle(&mut self) -> u64 {
        self.generation += 1;
        self.settled = false;
        self.applied_seq = self.next_seq;
        self.generation
    }
}

#[track_caller]
#[allow(clippy::panic)]
#[cold]
fn contract_violation(site: &Location<'_>, what: fmt::Arguments<'_>) -> ! {
    panic!("chain loader contract violation: {what} (loader created at {site})")
}

struct Inner<S: ChainSource> {
    core: LoaderCore<LoadResult<S::Output>>,
    source: S,
    delegate: Option<Delegate<S::Output>>,
    delegate_listener: Option<ListenerId>,
    scheduler: FallbackScheduler,
    /// Makes "check generation, replace cached result, notify" atomic.
    delivery: Mutex<()>,
    state: Mutex<ChainState<S::Output>>,
    created_at: &'static Location<'static>,
}

impl<S: ChainSource> Drop for Inner<S> {
    fn drop(&mut self) {
        if let (Some(delegate), Some(id)) = (&self.delegate, self.delegate_listener) {
            delegate.unregister_listener(id);
        }
    }
}

/// Receives the delegate's deliveries without keeping the parent alive.
struct DelegateListener<S: ChainSource> {
    parent: Weak<Inner<S>>,
}

impl<S: ChainSource> LoadListener<LoadResult<S::Output>> for DelegateListener<S> {
    fn on_load_complete(&self, _loader: LoaderId, data: &LoadResult<S::Output>) {
        if let Some(parent) = self.parent.upgrade() {
            parent.on_delegate_delivery(data.clone());
        }
    }
}

impl<S: ChainSource> Inner<S> {
    fn id(&self) -> LoaderId {
        self.core.id()
    }

    fn state(&self) -> MutexGuard<'_, ChainState<S::Output>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run a source hook; a panic is logged with the construction site and
    /// then resumed.
    fn guarded<R>(&self, stage: &'static str, hook: impl FnOnce() -> R) -> R {
        match catch_unwind(AssertUnwindSafe(hook)) {
            Ok(value) => value,
            Err(payload) => {
                error!(
                    loader = %self.id(),
                    stage,
                    created_at = %self.created_at,
                    "chain loader hook panicked"
                );
                resume_unwind(payload)
            }
        }
    }

    fn require_delegate(&self) -> &Delegate<S::Output> {
        match &self.delegate {
            Some(delegate) => delegate,
            None => contract_violation(
                self.created_at,
                format_args!("attempt deferred but the loader has no delegate"),
            ),
        }
    }

    fn submit(
        self: &Arc<Self>,
        what: &'static str,
        job: impl FnOnce(&Arc<Self>) + Send + 'static,
    ) {
        let this = Arc::clone(self);
        if !self.scheduler.submit(self.id().owner(), move || job(&this)) {
            warn!(loader = %self.id(), what, "scheduler shut down; chain work dropped");
        }
    }

    fn start_loading(self: &Arc<Self>) {
        self.core.start();
        self.source.on_start_loading();
        let (phase, cached) = {
            let st = self.state();
            (st.phase, st.last.as_ref().map(|_| st.generation))
        };
        if let Some(generation) = cached {
            self.submit("redeliver", move |this| this.redeliver(generation));
        }
        if phase == Phase::Initialized {
            self.force_load();
        }
    }

    fn force_load(self: &Arc<Self>) {
        let generation = {
            let mut st = self.state();
            st.phase = Phase::LoadingSelf;
            st.chained = false;
            st.new_cycle()
        };
        trace!(loader = %self.id(), generation, "local attempt queued");
        self.submit("attempt", move |this| this.run_attempt(generation));
    }

    fn run_attempt(&self, generation: u64) {
        if self.state().generation != generation {
            trace!(loader = %self.id(), generation, "stale local attempt skipped");
            return;
        }
        match self.guarded("attempt", || self.source.attempt()) {
            Ok(Attempt::Value(value)) => self.deliver(generation, LoadResult::success(value)),
            Ok(Attempt::Defer) => self.enter_chain(generation),
            Err(err) => self.deliver(generation, LoadResult::failure(err)),
        }
    }

    fn enter_chain(&self, generation: u64) {
        let delegate = self.require_delegate();
        {
            let mut st = self.state();
            if st.generation != generation {
                return;
            }
            st.phase = Phase::LoadingChain;
            st.chained = true;
        }
        debug!(loader = %self.id(), delegate = %delegate.id(), "no local result; loading chain");
        if delegate.is_started() {
            delegate.force_load();
        } else {
            delegate.start_loading();
        }
    }

    fn on_delegate_delivery(self: &Arc<Self>, delivered: LoadResult<S::Output>) {
        let ticket = {
            let mut st = self.state();
            if st.chained && self.core.is_started() {
                st.next_seq += 1;
                Some((st.generation, st.next_seq))
            } else {
                None
            }
        };
        let Some((generation, seq)) = ticket else {
            debug!(
                loader = %self.id(),
                kind = %delivered.kind(),
                "delegate delivery ignored; chain not entered"
            );
            return;
        };
        self.submit("reprocess", move |this| {
            this.run_reprocess(generation, seq, delivered);
        });
    }

    fn run_reprocess(&self, generation: u64, seq: u64, delivered: LoadResult<S::Output>) {
        {
            let mut st = self.state();
            if st.generation != generation {
                trace!(loader = %self.id(), seq, "stale delegate delivery skipped");
                return;
            }
            let expected = st.applied_seq + 1;
            if seq != expected {
                drop(st);
                contract_violation(
                    self.created_at,
                    format_args!("delegate delivery {seq} reprocessed out of order (expected {expected})"),
                );
            }
            st.applied_seq = seq;
        }
        let reprocessed = delivered.try_map(|value, kind| {
            self.guarded("reprocess", || self.source.reprocess(value, kind))
        });
        self.deliver(generation, reprocessed);
    }

    fn deliver(&self, generation: u64, result: LoadResult<S::Output>) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let superseded = {
            let mut st = self.state();
            if st.generation != generation {
                drop(st);
                self.cancel(&result);
                return;
            }
            if result.kind().ends_cycle() {
                st.phase = Phase::LoadingSelf;
                st.settled = true;
            }
            st.last.replace(result.clone())
        };
        let notified = self.core.deliver(&result);
        trace!(loader = %self.id(), kind = %result.kind(), notified, "result delivered");
        if let Some(old) = superseded {
            self.source.release(&old);
        }
    }

    fn redeliver(&self, generation: u64) {
        let _delivery = self.delivery.lock().unwrap_or_else(PoisonError::into_inner);
        let cached = {
            let st = self.state();
            if st.generation == generation {
                st.last.clone()
            } else {
                None
            }
        };
        if let Some(cached) = cached {
            trace!(loader = %self.id(), kind = %cached.kind(), "cached result redelivered");
            self.core.deliver(&cached);
        }
    }

    fn cancel(&self, result: &LoadResult<S::Output>) {
        trace!(loader = %self.id(), kind = %result.kind(), "result of cancelled work released");
        self.source.on_canceled(result);
        self.source.release(result);
    }

    fn reset(&self) {
        let released = {
            let mut st = self.state();
            st.new_cycle();
            st.phase = Phase::Initialized;
            st.chained = false;
            st.last.take()
        };
        let was_active = self.core.reset();
        let purged = self.scheduler.purge(self.id().owner());
        if let Some(delegate) = &self.delegate {
            delegate.reset();
        }
        self.source.on_reset();
        if let Some(old) = released {
            self.source.release(&old);
        }
        if was_active || purged > 0 {
            debug!(loader = %self.id(), purged, "chain loader reset");
        }
    }

    fn abandon(&self) {
        {
            let mut st = self.state();
            let settled = st.settled;
            if !settled {
                st.phase = Phase::Initialized;
            }
            st.new_cycle();
            st.settled = settled;
        }
        self.core.abandon();
        let purged = self.scheduler.purge(self.id().owner());
        self.source.on_abandon();
        debug!(loader = %self.id(), purged, "chain loader abandoned");
    }

    fn load_sync(&self, bridge: &SyncBridge) -> Result<LoadResult<S::Output>, ChainError> {
        let generation = {
            let mut st = self.state();
            st.phase = Phase::LoadingSelf;
            st.generation
        };
        match self.guarded("attempt", || self.source.attempt()) {
            Ok(Attempt::Value(value)) => Ok(LoadResult::success(value)),
            Err(err) => Ok(LoadResult::failure(err)),
            Ok(Attempt::Defer) => {
                let delegate = self.require_delegate();
                self.advance(generation, Phase::LoadingSelf, Phase::LoadingChain)?;
                let delivered: LoadResult<S::Output> = bridge.get(delegate)?;
                self.advance(generation, Phase::LoadingChain, Phase::LoadingChain)?;
                Ok(delivered.try_map(|value, kind| {
                    self.guarded("reprocess", || self.source.reprocess(value, kind))
                }))
            }
        }
    }

    /// Move `from → to` unless a reset or new cycle intervened.
    fn advance(&self, generation: u64, from: Phase, to: Phase) -> Result<(), ChainError> {
        let mut st = self.state();
        if st.generation != generation || st.phase != from {
            return Err(ChainError::Cancelled);
        }
        st.phase = to;
        Ok(())
    }
}

/// A loader that tries itself first and falls back to a delegate.
///
/// Cloning yields another handle to the same loader.
///
/// # Panics
/// Deferring without a delegate, and reprocessing delegate deliveries out of
/// order, are contract violations and panic. On a worker the panic ends
/// that work item and is logged with the loader's construction site.
pub struct ChainLoader<S: ChainSource> {
    inner: Arc<Inner<S>>,
}

impl<S: ChainSource> Clone for ChainLoader<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: ChainSource> fmt::Debug for ChainLoader<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChainLoader")
            .field("id", &self.inner.id())
            .field("phase", &self.phase())
            .field("has_delegate", &self.inner.delegate.is_some())
            .field("created_at", &self.inner.created_at)
            .finish_non_exhaustive()
    }
}

impl<S: ChainSource> ChainLoader<S> {
    /// A chain loader with no delegate; `source` must always produce a
    /// value or a failure.
    #[track_caller]
    pub fn new(source: S, scheduler: FallbackScheduler) -> Self {
        Self::build(source, None, scheduler)
    }

    /// A chain loader falling back to `delegate`.
    #[track_caller]
    pub fn with_delegate(source: S, delegate: Delegate<S::Output>, scheduler: FallbackScheduler) -> Self {
        Self::build(source, Some(delegate), scheduler)
    }

    #[track_caller]
    fn build(source: S, delegate: Option<Delegate<S::Output>>, scheduler: FallbackScheduler) -> Self {
        let created_at = Location::caller();
        let inner = Arc::new_cyclic(|weak: &Weak<Inner<S>>| {
            let delegate_listener = delegate.as_ref().map(|d| {
                d.register_listener(Arc::new(DelegateListener {
                    parent: Weak::clone(weak),
                }))
            });
            Inner {
                core: LoaderCore::new(),
                source,
                delegate,
                delegate_listener,
                scheduler,
                delivery: Mutex::new(()),
                state: Mutex::new(ChainState {
                    phase: Phase::Initialized,
                    last: None,
                    generation: 0,
                    chained: false,
                    settled: false,
                    next_seq: 0,
                    applied_seq: 0,
                }),
                created_at,
            }
        });
        trace!(loader = %inner.id(), %created_at, "chain loader created");
        Self { inner }
    }

    /// Current phase.
    pub fn phase(&self) -> Phase {
        self.inner.state().phase
    }

    /// Where this loader was constructed.
    pub fn created_at(&self) -> &'static Location<'static> {
        self.inner.created_at
    }

    /// The behaviour this loader runs.
    pub fn source(&self) -> &S {
        &self.inner.source
    }

    /// The fallback loader, if any.
    pub fn delegate(&self) -> Option<&Delegate<S::Output>> {
        self.inner.delegate.as_ref()
    }

    /// The scheduler this loader submits work to.
    pub fn scheduler(&self) -> &FallbackScheduler {
        &self.inner.scheduler
    }

    /// The most recent delivered result of the current cycle.
    pub fn last_result(&self) -> Option<LoadResult<S::Output>> {
        self.inner.state().last.clone()
    }

    /// Type-erase into a delegate for an outer chain loader.
    pub fn into_delegate(self) -> Delegate<S::Output> {
        Arc::new(self)
    }
}

impl<S: ChainSource> Loader<LoadResult<S::Output>> for ChainLoader<S> {
    fn id(&self) -> LoaderId {
        self.inner.id()
    }

    fn start_loading(&self) {
        self.inner.start_loading();
    }

    fn force_load(&self) {
        self.inner.force_load();
    }

    fn reset(&self) {
        self.inner.reset();
    }

    fn abandon(&self) {
        self.inner.abandon();
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

    fn register_listener(&self, listener: Arc<dyn LoadListener<LoadResult<S::Output>>>) -> ListenerId {
        self.inner.core.register_listener(listener)
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.core.unregister_listener(id)
    }

    fn load_blocking(&self, bridge: &SyncBridge) -> Option<Result<LoadResult<S::Output>, ChainError>> {
        Some(self.inner.load_sync(bridge))
    }
}
