// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Scripted [`ChainSource`] fakes.
//!
//! A [`ScriptedSource`] always answers its attempt the same way (value,
//! defer or failure) and reports every hook call to a shared
//! [`SourceProbe`]. Sources can also append labelled events to an
//! [`EventLog`] shared across a whole chain, which is how tests assert
//! cross-loader ordering.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use chainload_core::{Attempt, ChainError, ChainSource, DeliveryKind, LoadResult};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Ordered, shared record of `"label:event"` strings.
#[derive(Clone, Default)]
pub struct EventLog(Arc<Mutex<Vec<String>>>);

impl EventLog {
    /// Empty log.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one event.
    pub fn push(&self, event: impl Into<String>) {
        lock(&self.0).push(event.into());
    }

    /// Copy of every event so far.
    pub fn events(&self) -> Vec<String> {
        lock(&self.0).clone()
    }

    /// Index of the first occurrence of `event`.
    pub fn position(&self, event: &str) -> Option<usize> {
        lock(&self.0).iter().position(|e| e == event)
    }

    /// Number of occurrences of `event`.
    pub fn count(&self, event: &str) -> usize {
        lock(&self.0).iter().filter(|e| *e == event).count()
    }
}

#[derive(Default)]
struct GateState {
    open: bool,
    arrivals: usize,
}

/// A latch that holds attempts until opened.
#[derive(Clone, Default)]
pub struct Gate(Arc<(Mutex<GateState>, Condvar)>);

impl Gate {
    /// A closed gate.
    pub fn new() -> Self {
        Self::default()
    }

    /// Release every current and future waiter.
    pub fn open(&self) {
        let (state, cv) = &*self.0;
        lock(state).open = true;
        cv.notify_all();
    }

    /// Arrive at the gate and wait (up to `timeout`) for it to open.
    /// Returns whether it opened.
    pub fn pass(&self, timeout: Duration) -> bool {
        let (state, cv) = &*self.0;
        let mut st = lock(state);
        st.arrivals += 1;
        cv.notify_all();
        let (st, _) = cv
            .wait_timeout_while(st, timeout, |s| !s.open)
            .unwrap_or_else(PoisonError::into_inner);
        st.open
    }

    /// Wait until at least `n` callers have arrived.
    pub fn await_arrivals(&self, n: usize, timeout: Duration) -> bool {
        let (state, cv) = &*self.0;
        let st = lock(state);
        let (st, _) = cv
            .wait_timeout_while(st, timeout, |s| s.arrivals < n)
            .unwrap_or_else(PoisonError::into_inner);
        st.arrivals >= n
    }
}

/// Counters and records of every hook a [`ScriptedSource`] saw.
pub struct SourceProbe<T> {
    attempts: AtomicUsize,
    starts: AtomicUsize,
    resets: AtomicUsize,
    abandons: AtomicUsize,
    releases: AtomicUsize,
    cancels: AtomicUsize,
    in_reprocess: AtomicUsize,
    max_overlap: AtomicUsize,
    reprocessed: Mutex<Vec<(T, DeliveryKind)>>,
    reprocess_threads: Mutex<Vec<Option<String>>>,
}

impl<T> Default for SourceProbe<T> {
    fn default() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
            starts: AtomicUsize::new(0),
            resets: AtomicUsize::new(0),
            abandons: AtomicUsize::new(0),
            releases: AtomicUsize::new(0),
            cancels: AtomicUsize::new(0),
            in_reprocess: AtomicUsize::new(0),
            max_overlap: AtomicUsize::new(0),
            reprocessed: Mutex::new(Vec::new()),
            reprocess_threads: Mutex::new(Vec::new()),
        }
    }
}

impl<T: Clone> SourceProbe<T> {
    /// `attempt` calls.
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
    /// `on_start_loading` calls.
    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }
    /// `on_reset` calls.
    pub fn resets(&self) -> usize {
        self.resets.load(Ordering::SeqCst)
    }
    /// `on_abandon` calls.
    pub fn abandons(&self) -> usize {
        self.abandons.load(Ordering::SeqCst)
    }
    /// `release` calls.
    pub fn releases(&self) -> usize {
        self.releases.load(Ordering::SeqCst)
    }
    /// `on_canceled` calls.
    pub fn cancels(&self) -> usize {
        self.cancels.load(Ordering::SeqCst)
    }
    /// Highest number of `reprocess` calls seen running at once.
    pub fn max_reprocess_overlap(&self) -> usize {
        self.max_overlap.load(Ordering::SeqCst)
    }
    /// Every `(value, kind)` handed to `reprocess`, in call order.
    pub fn reprocessed(&self) -> Vec<(T, DeliveryKind)> {
        lock(&self.reprocessed).clone()
    }
    /// Thread name of every `reprocess` call.
    pub fn reprocess_threads(&self) -> Vec<Option<String>> {
        lock(&self.reprocess_threads).clone()
    }
}

type ReprocessFn<T> = dyn Fn(T, DeliveryKind) -> Result<T, ChainError> + Send + Sync;

/// Configurable [`ChainSource`] fake.
pub struct ScriptedSource<T> {
    label: String,
    outcome: Result<Attempt<T>, ChainError>,
    reprocess: Option<Box<ReprocessFn<T>>>,
    attempt_delay: Duration,
    reprocess_delay: Duration,
    gate: Option<Gate>,
    log: Option<EventLog>,
    probe: Arc<SourceProbe<T>>,
}

/// How long a gated attempt waits before giving up.
const GATE_TIMEOUT: Duration = Duration::from_secs(10);

impl<T: Clone + Send + Sync + 'static> ScriptedSource<T> {
    fn with_outcome(outcome: Result<Attempt<T>, ChainError>) -> Self {
        Self {
            label: String::from("source"),
            outcome,
            reprocess: None,
            attempt_delay: Duration::ZERO,
            reprocess_delay: Duration::ZERO,
            gate: None,
            log: None,
            probe: Arc::new(SourceProbe::default()),
        }
    }

    /// Always produces `value` locally.
    pub fn value(value: T) -> Self {
        Self::with_outcome(Ok(Attempt::Value(value)))
    }

    /// Always defers to the delegate.
    pub fn defer() -> Self {
        Self::with_outcome(Ok(Attempt::Defer))
    }

    /// Always fails locally with `message`.
    pub fn failing(message: &str) -> Self {
        Self::with_outcome(Err(ChainError::failed(message)))
    }

    /// Name used in [`EventLog`] entries.
    pub fn label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    /// Append `"{label}:attempt"` and `"{label}:reprocess"` events to `log`.
    pub fn logging_to(mut self, log: &EventLog) -> Self {
        self.log = Some(log.clone());
        self
    }

    /// Transform delegate values with `f`.
    pub fn reprocess_with(
        mut self,
        f: impl Fn(T, DeliveryKind) -> Result<T, ChainError> + Send + Sync + 'static,
    ) -> Self {
        self.reprocess = Some(Box::new(f));
        self
    }

    /// Sleep this long inside every attempt.
    pub fn attempt_delay(mut self, delay: Duration) -> Self {
        self.attempt_delay = delay;
        self
    }

    /// Sleep this long inside every reprocess call.
    pub fn reprocess_delay(mut self, delay: Duration) -> Self {
        self.reprocess_delay = delay;
        self
    }

    /// Hold every attempt at `gate` until it opens.
    pub fn gated(mut self, gate: &Gate) -> Self {
        self.gate = Some(gate.clone());
        self
    }

    /// Shared probe observing this source.
    pub fn probe(&self) -> Arc<SourceProbe<T>> {
        Arc::clone(&self.probe)
    }

    fn record(&self, event: &str) {
        if let Some(log) = &self.log {
            log.push(format!("{}:{event}", self.label));
        }
    }
}

impl<T: Clone + Send + Sync + 'static> ChainSource for ScriptedSource<T> {
    type Output = T;

    fn attempt(&self) -> Result<Attempt<T>, ChainError> {
        self.probe.attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(gate) = &self.gate {
            if !gate.pass(GATE_TIMEOUT) {
                return Err(ChainError::failed("gate never opened"));
            }
        }
        if !self.attempt_delay.is_zero() {
            thread::sleep(self.attempt_delay);
        }
        self.record("attempt");
        self.outcome.clone()
    }

    fn reprocess(&self, value: T, kind: DeliveryKind) -> Result<T, ChainError> {
        let now = self.probe.in_reprocess.fetch_add(1, Ordering::SeqCst) + 1;
        self.probe.max_overlap.fetch_max(now, Ordering::SeqCst);
        lock(&self.probe.reprocessed).push((value.clone(), kind));
        lock(&self.probe.reprocess_threads).push(thread::current().name().map(str::to_owned));
        if !self.reprocess_delay.is_zero() {
            thread::sleep(self.reprocess_delay);
        }
        let out = match &self.reprocess {
            Some(f) => f(value, kind),
            None => Ok(value),
        };
        self.record("reprocess");
        self.probe.in_reprocess.fetch_sub(1, Ordering::SeqCst);
        out
    }

    fn release(&self, _result: &LoadResult<T>) {
        self.probe.releases.fetch_add(1, Ordering::SeqCst);
    }

    fn on_canceled(&self, _result: &LoadResult<T>) {
        self.probe.cancels.fetch_add(1, Ordering::SeqCst);
    }

    fn on_start_loading(&self) {
        self.probe.starts.fetch_add(1, Ordering::SeqCst);
    }

    fn on_reset(&self) {
        self.probe.resets.fetch_add(1, Ordering::SeqCst);
    }

    fn on_abandon(&self) {
        self.probe.abandons.fetch_add(1, Ordering::SeqCst);
    }
}
