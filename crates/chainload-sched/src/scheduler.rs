// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Fallback delivery scheduler: a bounded worker pool over owner partitions.
//!
//! # Locking
//!
//! Two independent primitives are used:
//!
//! 1. The **partition lock** guards the owner → queue map and the executing
//!    set. Every structural change goes through it, and it is never held
//!    while user work runs.
//! 2. The **wakeup semaphore** parks idle workers. Each submission and each
//!    completed item releases exactly one permit, so one worker wakes and
//!    re-scans partitions. Only shutdown and pool recycling wake everyone.

use std::cell::Cell;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, error, trace, warn};

use crate::partition::{Job, Next, Partitions};
use crate::{OwnerId, SchedulerConfig, SchedulerError};

thread_local! {
    static ON_WORKER: Cell<bool> = const { Cell::new(false) };
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Counting wakeup channel for parked workers.
#[derive(Default)]
struct Wakeup {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl Wakeup {
    fn release_one(&self) {
        let mut permits = lock(&self.permits);
        *permits += 1;
        self.cv.notify_one();
    }

    fn release_all(&self, count: usize) {
        let mut permits = lock(&self.permits);
        *permits += count;
        self.cv.notify_all();
    }

    /// Take one permit, waiting at most `timeout` (forever when `None`).
    fn acquire(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut permits = lock(&self.permits);
        while *permits == 0 {
            permits = match deadline {
                None => self.cv.wait(permits).unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return false;
                    }
                    self.cv
                        .wait_timeout(permits, remaining)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *permits -= 1;
        true
    }
}

/// Why a worker left its loop.
enum Exit {
    /// Shut down or recycled; still counted in `live`.
    Stopped,
    /// Idle above the minimum; `live` was already decremented.
    Retired,
}

struct Shared {
    config: SchedulerConfig,
    partitions: Mutex<Partitions>,
    /// Paired with `partitions`; signalled when nothing is queued or running.
    idle: Condvar,
    wakeup: Wakeup,
    /// Worker pool generation. Workers of an older epoch exit.
    epoch: AtomicU64,
    live: AtomicUsize,
    busy: AtomicUsize,
    spawned: AtomicUsize,
    completed: AtomicU64,
    panicked: AtomicU64,
    handles: Mutex<Vec<JoinHandle<()>>>,
    /// Serializes `drain_and_recreate` calls.
    recycle: Mutex<()>,
}

impl Shared {
    fn worker_loop(&self, epoch: u64) -> Exit {
        loop {
            if self.epoch.load(Ordering::Acquire) != epoch {
                // Pass the wakeup on so every stale worker gets to exit.
                self.wakeup.release_one();
                return Exit::Stopped;
            }
            let next = lock(&self.partitions).take_next();
            match next {
                Next::Run(owner, job) => {
                    self.run(owner, job);
                    continue;
                }
                Next::Closed => {
                    self.wakeup.release_one();
                    return Exit::Stopped;
                }
                Next::Empty => {}
            }
            let above_min = self.live.load(Ordering::Acquire) > self.config.min_workers;
            let timeout = above_min.then(|| self.config.keep_alive());
            if !self.wakeup.acquire(timeout) && self.try_retire() {
                return Exit::Retired;
            }
        }
    }

    fn run(&self, owner: OwnerId, job: Job) {
        self.busy.fetch_add(1, Ordering::AcqRel);
        trace!(%owner, "running fallback work item");
        let outcome = catch_unwind(AssertUnwindSafe(job));
        self.busy.fetch_sub(1, Ordering::AcqRel);
        match outcome {
            Ok(()) => {
                self.completed.fetch_add(1, Ordering::Relaxed);
            }
            Err(payload) => {
                self.panicked.fetch_add(1, Ordering::Relaxed);
                error!(
                    %owner,
                    panic = panic_message(payload.as_ref()),
                    "fallback work item panicked; item dropped"
                );
            }
        }
        {
            let mut parts = lock(&self.partitions);
            parts.finish(owner);
            if parts.is_idle() {
                self.idle.notify_all();
            }
        }
        self.wakeup.release_one();
    }

    fn try_retire(&self) -> bool {
        let min = self.config.min_workers;
        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                if live > min {
                    Some(live - 1)
                } else {
                    None
                }
            })
            .is_ok()
    }

    fn close(&self) -> bool {
        let newly_closed = {
            let mut parts = lock(&self.partitions);
            let was_closed = parts.is_closed();
            parts.close();
            !was_closed
        };
        if newly_closed {
            debug!("fallback scheduler shutting down");
        }
        self.wakeup
            .release_all(self.live.load(Ordering::Acquire).max(1));
        newly_closed
    }

    fn is_closed(&self) -> bool {
        lock(&self.partitions).is_closed()
    }

    fn wait_idle(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut parts = lock(&self.partitions);
        while !parts.is_idle() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            parts = self
                .idle
                .wait_timeout(parts, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }

    /// Wait for every live worker to exit, then join the handles.
    fn join_workers(&self, deadline: Instant) -> bool {
        while self.live.load(Ordering::Acquire) > 0 {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(Duration::from_millis(10).min(remaining));
        }
        let handles: Vec<_> = lock(&self.handles).drain(..).collect();
        let me = thread::current().id();
        for handle in handles {
            if handle.thread().id() != me {
                // Workers catch item panics, so a join error means the
                // worker loop itself unwound; nothing is left to clean up.
                let _ = handle.join();
            }
        }
        true
    }
}

/// Spawn a worker whose `live` slot the caller already reserved.
fn spawn_worker(shared: &Arc<Shared>, epoch: u64) -> Result<(), SchedulerError> {
    let n = shared.spawned.fetch_add(1, Ordering::Relaxed) + 1;
    let name = format!("{}-{n}", shared.config.thread_name_prefix);
    let worker = Arc::clone(shared);
    let spawned = thread::Builder::new().name(name).spawn(move || {
        ON_WORKER.with(|flag| flag.set(true));
        debug!(epoch, "fallback worker started");
        match worker.worker_loop(epoch) {
            Exit::Stopped => {
                worker.live.fetch_sub(1, Ordering::AcqRel);
                debug!(epoch, "fallback worker stopped");
            }
            Exit::Retired => debug!(epoch, "idle fallback worker retired"),
        }
    });
    match spawned {
        Ok(handle) => {
            let mut handles = lock(&shared.handles);
            handles.retain(|h| !h.is_finished());
            handles.push(handle);
            Ok(())
        }
        Err(err) => {
            shared.live.fetch_sub(1, Ordering::AcqRel);
            Err(err.into())
        }
    }
}

fn start_pool(shared: &Arc<Shared>, epoch: u64) -> Result<(), SchedulerError> {
    for _ in 0..shared.config.min_workers {
        shared.live.fetch_add(1, Ordering::AcqRel);
        spawn_worker(shared, epoch)?;
    }
    Ok(())
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    payload
        .downcast_ref::<&'static str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}

/// Closes the scheduler when the last [`FallbackScheduler`] clone drops.
struct Owner {
    shared: Arc<Shared>,
}

impl Drop for Owner {
    fn drop(&mut self) {
        // May run on a worker (a work item holding the last handle), so
        // signal only; never join here.
        self.shared.close();
    }
}

/// Point-in-time counters for a [`FallbackScheduler`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Live worker threads.
    pub workers: usize,
    /// Workers currently running an item.
    pub busy_workers: usize,
    /// Items waiting to start, across all owners.
    pub queued: usize,
    /// Owners with an item in flight.
    pub running: usize,
    /// Owners with at least one queued item.
    pub partitions: usize,
    /// Items that ran to completion.
    pub completed: u64,
    /// Items that panicked.
    pub panicked: u64,
}

/// Executes work items with per-owner FIFO ordering and mutual exclusion,
/// and cross-owner parallelism bounded by the worker pool.
///
/// Cloning is cheap and yields a handle to the same pool. The pool shuts
/// down when the last handle drops.
///
/// # Guarantees
/// - At most one item per [`OwnerId`] executes at any instant.
/// - Items of one owner start in submission order.
/// - Owners are scanned round-robin, so an owner with a long queue cannot
///   starve others once a worker frees up.
/// - Items are never dropped for capacity reasons; only submissions after
///   shutdown are discarded.
#[derive(Clone)]
pub struct FallbackScheduler {
    owner: Arc<Owner>,
}

impl fmt::Debug for FallbackScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FallbackScheduler")
            .field("config", &self.shared().config)
            .field("stats", &self.stats())
            .finish()
    }
}

impl FallbackScheduler {
    /// Build a scheduler and pre-start `config.min_workers` threads.
    pub fn new(config: SchedulerConfig) -> Result<Self, SchedulerError> {
        config.validate()?;
        let shared = Arc::new(Shared {
            handles: Mutex::new(Vec::with_capacity(config.max_workers)),
            config,
            partitions: Mutex::new(Partitions::default()),
            idle: Condvar::new(),
            wakeup: Wakeup::default(),
            epoch: AtomicU64::new(0),
            live: AtomicUsize::new(0),
            busy: AtomicUsize::new(0),
            spawned: AtomicUsize::new(0),
            completed: AtomicU64::new(0),
            panicked: AtomicU64::new(0),
            recycle: Mutex::new(()),
        });
        if let Err(err) = start_pool(&shared, 0) {
            shared.close();
            return Err(err);
        }
        debug!(
            min = shared.config.min_workers,
            max = shared.config.max_workers,
            "fallback scheduler started"
        );
        Ok(Self {
            owner: Arc::new(Owner { shared }),
        })
    }

    /// Build a scheduler sized from available parallelism.
    pub fn with_defaults() -> Result<Self, SchedulerError> {
        Self::new(SchedulerConfig::default())
    }

    fn shared(&self) -> &Arc<Shared> {
        &self.owner.shared
    }

    /// The configuration this pool was built with.
    pub fn config(&self) -> &SchedulerConfig {
        &self.shared().config
    }

    /// Returns `true` when called from one of any scheduler's worker threads.
    pub fn on_worker_thread() -> bool {
        ON_WORKER.with(Cell::get)
    }

    /// Queue `work` behind any earlier work for `owner`.
    ///
    /// Never blocks. Returns `false` (and drops `work`) if the scheduler is
    /// shut down.
    pub fn submit<F>(&self, owner: OwnerId, work: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = self.shared();
        let pushed = lock(&shared.partitions).push(owner, Box::new(work));
        match pushed {
            Ok(()) => {
                trace!(%owner, "fallback work item queued");
                shared.wakeup.release_one();
                self.maybe_grow();
                true
            }
            Err(discarded) => {
                drop(discarded);
                debug!(%owner, "scheduler shut down; work item discarded");
                false
            }
        }
    }

    /// Remove every queued, not yet started item of `owner`.
    ///
    /// An item already executing is unaffected. Returns how many items were
    /// removed.
    pub fn purge(&self, owner: OwnerId) -> usize {
        let removed = lock(&self.shared().partitions).purge(owner);
        let count = removed.len();
        drop(removed);
        if count > 0 {
            debug!(%owner, count, "purged queued fallback work");
        }
        count
    }

    /// Items of `owner` waiting to start.
    pub fn queued_for(&self, owner: OwnerId) -> usize {
        lock(&self.shared().partitions).queued_for(owner)
    }

    /// Whether `owner` has an item executing right now.
    pub fn is_executing(&self, owner: OwnerId) -> bool {
        lock(&self.shared().partitions).is_running(owner)
    }

    /// Items waiting to start, across all owners.
    pub fn pending_count(&self) -> usize {
        lock(&self.shared().partitions).queued()
    }

    /// Owners with an item in flight.
    pub fn running_count(&self) -> usize {
        lock(&self.shared().partitions).running()
    }

    /// Live worker threads.
    pub fn worker_count(&self) -> usize {
        self.shared().live.load(Ordering::Acquire)
    }

    /// Nothing queued and nothing running.
    pub fn is_idle(&self) -> bool {
        lock(&self.shared().partitions).is_idle()
    }

    /// Whether [`Self::shutdown`] has been called (or the last handle dropped).
    pub fn is_shutdown(&self) -> bool {
        self.shared().is_closed()
    }

    /// Snapshot of the pool counters.
    pub fn stats(&self) -> SchedulerStats {
        let shared = self.shared();
        let parts = lock(&shared.partitions);
        SchedulerStats {
            workers: shared.live.load(Ordering::Acquire),
            busy_workers: shared.busy.load(Ordering::Acquire),
            queued: parts.queued(),
            running: parts.running(),
            partitions: parts.partition_count(),
            completed: shared.completed.load(Ordering::Relaxed),
            panicked: shared.panicked.load(Ordering::Relaxed),
        }
    }

    /// Block until nothing is queued or running, or `timeout` elapses.
    ///
    /// Returns `true` if the scheduler went idle.
    pub fn wait_idle(&self, timeout: Duration) -> bool {
        self.shared().wait_idle(timeout)
    }

    /// Wait for the scheduler to go idle, retire every worker, and start a
    /// fresh pre-started pool.
    ///
    /// Safe to call repeatedly and from several threads: calls are
    /// serialized, and a call on an already idle scheduler just recycles the
    /// workers again. Work submitted while this runs is queued and picked up
    /// by the new pool.
    pub fn drain_and_recreate(&self, timeout: Duration) -> Result<(), SchedulerError> {
        if Self::on_worker_thread() {
            return Err(SchedulerError::CalledFromWorker);
        }
        let shared = self.shared();
        let deadline = Instant::now() + timeout;
        let _serial = lock(&shared.recycle);
        if shared.is_closed() {
            return Err(SchedulerError::ShutDown);
        }
        if !shared.wait_idle(deadline.saturating_duration_since(Instant::now())) {
            return Err(SchedulerError::DrainTimeout(timeout));
        }
        let epoch = shared.epoch.fetch_add(1, Ordering::AcqRel) + 1;
        shared
            .wakeup
            .release_all(shared.live.load(Ordering::Acquire).max(1));
        if !shared.join_workers(deadline) {
            return Err(SchedulerError::DrainTimeout(timeout));
        }
        start_pool(shared, epoch)?;
        debug!(epoch, "fallback worker pool recreated");
        Ok(())
    }

    /// Stop accepting work. Queued items still run; workers then exit.
    pub fn shutdown(&self) {
        self.shared().close();
    }

    /// Shut down and wait for every worker to exit.
    ///
    /// Returns `false` if workers were still running at `timeout`.
    pub fn shutdown_and_wait(&self, timeout: Duration) -> bool {
        let shared = self.shared();
        shared.close();
        shared.join_workers(Instant::now() + timeout)
    }

    /// Add a worker if every live worker is busy and the pool may grow.
    fn maybe_grow(&self) {
        let shared = self.shared();
        // A recycle in progress owns the pool size.
        let Ok(_recycling) = shared.recycle.try_lock() else {
            return;
        };
        let max = shared.config.max_workers;
        let busy = shared.busy.load(Ordering::Acquire);
        let reserved = shared
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                if live < max && busy >= live {
                    Some(live + 1)
                } else {
                    None
                }
            })
            .is_ok();
        if reserved {
            let epoch = shared.epoch.load(Ordering::Acquire);
            if let Err(err) = spawn_worker(shared, epoch) {
                warn!(%err, "could not grow fallback worker pool");
            }
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn prestarts_min_workers() {
        let sched = FallbackScheduler::new(SchedulerConfig::fixed(3)).unwrap();
        assert_eq!(sched.worker_count(), 3);
        assert!(sched.shutdown_and_wait(Duration::from_secs(5)));
        assert_eq!(sched.worker_count(), 0);
    }

    #[test]
    fn work_runs_on_named_worker_threads() {
        let sched = FallbackScheduler::new(
            SchedulerConfig::fixed(1).with_thread_name_prefix("unit-delivery"),
        )
        .unwrap();
        let (tx, rx) = mpsc::channel();
        assert!(sched.submit(OwnerId::allocate(), move || {
            let name = thread::current().name().map(str::to_owned);
            let _ = tx.send((name, FallbackScheduler::on_worker_thread()));
        }));
        let (name, on_worker) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(name.as_deref(), Some("unit-delivery-1"));
        assert!(on_worker);
        assert!(!FallbackScheduler::on_worker_thread());
    }

    #[test]
    fn grows_when_saturated_and_retires_when_idle() {
        let cfg = SchedulerConfig {
            min_workers: 1,
            max_workers: 3,
            keep_alive_ms: 50,
            ..SchedulerConfig::default()
        };
        let sched = FallbackScheduler::new(cfg).unwrap();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let release_rx = Arc::new(Mutex::new(release_rx));
        for _ in 0..3 {
            let rx = Arc::clone(&release_rx);
            assert!(sched.submit(OwnerId::allocate(), move || {
                let _ = rx.lock().unwrap().recv_timeout(Duration::from_secs(5));
            }));
            thread::sleep(Duration::from_millis(20));
        }
        assert!(sched.worker_count() > 1);
        assert!(sched.worker_count() <= 3);
        for _ in 0..3 {
            release_tx.send(()).unwrap();
        }
        assert!(sched.wait_idle(Duration::from_secs(5)));
        let deadline = Instant::now() + Duration::from_secs(5);
        while sched.worker_count() > 1 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(sched.worker_count(), 1);
    }

    #[test]
    fn drop_of_last_handle_shuts_down() {
        let sched = FallbackScheduler::new(SchedulerConfig::fixed(1)).unwrap();
        let shared = Arc::clone(sched.shared());
        drop(sched);
        assert!(shared.is_closed());
    }
}
