// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Demo chain pieces: a streaming upstream loader and a reprocessing stage.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::Duration;

use chainload_core::{
    Attempt, ChainError, ChainSource, DeliveryKind, ListenerId, LoadListener, LoadResult, Loader,
    LoaderCore, LoaderId,
};
use tracing::{trace, warn};

struct FeedInner {
    core: LoaderCore<LoadResult<u64>>,
    base: u64,
    partials: u64,
    gap: Duration,
    generation: AtomicU64,
}

/// Upstream loader streaming `partials` partial values and then a complete
/// one (`base`, `base + 1`, ...) from a background thread.
#[derive(Clone)]
pub struct Feed {
    inner: Arc<FeedInner>,
}

impl Feed {
    /// Feed starting at `base`, pausing `gap` between deliveries.
    pub fn new(base: u64, partials: u64, gap: Duration) -> Self {
        Self {
            inner: Arc::new(FeedInner {
                core: LoaderCore::new(),
                base,
                partials,
                gap,
                generation: AtomicU64::new(0),
            }),
        }
    }

    fn spawn_cycle(&self) {
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let inner = Arc::clone(&self.inner);
        let spawned = thread::Builder::new()
            .name("feed".into())
            .spawn(move || {
                for step in 0..=inner.partials {
                    if step > 0 {
                        thread::sleep(inner.gap);
                    }
                    if inner.generation.load(Ordering::SeqCst) != generation {
                        trace!(loader = %inner.core.id(), "feed cycle superseded");
                        return;
                    }
                    let value = inner.base + step;
                    let result = if step == inner.partials {
                        LoadResult::success(value)
                    } else {
                        LoadResult::partial(value)
                    };
                    inner.core.deliver(&result);
                }
            });
        if let Err(err) = spawned {
            warn!(loader = %self.inner.core.id(), %err, "feed thread failed to start");
            self.inner
                .core
                .deliver(&LoadResult::failure(ChainError::from_source(err)));
        }
    }
}

impl Loader<LoadResult<u64>> for Feed {
    fn id(&self) -> LoaderId {
        self.inner.core.id()
    }

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

    fn is_started(&self) -> bool {
        self.inner.core.is_started()
    }

    fn is_reset(&self) -> bool {
        self.inner.core.is_reset()
    }

    fn is_abandoned(&self) -> bool {
        self.inner.core.is_abandoned()
    }

    fn register_listener(&self, listener: Arc<dyn LoadListener<LoadResult<u64>>>) -> ListenerId {
        self.inner.core.register_listener(listener)
    }

    fn unregister_listener(&self, id: ListenerId) -> bool {
        self.inner.core.unregister_listener(id)
    }
}

/// Always defers; multiplies every delegate value by `factor` after
/// simulating `work`.
pub struct Stage {
    factor: u64,
    work: Duration,
    seen: Mutex<Vec<u64>>,
}

impl Stage {
    /// Stage multiplying by `factor`.
    pub fn new(factor: u64, work: Duration) -> Self {
        Self {
            factor,
            work,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Delegate values in the order they were reprocessed.
    pub fn seen(&self) -> Vec<u64> {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl ChainSource for Stage {
    type Output = u64;

    fn attempt(&self) -> Result<Attempt<u64>, ChainError> {
        Ok(Attempt::Defer)
    }

    fn reprocess(&self, value: u64, kind: DeliveryKind) -> Result<u64, ChainError> {
        if !self.work.is_zero() {
            thread::sleep(self.work);
        }
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(value);
        trace!(value, %kind, "stage reprocessed");
        value
            .checked_mul(self.factor)
            .ok_or_else(|| ChainError::failed(format!("{value} * {} overflows", self.factor)))
    }
}

/// xorshift64* jitter source.
pub struct Jitter(u64);

impl Jitter {
    /// Seeded jitter; zero is replaced with one.
    pub fn new(seed: u64) -> Self {
        Self(seed.max(1))
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.0;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.0 = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Roughly `around`, give or take half.
    pub fn around(&mut self, around: u64) -> u64 {
        if around < 2 {
            return around;
        }
        around / 2 + self.next_u64() % around
    }
}
