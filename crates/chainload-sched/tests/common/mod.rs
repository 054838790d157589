// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
#![allow(dead_code, clippy::unwrap_used, clippy::print_stderr)]

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chainload_sched::{FallbackScheduler, SchedulerConfig};

/// Tiny deterministic RNG (xorshift64*) so tests don't need `rand`.
#[derive(Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    /// Creates a new PRNG; a zero seed is replaced with 1.
    pub fn new(seed: u64) -> Self {
        Self { state: seed.max(1) }
    }

    /// Next pseudo-random `u64`.
    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    /// Pseudo-random value in `[lo, hi)`.
    pub fn gen_range(&mut self, lo: u64, hi: u64) -> u64 {
        if hi <= lo + 1 {
            return lo;
        }
        lo + self.next_u64() % (hi - lo)
    }
}

/// Seed from `CHAINLOAD_TEST_SEED`, else a fixed default. Printed so a
/// failing run can be replayed.
pub fn test_seed() -> u64 {
    let seed = std::env::var("CHAINLOAD_TEST_SEED")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(0x5EED_CAFE);
    eprintln!("CHAINLOAD_TEST_SEED={seed}");
    seed
}

/// Shared append-only log of `(line, job)` pairs.
pub type Journal = Arc<Mutex<Vec<(usize, usize)>>>;

pub fn journal() -> Journal {
    Arc::new(Mutex::new(Vec::new()))
}

pub fn scheduler(workers: usize) -> FallbackScheduler {
    FallbackScheduler::new(SchedulerConfig::fixed(workers).with_thread_name_prefix("test-delivery"))
        .unwrap()
}

pub const SETTLE: Duration = Duration::from_secs(10);
