// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Counting affinity context.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chainload_core::{Affinity, AffinityJob, AffinityThread, ChainError};

/// Thread name of every [`TestAffinity`].
pub const TEST_AFFINITY_THREAD: &str = "test-affinity";

/// A dedicated affinity thread that counts posted jobs.
#[derive(Debug)]
pub struct TestAffinity {
    thread: AffinityThread,
    posted: AtomicUsize,
}

impl TestAffinity {
    /// Start the context thread.
    pub fn spawn() -> std::io::Result<Arc<Self>> {
        Ok(Arc::new(Self {
            thread: AffinityThread::spawn(TEST_AFFINITY_THREAD)?,
            posted: AtomicUsize::new(0),
        }))
    }

    /// Jobs posted so far (inline runs on the context thread not counted).
    pub fn posted(&self) -> usize {
        self.posted.load(Ordering::SeqCst)
    }

    /// Stop the context thread; later posts fail.
    pub fn shutdown(&self) {
        self.thread.shutdown();
    }
}

impl Affinity for TestAffinity {
    fn is_current(&self) -> bool {
        self.thread.is_current()
    }

    fn post(&self, job: AffinityJob) -> Result<(), ChainError> {
        self.posted.fetch_add(1, Ordering::SeqCst);
        self.thread.post(job)
    }
}
