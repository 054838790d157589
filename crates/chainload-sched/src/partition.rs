// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Owner-partitioned queue state.
//!
//! This is the only shared mutable structure of the scheduler and is always
//! accessed under the scheduler's partition lock.
//!
//! # Invariants
//! - Every owner in `order` has a non-empty queue in `queues`, and vice versa.
//! - An owner in `running` has exactly one item executing on some worker.
//! - Empty queues are removed immediately.

use std::collections::hash_map::Entry;
use std::collections::VecDeque;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::OwnerId;

/// A unit of scheduled work.
pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

/// Result of asking the partition table for work.
pub(crate) enum Next {
    /// Run this job; its owner is now marked executing.
    Run(OwnerId, Job),
    /// Nothing is runnable right now.
    Empty,
    /// The scheduler is closed and nothing runnable remains.
    Closed,
}

#[derive(Default)]
pub(crate) struct Partitions {
    /// Owners with queued work, in round-robin order.
    order: VecDeque<OwnerId>,
    queues: FxHashMap<OwnerId, VecDeque<Job>>,
    running: FxHashSet<OwnerId>,
    closed: bool,
}

impl Partitions {
    /// Enqueue `job` behind any earlier work for `owner`.
    ///
    /// Returns the job back if the table is closed.
    pub(crate) fn push(&mut self, owner: OwnerId, job: Job) -> Result<(), Job> {
        if self.closed {
            return Err(job);
        }
        match self.queues.entry(owner) {
            Entry::Occupied(mut queue) => queue.get_mut().push_back(job),
            Entry::Vacant(slot) => {
                self.order.push_back(owner);
                slot.insert(VecDeque::from([job]));
            }
        }
        Ok(())
    }

    /// Take the head item of the first owner that is not executing.
    ///
    /// The chosen owner moves to the back of the round-robin order so every
    /// other owner with work gets scanned before it again.
    pub(crate) fn take_next(&mut self) -> Next {
        let Some(pos) = self
            .order
            .iter()
            .position(|owner| !self.running.contains(owner))
        else {
            return if self.closed && self.order.is_empty() {
                Next::Closed
            } else {
                Next::Empty
            };
        };
        let Some(owner) = self.order.remove(pos) else {
            return Next::Empty;
        };
        let Some(queue) = self.queues.get_mut(&owner) else {
            return Next::Empty;
        };
        let Some(job) = queue.pop_front() else {
            self.queues.remove(&owner);
            return Next::Empty;
        };
        if queue.is_empty() {
            self.queues.remove(&owner);
        } else {
            self.order.push_back(owner);
        }
        self.running.insert(owner);
        Next::Run(owner, job)
    }

    /// Mark `owner`'s in-flight item as finished.
    pub(crate) fn finish(&mut self, owner: OwnerId) {
        self.running.remove(&owner);
    }

    /// Remove every queued (not yet started) item of `owner`.
    ///
    /// The removed jobs are returned so the caller can drop them outside
    /// the lock.
    pub(crate) fn purge(&mut self, owner: OwnerId) -> VecDeque<Job> {
        let removed = self.queues.remove(&owner).unwrap_or_default();
        if !removed.is_empty() {
            self.order.retain(|o| *o != owner);
        }
        removed
    }

    pub(crate) fn close(&mut self) {
        self.closed = true;
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn queued_for(&self, owner: OwnerId) -> usize {
        self.queues.get(&owner).map_or(0, VecDeque::len)
    }

    pub(crate) fn is_running(&self, owner: OwnerId) -> bool {
        self.running.contains(&owner)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queues.values().map(VecDeque::len).sum()
    }

    pub(crate) fn running(&self) -> usize {
        self.running.len()
    }

    pub(crate) fn partition_count(&self) -> usize {
        self.queues.len()
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.queues.is_empty() && self.running.is_empty()
    }
}
