// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Partition keys.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_OWNER: AtomicU64 = AtomicU64::new(1);

/// Identity used to partition scheduled work.
///
/// Work items sharing an `OwnerId` run one at a time, in submission order.
/// Items with different owners may run in parallel.
///
/// # Invariants
/// - [`OwnerId::allocate`] never returns the same value twice in a process
///   and never returns zero.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd)]
pub struct OwnerId(u64);

impl OwnerId {
    /// Allocates a fresh, process-unique owner id.
    pub fn allocate() -> Self {
        Self(NEXT_OWNER.fetch_add(1, Ordering::Relaxed))
    }

    /// Constructs an `OwnerId` from a raw value (tests and foreign keys).
    #[must_use]
    pub const fn from_raw(value: u64) -> Self {
        Self(value)
    }

    /// Returns the underlying raw value.
    #[must_use]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "owner#{}", self.0)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn allocated_ids_are_unique_and_nonzero() {
        let a = OwnerId::allocate();
        let b = OwnerId::allocate();
        assert_ne!(a, b);
        assert_ne!(a.value(), 0);
        assert_eq!(OwnerId::from_raw(a.value()), a);
    }
}
