// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Tri-state delivery model.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::ChainError;

/// What a delivery means for the consumer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryKind {
    /// The load failed; no value.
    Failure,
    /// A usable value, with further deliveries expected.
    Partial,
    /// The final value of this loading cycle.
    Complete,
}

impl DeliveryKind {
    /// `true` for kinds that end a loading cycle (everything but `Partial`).
    pub const fn ends_cycle(self) -> bool {
        !matches!(self, Self::Partial)
    }
}

impl fmt::Display for DeliveryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Failure => "failure",
            Self::Partial => "partial",
            Self::Complete => "complete",
        })
    }
}

/// One delivery from a loader: a value (partial or complete) or a failure.
///
/// The variant is the discriminant, so a result can never hold both a value
/// and a failure, nor neither.
#[derive(Debug, Clone)]
pub enum LoadResult<T> {
    /// Final value for this cycle.
    Complete(T),
    /// Intermediate value; more deliveries will follow.
    Partial(T),
    /// The load failed.
    Failure(ChainError),
}

impl<T> LoadResult<T> {
    /// A complete result.
    pub const fn success(value: T) -> Self {
        Self::Complete(value)
    }

    /// A partial result.
    pub const fn partial(value: T) -> Self {
        Self::Partial(value)
    }

    /// A failed result.
    pub fn failure(err: impl Into<ChainError>) -> Self {
        Self::Failure(err.into())
    }

    /// The delivery kind.
    pub const fn kind(&self) -> DeliveryKind {
        match self {
            Self::Complete(_) => DeliveryKind::Complete,
            Self::Partial(_) => DeliveryKind::Partial,
            Self::Failure(_) => DeliveryKind::Failure,
        }
    }

    /// `true` for [`LoadResult::Complete`].
    pub const fn is_complete(&self) -> bool {
        matches!(self, Self::Complete(_))
    }

    /// `true` for [`LoadResult::Partial`].
    pub const fn is_partial(&self) -> bool {
        matches!(self, Self::Partial(_))
    }

    /// `true` for [`LoadResult::Failure`].
    pub const fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Borrow the value, or the stored failure.
    pub const fn get(&self) -> Result<&T, &ChainError> {
        match self {
            Self::Complete(v) | Self::Partial(v) => Ok(v),
            Self::Failure(e) => Err(e),
        }
    }

    /// The value, if this is not a failure.
    pub const fn value(&self) -> Option<&T> {
        match self {
            Self::Complete(v) | Self::Partial(v) => Some(v),
            Self::Failure(_) => None,
        }
    }

    /// The failure, if any.
    pub const fn error(&self) -> Option<&ChainError> {
        match self {
            Self::Failure(e) => Some(e),
            Self::Complete(_) | Self::Partial(_) => None,
        }
    }

    /// Consume into a plain `Result`, dropping the partial/complete
    /// distinction.
    pub fn into_result(self) -> Result<T, ChainError> {
        match self {
            Self::Complete(v) | Self::Partial(v) => Ok(v),
            Self::Failure(e) => Err(e),
        }
    }

    /// Map the value, keeping the kind.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> LoadResult<U> {
        match self {
            Self::Complete(v) => LoadResult::Complete(f(v)),
            Self::Partial(v) => LoadResult::Partial(f(v)),
            Self::Failure(e) => LoadResult::Failure(e),
        }
    }

    /// Map the value with a fallible function that also sees the kind.
    ///
    /// Failures pass through without calling `f`; an error from `f` turns
    /// the result into a failure.
    pub fn try_map<U>(
        self,
        f: impl FnOnce(T, DeliveryKind) -> Result<U, ChainError>,
    ) -> LoadResult<U> {
        let kind = self.kind();
        match self {
            Self::Complete(v) | Self::Partial(v) => match f(v, kind) {
                Ok(u) if kind == DeliveryKind::Partial => LoadResult::Partial(u),
                Ok(u) => LoadResult::Complete(u),
                Err(e) => LoadResult::Failure(e),
            },
            Self::Failure(e) => LoadResult::Failure(e),
        }
    }
}

impl<T> From<Result<T, ChainError>> for LoadResult<T> {
    fn from(result: Result<T, ChainError>) -> Self {
        match result {
            Ok(v) => Self::Complete(v),
            Err(e) => Self::Failure(e),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn failure_get_returns_the_error() {
        let r: LoadResult<u32> = LoadResult::failure(ChainError::failed("offline"));
        assert_eq!(r.kind(), DeliveryKind::Failure);
        assert_eq!(r.get().unwrap_err().to_string(), "offline");
        assert!(r.value().is_none());
    }

    #[test]
    fn try_map_keeps_partial_and_skips_failures() {
        let partial = LoadResult::partial(2).try_map(|v, kind| {
            assert_eq!(kind, DeliveryKind::Partial);
            Ok(v * 10)
        });
        assert!(partial.is_partial());
        assert_eq!(partial.get().copied().unwrap(), 20);

        let failed: LoadResult<i32> = LoadResult::failure(ChainError::failed("x"));
        let mut called = false;
        let out = failed.try_map(|v, _| {
            called = true;
            Ok(v)
        });
        assert!(out.is_failure());
        assert!(!called);

        let rejected = LoadResult::success(1).try_map(|_, _| Err::<i32, _>(ChainError::failed("bad")));
        assert!(rejected.is_failure());
    }

    #[test]
    fn only_partial_keeps_the_cycle_open() {
        assert!(DeliveryKind::Complete.ends_cycle());
        assert!(DeliveryKind::Failure.ends_cycle());
        assert!(!DeliveryKind::Partial.ends_cycle());
        assert_eq!(DeliveryKind::Partial.to_string(), "partial");
    }

    proptest! {
        #[test]
        fn values_come_back_with_their_kind(v in any::<i64>(), partial in any::<bool>()) {
            let r = if partial { LoadResult::partial(v) } else { LoadResult::success(v) };
            prop_assert_eq!(r.get().copied().unwrap(), v);
            prop_assert_eq!(r.is_partial(), partial);
            prop_assert_eq!(r.kind().ends_cycle(), !partial);
            prop_assert_eq!(r.into_result().unwrap(), v);
        }
    }
}
