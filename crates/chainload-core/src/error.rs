// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Failure taxonomy for chain loading.

use std::error::Error as StdError;
use std::sync::Arc;

use thiserror::Error;

/// Shared, cloneable error source.
pub type SharedSource = Arc<dyn StdError + Send + Sync + 'static>;

/// Errors produced while loading through a chain.
///
/// `Failed` travels as data inside a [`crate::LoadResult`]; `Cancelled` and
/// `AffinityUnavailable` are only ever returned to synchronous bridge
/// callers. The type is `Clone` so a cached failure can be redelivered.
#[derive(Debug, Clone, Error)]
pub enum ChainError {
    /// The loader was reset or abandoned before it produced a result.
    #[error("load cancelled: loader was reset or abandoned")]
    Cancelled,
    /// A domain failure raised by a loader.
    #[error("{message}")]
    Failed {
        /// Human readable description.
        message: String,
        /// Underlying cause, if any.
        #[source]
        source: Option<SharedSource>,
    },
    /// The affinity context is gone, so a lifecycle call could not be
    /// marshalled onto it.
    #[error("affinity context unavailable")]
    AffinityUnavailable,
}

impl ChainError {
    /// A domain failure with only a message.
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed {
            message: message.into(),
            source: None,
        }
    }

    /// A domain failure wrapping `err`; the message is `err`'s display text.
    pub fn from_source<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::Failed {
            message: err.to_string(),
            source: Some(Arc::new(err)),
        }
    }

    /// Whether this is [`ChainError::Cancelled`].
    pub const fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn from_source_keeps_message_and_cause() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "no such record");
        let err = ChainError::from_source(io);
        assert_eq!(err.to_string(), "no such record");
        assert!(err.source().is_some());
        let copy = err.clone();
        assert_eq!(copy.source().unwrap().to_string(), "no such record");
        assert!(!copy.is_cancelled());
    }
}
