use std::sync::Arc;

use thiserror::Error;

/// The outcome of one resolution.
///
/// This is both what a [`Resolver`](crate::Resolver) returns and what
/// [`BackgroundCache::get`](crate::BackgroundCache::get) hands back to the
/// caller. `Ok` values and [`CacheError::Resolve`] failures are memoized
/// verbatim; [`CacheError::Internal`] failures never are.
pub type CacheResult<V, E> = Result<V, CacheError<E>>;

/// An error produced while resolving a cache entry.
///
/// The error kind `E` is declared by the caller as part of the cache's type
/// parameters. Only failures of that kind are captured into the cache and
/// replayed to subsequent callers, the "cache the miss" behavior that keeps
/// a persistently failing lookup from being retried on every access.
#[derive(Debug, Clone, Error)]
pub enum CacheError<E> {
    /// The resolver failed with its declared error kind.
    ///
    /// This failure is memoized like a successful value, until the entry
    /// refreshes or expires.
    #[error(transparent)]
    Resolve(E),

    /// The resolver failed in a way it did not declare.
    ///
    /// This variant is never stored in the cache. On a synchronous
    /// resolution it propagates to the triggering caller and the entry is
    /// discarded so the next access retries in full; on a background
    /// refresh it is logged and the previous result is left untouched.
    #[error("unexpected resolver failure: {0}")]
    Internal(Arc<anyhow::Error>),
}

impl<E> CacheError<E> {
    /// Wraps an undeclared failure.
    pub fn internal(err: impl Into<anyhow::Error>) -> Self {
        CacheError::Internal(Arc::new(err.into()))
    }

    /// Whether this failure is captured into the cache.
    pub fn is_memoized(&self) -> bool {
        matches!(self, CacheError::Resolve(_))
    }
}

impl<E> From<anyhow::Error> for CacheError<E> {
    fn from(err: anyhow::Error) -> Self {
        CacheError::Internal(Arc::new(err))
    }
}
