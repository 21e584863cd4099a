use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;

use crate::error::CacheResult;

/// Performs the real, possibly slow and possibly failing lookup behind a
/// [`BackgroundCache`](crate::BackgroundCache).
///
/// A resolver is invoked both synchronously (for the first access to a key)
/// and from background refresh tasks, so it must be safe to call from any
/// task. `Ok` values and [`CacheError::Resolve`](crate::CacheError::Resolve)
/// failures it returns are memoized; anything else propagates uncached.
pub trait Resolver<K, V, E>: Send + Sync {
    /// Resolves `key` to a fresh result.
    fn resolve(&self, key: K) -> BoxFuture<'_, CacheResult<V, E>>;
}

/// A reference-counted resolver, as handed off to background refreshes.
pub type SharedResolver<K, V, E> = Arc<dyn Resolver<K, V, E>>;

/// Wraps a closure as a [`SharedResolver`].
///
/// The closure receives the key by value and returns the resolution future:
///
/// ```
/// use recache::{CacheError, resolver_fn};
///
/// #[derive(Debug, Clone)]
/// struct NoSuchPath;
///
/// let resolver = resolver_fn(|path: String| async move {
///     match path.strip_prefix("/static/") {
///         Some(rest) => Ok(format!("handle:{rest}")),
///         None => Err(CacheError::Resolve(NoSuchPath)),
///     }
/// });
/// # let _: recache::SharedResolver<String, String, NoSuchPath> = resolver;
/// ```
pub fn resolver_fn<K, V, E, F, Fut>(f: F) -> SharedResolver<K, V, E>
where
    K: Send + 'static,
    V: Send + 'static,
    E: Send + 'static,
    F: Fn(K) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = CacheResult<V, E>> + Send + 'static,
{
    struct FnResolver<F>(F);

    impl<K, V, E, F, Fut> Resolver<K, V, E> for FnResolver<F>
    where
        F: Fn(K) -> Fut + Send + Sync,
        Fut: Future<Output = CacheResult<V, E>> + Send + 'static,
    {
        fn resolve(&self, key: K) -> BoxFuture<'_, CacheResult<V, E>> {
            Box::pin((self.0)(key))
        }
    }

    Arc::new(FnResolver(f))
}
