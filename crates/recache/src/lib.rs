//! # recache
//!
//! A background-refreshing, negative-result-memoizing key/value cache for
//! expensive, possibly failing lookups (resolving a path to a resource
//! handle, a name to an address, …).
//!
//! ## Semantics
//!
//! A [`BackgroundCache`] wraps a caller-supplied [`Resolver`] and serves
//! its results with the following guarantees:
//!
//! - **Request coalescing**: the first access to a key resolves
//!   synchronously, and every concurrent access to the same key awaits that
//!   one resolver invocation and receives the same result.
//! - **Stale-while-revalidate**: once an entry is older than
//!   [`refresh_interval`](CacheConfig::refresh_interval), accesses still
//!   return the cached result immediately while a single background refresh
//!   replaces the entry off the caller's critical path. Readers never wait
//!   on a refresh, and a `get` never observes an older result than one it
//!   has already seen for the same key.
//! - **Negative caching**: a failure of the declared error kind is memoized
//!   exactly like a value and replayed to subsequent callers, so a
//!   persistently failing lookup is retried once per refresh window rather
//!   than on every access.
//! - **Time-based eviction**: a periodic sweep drops entries older than
//!   [`expiration_age`](CacheConfig::expiration_age). An idle cache
//!   therefore empties itself; background refreshes only happen for
//!   recently used keys.
//!
//! There is no capacity bound and no persistence; eviction is purely
//! time-based.
//!
//! ## Errors
//!
//! Resolutions produce a [`CacheResult`], where the error splits into two
//! classes. [`CacheError::Resolve`] carries the caller-declared kind and is
//! cached; [`CacheError::Internal`] covers everything the resolver did not
//! declare (including panics) and is never cached: the synchronous path
//! propagates it and drops the placeholder so the next access retries,
//! while a background refresh logs it and keeps serving the previous
//! result.
//!
//! ## Time
//!
//! All timestamps and timers go through [`tokio::time`], so tests drive
//! refresh and expiration semantics on a paused clock with
//! `tokio::time::advance` instead of real delays.
//!
//! ```
//! use std::sync::Arc;
//!
//! use recache::{BackgroundCache, CacheConfig, CacheError, resolver_fn};
//!
//! #[derive(Debug, Clone, thiserror::Error)]
//! #[error("no such resource")]
//! struct NotFound;
//!
//! # async fn example() -> Result<(), CacheError<NotFound>> {
//! let cache = BackgroundCache::new("resources", CacheConfig::default()).unwrap();
//! cache.start();
//!
//! let resolver = resolver_fn(|path: String| async move {
//!     match path.strip_prefix("/static/") {
//!         Some(rest) => Ok(format!("handle:{rest}")),
//!         None => Err(CacheError::Resolve(NotFound)),
//!     }
//! });
//!
//! let handle = cache
//!     .get("/static/site.css".to_owned(), Arc::clone(&resolver))
//!     .await?;
//! assert_eq!(handle, "handle:site.css");
//!
//! cache.stop();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]

mod config;
mod error;
mod resolver;
mod scheduler;
mod store;

pub use config::CacheConfig;
pub use error::{CacheError, CacheResult};
pub use resolver::{Resolver, SharedResolver, resolver_fn};
pub use store::BackgroundCache;
