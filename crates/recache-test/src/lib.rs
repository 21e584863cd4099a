//! Helpers for testing background caches.
//!
//! When writing tests, keep the following points in mind:
//!
//!  - In every test, call [`setup`]. This will set up the logger so that
//!    all console output is captured by the test runner.
//!
//!  - Run time-sensitive tests with `#[tokio::test(start_paused = true)]`
//!    and drive the clock with `tokio::time::advance`. A short
//!    `tokio::time::sleep` after advancing gives the scheduler task and
//!    spawned refreshes a chance to land before asserting on them.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::FutureExt;
use futures::future::BoxFuture;
use tracing_subscriber::filter::EnvFilter;
use tracing_subscriber::fmt::fmt;

use recache::{CacheError, CacheResult, Resolver};

/// Setup the test environment.
///
///  - Initializes logs: the logger only captures logs from the `recache`
///    crate and mutes everything else.
pub fn setup() {
    fmt()
        .with_env_filter(EnvFilter::new("recache=trace"))
        .with_target(false)
        .pretty()
        .with_test_writer()
        .try_init()
        .ok();
}

/// The memoizable failure kind used throughout the tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("not found")]
pub struct NotFound;

/// A resolver that yields `"<prefix><n>"` for its `n`-th invocation and
/// counts how often it ran.
pub struct CountingResolver {
    prefix: &'static str,
    calls: AtomicUsize,
}

impl CountingResolver {
    pub fn new(prefix: &'static str) -> Arc<Self> {
        Arc::new(Self {
            prefix,
            calls: AtomicUsize::new(0),
        })
    }

    /// The number of resolver invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolver<String, String, NotFound> for CountingResolver {
    fn resolve(&self, _key: String) -> BoxFuture<'_, CacheResult<String, NotFound>> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let value = format!("{}{call}", self.prefix);
        async move { Ok(value) }.boxed()
    }
}

/// A resolver that always fails with [`NotFound`] and counts invocations.
pub struct FailingResolver {
    calls: AtomicUsize,
}

impl FailingResolver {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            calls: AtomicUsize::new(0),
        })
    }

    /// The number of resolver invocations so far.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Resolver<String, String, NotFound> for FailingResolver {
    fn resolve(&self, _key: String) -> BoxFuture<'_, CacheResult<String, NotFound>> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        async move { Err(CacheError::Resolve(NotFound)) }.boxed()
    }
}
