use std::collections::HashMap;
use std::collections::hash_map::Entry as MapEntry;
use std::fmt;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicIsize, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult};
use crate::resolver::{Resolver, SharedResolver};
use crate::scheduler::{self, RefreshJob};

/// The stored outcome of the last completed resolution.
struct Snapshot<V, E> {
    result: Result<V, E>,
    resolved_at: Instant,
}

/// A fully resolved cache entry.
pub(crate) struct CacheEntry<V, E> {
    /// Result and resolution time, swapped together so readers never see
    /// one without the other.
    snapshot: Mutex<Snapshot<V, E>>,
    /// True while a background refresh for this entry is in flight.
    refreshing: AtomicBool,
    /// Set when the entry is removed by `invalidate`, `put` or `stop`; a
    /// refresh landing afterwards must not resurrect it.
    discarded: AtomicBool,
}

impl<V, E> CacheEntry<V, E> {
    fn new(result: Result<V, E>, resolved_at: Instant) -> Self {
        Self {
            snapshot: Mutex::new(Snapshot {
                result,
                resolved_at,
            }),
            refreshing: AtomicBool::new(false),
            discarded: AtomicBool::new(false),
        }
    }

    fn resolved_at(&self) -> Instant {
        self.snapshot.lock().unwrap().resolved_at
    }

    fn install(&self, result: Result<V, E>, resolved_at: Instant) {
        let mut snapshot = self.snapshot.lock().unwrap();
        *snapshot = Snapshot {
            result,
            resolved_at,
        };
    }

    /// Claims the single refresh slot for this entry.
    fn try_begin_refresh(&self) -> bool {
        self.refreshing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn end_refresh(&self) {
        self.refreshing.store(false, Ordering::SeqCst);
    }

    fn mark_discarded(&self) {
        self.discarded.store(true, Ordering::SeqCst);
    }

    fn is_discarded(&self) -> bool {
        self.discarded.load(Ordering::SeqCst)
    }
}

impl<V, E> CacheEntry<V, E>
where
    V: Clone,
    E: Clone,
{
    fn read(&self) -> (Result<V, E>, Instant) {
        let snapshot = self.snapshot.lock().unwrap();
        (snapshot.result.clone(), snapshot.resolved_at)
    }
}

type ResolveShared<V, E> = Shared<BoxFuture<'static, CacheResult<V, E>>>;

/// One slot in the entry map.
enum Slot<V, E> {
    /// Placeholder for a first resolution that has not landed yet. Every
    /// caller asking for the key in the meantime awaits the same shared
    /// future, so the resolver runs exactly once.
    FirstFlight {
        generation: u64,
        future: ResolveShared<V, E>,
    },
    Resolved(Arc<CacheEntry<V, E>>),
}

enum Lifecycle<K, V, E> {
    Created {
        refresh_rx: mpsc::UnboundedReceiver<RefreshJob<K, V, E>>,
    },
    Running {
        scheduler: JoinHandle<()>,
    },
    Stopped,
}

pub(crate) struct CacheInner<K, V, E> {
    name: String,
    config: CacheConfig,
    slots: Mutex<HashMap<K, Slot<V, E>>>,
    refresh_tx: mpsc::UnboundedSender<RefreshJob<K, V, E>>,
    lifecycle: Mutex<Lifecycle<K, V, E>>,
    /// Distinguishes first-flight placeholders across invalidations, the
    /// moral equivalent of Java's `this != map.get(key)` identity check.
    generations: AtomicU64,
    /// Countdown budget for concurrently running background refreshes.
    refresh_budget: AtomicIsize,
}

/// A key/value cache over an expensive, possibly failing lookup, refreshed
/// in the background.
///
/// See the [crate docs](crate) for the full semantics. In short: the first
/// access to a key resolves synchronously (coalesced across concurrent
/// callers), later accesses are served from the cache, and entries older
/// than [`refresh_interval`](CacheConfig::refresh_interval) are served
/// stale while a deduplicated background refresh replaces them. Entries
/// untouched past [`expiration_age`](CacheConfig::expiration_age) are
/// swept out entirely.
pub struct BackgroundCache<K, V, E> {
    inner: Arc<CacheInner<K, V, E>>,
}

impl<K, V, E> fmt::Debug for BackgroundCache<K, V, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self
            .inner
            .slots
            .try_lock()
            .map(|slots| slots.len())
            .unwrap_or_default();
        f.debug_struct("BackgroundCache")
            .field("name", &self.inner.name)
            .field("entries", &entries)
            .finish()
    }
}

impl<K, V, E> BackgroundCache<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Creates a new cache in the `Created` state.
    ///
    /// Nothing refreshes or expires until [`start`](Self::start) is called;
    /// `get` works regardless.
    pub fn new(name: impl Into<String>, config: CacheConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let (refresh_tx, refresh_rx) = mpsc::unbounded_channel();
        Ok(Self {
            inner: Arc::new(CacheInner {
                name: name.into(),
                refresh_budget: AtomicIsize::new(config.max_concurrent_refreshes),
                config,
                slots: Mutex::new(HashMap::new()),
                refresh_tx,
                lifecycle: Mutex::new(Lifecycle::Created { refresh_rx }),
                generations: AtomicU64::new(0),
            }),
        })
    }

    /// Starts the refresh scheduler. Must be called from within a tokio
    /// runtime. Calling it again, or after [`stop`](Self::stop), is a no-op.
    pub fn start(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        match std::mem::replace(&mut *lifecycle, Lifecycle::Stopped) {
            Lifecycle::Created { refresh_rx } => {
                tracing::debug!(cache = %self.inner.name, "starting refresh scheduler");
                let scheduler = tokio::spawn(scheduler::run(Arc::clone(&self.inner), refresh_rx));
                *lifecycle = Lifecycle::Running { scheduler };
            }
            other => *lifecycle = other,
        }
    }

    /// Stops the refresh scheduler and drops all entries. Idempotent.
    ///
    /// In-flight synchronous resolutions still complete for their callers
    /// but are not re-inserted, and results of in-flight background
    /// refreshes are discarded. Afterwards `get` still resolves and serves,
    /// but nothing refreshes or expires anymore; a stopped cache is meant
    /// to be done.
    pub fn stop(&self) {
        let mut lifecycle = self.inner.lifecycle.lock().unwrap();
        if let Lifecycle::Running { scheduler } =
            std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
        {
            tracing::debug!(cache = %self.inner.name, "stopping refresh scheduler");
            scheduler.abort();
        }
        drop(lifecycle);
        self.inner.clear();
    }

    /// Gets the result for `key`, resolving it synchronously if absent.
    ///
    /// A fresh entry is returned as-is. A stale one (older than
    /// `refresh_interval`) is also returned immediately, and `resolver` is
    /// handed to the scheduler for a background refresh unless one is
    /// already in flight. Callers never wait on a refresh; only the very
    /// first resolution of a key blocks, and it blocks every concurrent
    /// caller on the same single resolver invocation.
    pub async fn get(&self, key: K, resolver: SharedResolver<K, V, E>) -> CacheResult<V, E> {
        // What to do once the map lock is released.
        enum Lookup<V, E> {
            Hit(Arc<CacheEntry<V, E>>),
            Join(ResolveShared<V, E>),
        }

        let lookup = {
            let mut slots = self.inner.slots.lock().unwrap();
            match slots.entry(key.clone()) {
                MapEntry::Occupied(slot) => match slot.get() {
                    Slot::Resolved(entry) => Lookup::Hit(Arc::clone(entry)),
                    Slot::FirstFlight { future, .. } => Lookup::Join(future.clone()),
                },
                MapEntry::Vacant(vacant) => {
                    let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                    let future = first_resolution(
                        Arc::clone(&self.inner),
                        key.clone(),
                        generation,
                        Arc::clone(&resolver),
                    )
                    .boxed()
                    .shared();
                    vacant.insert(Slot::FirstFlight {
                        generation,
                        future: future.clone(),
                    });
                    Lookup::Join(future)
                }
            }
        };

        match lookup {
            Lookup::Hit(entry) => {
                let (result, resolved_at) = entry.read();
                let age = Instant::now().saturating_duration_since(resolved_at);
                if age >= self.inner.config.refresh_interval {
                    self.inner.request_refresh(key, entry, resolver);
                }
                result.map_err(CacheError::Resolve)
            }
            Lookup::Join(future) => future.await,
        }
    }

    /// Resolves `key` right now and replaces whatever is cached under it.
    ///
    /// Unlike [`get`](Self::get) this never consults the cached state. An
    /// undeclared resolver failure propagates and leaves the cache
    /// untouched.
    pub async fn put(&self, key: K, resolver: SharedResolver<K, V, E>) -> CacheResult<V, E> {
        let result = run_resolver(resolver.as_ref(), key.clone()).await;
        let resolved_at = Instant::now();
        let stored = match &result {
            Ok(value) => Ok(value.clone()),
            Err(CacheError::Resolve(error)) => Err(error.clone()),
            Err(CacheError::Internal(_)) => return result,
        };

        let entry = Arc::new(CacheEntry::new(stored, resolved_at));
        let mut slots = self.inner.slots.lock().unwrap();
        if let Some(Slot::Resolved(previous)) = slots.insert(key, Slot::Resolved(entry)) {
            previous.mark_discarded();
        }
        result
    }

    /// Returns the cached result for `key` without resolving anything.
    ///
    /// `None` when the key is absent or its first resolution has not landed
    /// yet. Does not mark the entry for refresh.
    pub fn cached(&self, key: &K) -> Option<CacheResult<V, E>> {
        let slots = self.inner.slots.lock().unwrap();
        match slots.get(key) {
            Some(Slot::Resolved(entry)) => {
                let (result, _) = entry.read();
                Some(result.map_err(CacheError::Resolve))
            }
            _ => None,
        }
    }

    /// Removes the entry for `key`, if any; the next `get` resolves from
    /// scratch.
    pub fn invalidate(&self, key: &K) {
        let mut slots = self.inner.slots.lock().unwrap();
        if let Some(Slot::Resolved(entry)) = slots.remove(key) {
            entry.mark_discarded();
        }
    }

    /// The number of entries currently held, in-flight placeholders
    /// included.
    pub fn len(&self) -> usize {
        self.inner.slots.lock().unwrap().len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The diagnostic name this cache was created with.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The configuration this cache was created with.
    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }
}

impl<K, V, E> Drop for BackgroundCache<K, V, E> {
    fn drop(&mut self) {
        // Same contract as an explicit `stop`: no orphaned recurring work.
        if let Ok(mut lifecycle) = self.inner.lifecycle.lock() {
            if let Lifecycle::Running { scheduler } =
                std::mem::replace(&mut *lifecycle, Lifecycle::Stopped)
            {
                scheduler.abort();
            }
        }
    }
}

impl<K, V, E> CacheInner<K, V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub(crate) fn refresh_budget(&self) -> &AtomicIsize {
        &self.refresh_budget
    }

    fn is_running(&self) -> bool {
        matches!(*self.lifecycle.lock().unwrap(), Lifecycle::Running { .. })
    }

    /// Marks `entry` as refreshing and hands the job to the scheduler.
    ///
    /// The compare-and-swap on the refresh flag is what guarantees a single
    /// in-flight resolver invocation per key.
    fn request_refresh(&self, key: K, entry: Arc<CacheEntry<V, E>>, resolver: SharedResolver<K, V, E>) {
        if !self.is_running() {
            return;
        }
        if !entry.try_begin_refresh() {
            return;
        }
        tracing::trace!(cache = %self.name, key = ?key, "scheduling background refresh");
        let job = RefreshJob {
            key,
            entry: Arc::clone(&entry),
            resolver,
        };
        if self.refresh_tx.send(job).is_err() {
            // `stop` raced the handoff; leave the entry as it was.
            entry.end_refresh();
        }
    }

    /// Installs the outcome of a background refresh.
    ///
    /// An undeclared failure keeps the previous result: better a stale
    /// value than none over a transient, unmemoizable error.
    pub(crate) fn land_refresh(
        &self,
        key: K,
        entry: &Arc<CacheEntry<V, E>>,
        result: CacheResult<V, E>,
    ) {
        let resolved_at = Instant::now();
        let stored = match result {
            Ok(value) => Ok(value),
            Err(CacheError::Resolve(error)) => Err(error),
            Err(CacheError::Internal(error)) => {
                tracing::warn!(
                    cache = %self.name,
                    key = ?key,
                    error = %error,
                    "background refresh failed, keeping cached result",
                );
                return;
            }
        };

        let mut slots = self.slots.lock().unwrap();
        if entry.is_discarded() {
            return;
        }
        let ours = matches!(
            slots.get(&key),
            Some(Slot::Resolved(current)) if Arc::ptr_eq(current, entry)
        );
        if ours {
            entry.install(stored, resolved_at);
        } else if !slots.contains_key(&key) {
            // Swept mid-refresh; the freshly resolved result starts a new
            // entry.
            let entry = Arc::new(CacheEntry::new(stored, resolved_at));
            slots.insert(key, Slot::Resolved(entry));
        }
        // Otherwise the entry was replaced while we were resolving; the
        // newer one wins.
    }

    /// Removes every entry past its expiration age.
    ///
    /// Entries with a refresh in flight are removed too; the refresh lands
    /// as a brand-new entry.
    pub(crate) fn sweep(&self) {
        let now = Instant::now();
        let mut slots = self.slots.lock().unwrap();
        let before = slots.len();
        slots.retain(|_, slot| match slot {
            Slot::Resolved(entry) => {
                now.saturating_duration_since(entry.resolved_at()) <= self.config.expiration_age
            }
            // A first resolution that has not landed yet has no age to
            // judge.
            Slot::FirstFlight { .. } => true,
        });
        let expired = before - slots.len();
        if expired > 0 {
            tracing::debug!(
                cache = %self.name,
                expired,
                remaining = slots.len(),
                "expired cache entries",
            );
        }
    }

    fn clear(&self) {
        let mut slots = self.slots.lock().unwrap();
        for slot in slots.values() {
            if let Slot::Resolved(entry) = slot {
                entry.mark_discarded();
            }
        }
        slots.clear();
    }
}

/// Drives the first resolution for a key and installs the outcome.
///
/// This future sits in the map as a [`Slot::FirstFlight`] placeholder and
/// is shared by every caller that asks for the key before it lands.
async fn first_resolution<K, V, E>(
    inner: Arc<CacheInner<K, V, E>>,
    key: K,
    generation: u64,
    resolver: SharedResolver<K, V, E>,
) -> CacheResult<V, E>
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let result = run_resolver(resolver.as_ref(), key.clone()).await;
    let resolved_at = Instant::now();

    let mut slots = inner.slots.lock().unwrap();
    let ours = matches!(
        slots.get(&key),
        Some(Slot::FirstFlight { generation: current, .. }) if *current == generation
    );
    if !ours {
        // Invalidated, replaced or stopped while resolving; hand the result
        // to the waiting callers without installing it.
        return result;
    }

    match &result {
        Ok(value) => {
            let entry = Arc::new(CacheEntry::new(Ok(value.clone()), resolved_at));
            slots.insert(key, Slot::Resolved(entry));
        }
        Err(CacheError::Resolve(error)) => {
            let entry = Arc::new(CacheEntry::new(Err(error.clone()), resolved_at));
            slots.insert(key, Slot::Resolved(entry));
        }
        Err(CacheError::Internal(error)) => {
            // Never memoized: drop the placeholder so the next access
            // retries the full resolution.
            slots.remove(&key);
            tracing::error!(
                cache = %inner.name,
                key = ?key,
                error = %error,
                "resolution failed, not caching",
            );
        }
    }
    result
}

/// Invokes a resolver, converting a panic into an undeclared failure.
///
/// Panics must not poison the cache's bookkeeping (refresh flags, budget),
/// so they are contained here and surface as `CacheError::Internal`.
pub(crate) async fn run_resolver<K, V, E>(
    resolver: &dyn Resolver<K, V, E>,
    key: K,
) -> CacheResult<V, E> {
    match AssertUnwindSafe(resolver.resolve(key)).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .copied()
                .map(str::to_owned)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_owned());
            Err(CacheError::internal(anyhow::anyhow!(
                "resolver panicked: {message}"
            )))
        }
    }
}
