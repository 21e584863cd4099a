//! The refresh scheduler: one background loop per cache instance that
//! dispatches queued refreshes and periodically sweeps expired entries.
//!
//! Refreshes are handed over from `get` through an unbounded queue and
//! spawned as their own tasks, so they land promptly instead of waiting for
//! the next tick; the tick owns eviction. The loop itself is aborted by
//! `stop`, already-spawned refreshes run to completion and their results
//! are discarded if the cache no longer wants them.

use std::fmt;
use std::hash::Hash;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;

use crate::resolver::SharedResolver;
use crate::store::{CacheEntry, CacheInner, run_resolver};

/// A background refresh handed from `get` to the scheduler.
///
/// Carries the resolver of the access that marked the entry, so a refresh
/// always uses the caller's current resolution logic.
pub(crate) struct RefreshJob<K, V, E> {
    pub(crate) key: K,
    pub(crate) entry: Arc<CacheEntry<V, E>>,
    pub(crate) resolver: SharedResolver<K, V, E>,
}

pub(crate) async fn run<K, V, E>(
    inner: Arc<CacheInner<K, V, E>>,
    mut refresh_rx: mpsc::UnboundedReceiver<RefreshJob<K, V, E>>,
) where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    let mut ticker = tokio::time::interval(inner.config().tick());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => inner.sweep(),
            job = refresh_rx.recv() => match job {
                Some(job) => spawn_refresh(Arc::clone(&inner), job),
                // All senders are gone only once the cache itself is.
                None => break,
            },
        }
    }
}

fn spawn_refresh<K, V, E>(inner: Arc<CacheInner<K, V, E>>, job: RefreshJob<K, V, E>)
where
    K: Eq + Hash + Clone + fmt::Debug + Send + Sync + 'static,
    V: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    // We count down towards zero, and if we reach or surpass it, the
    // refresh is skipped; the entry stays stale-but-served and a later
    // access re-requests it.
    let budget = inner.refresh_budget();
    if budget.fetch_sub(1, Ordering::Relaxed) <= 0 {
        budget.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(cache = %inner.name(), key = ?job.key, "refresh budget exhausted, skipping");
        job.entry.end_refresh();
        return;
    }

    tokio::spawn(async move {
        let RefreshJob {
            key,
            entry,
            resolver,
        } = job;
        tracing::trace!(cache = %inner.name(), key = ?key, "refreshing cache entry");

        let result = run_resolver(resolver.as_ref(), key.clone()).await;
        inner.land_refresh(key, &entry, result);

        entry.end_refresh();
        inner.refresh_budget().fetch_add(1, Ordering::Relaxed);
    });
}
