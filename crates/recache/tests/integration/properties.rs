use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use futures::future::join_all;
use recache_test::{CountingResolver, FailingResolver, NotFound, setup};
use tokio::time;

use recache::{BackgroundCache, CacheConfig, CacheError, resolver_fn};

fn test_config() -> CacheConfig {
    CacheConfig {
        refresh_interval: Duration::from_secs(5),
        expiration_age: Duration::from_secs(60),
        ..Default::default()
    }
}

fn started_cache() -> BackgroundCache<String, String, NotFound> {
    let cache = BackgroundCache::new("test", test_config()).unwrap();
    cache.start();
    cache
}

/// Lets the scheduler task and any spawned refreshes run.
async fn settle() {
    time::sleep(Duration::from_millis(50)).await;
}

#[tokio::test(start_paused = true)]
async fn first_access_resolves_once() {
    setup();
    let cache = started_cache();
    let resolver = CountingResolver::new("v");

    assert_eq!(cache.get("k".to_owned(), resolver.clone()).await.unwrap(), "v0");
    assert_eq!(resolver.calls(), 1);
    assert_eq!(cache.len(), 1);
}

#[tokio::test(start_paused = true)]
async fn fresh_entries_serve_from_cache() {
    setup();
    let cache = started_cache();
    let resolver = CountingResolver::new("v");

    assert_eq!(cache.get("k".to_owned(), resolver.clone()).await.unwrap(), "v0");
    time::advance(Duration::from_secs(3)).await;
    assert_eq!(cache.get("k".to_owned(), resolver.clone()).await.unwrap(), "v0");
    settle().await;
    assert_eq!(resolver.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn coalesces_concurrent_first_accesses() {
    setup();
    let cache = started_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = {
        let calls = Arc::clone(&calls);
        resolver_fn(move |_key: String| {
            let calls = Arc::clone(&calls);
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                time::sleep(Duration::from_millis(100)).await;
                Ok::<_, CacheError<NotFound>>("shared".to_owned())
            }
        })
    };

    let results = join_all(
        (0..100).map(|_| cache.get("k".to_owned(), Arc::clone(&resolver))),
    )
    .await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(results.len(), 100);
    for result in results {
        assert_eq!(result.unwrap(), "shared");
    }
}

#[tokio::test(start_paused = true)]
async fn stale_entries_refresh_once_per_window() {
    setup();
    let cache = started_cache();
    let resolver = CountingResolver::new("v");

    assert_eq!(cache.get("k".to_owned(), resolver.clone()).await.unwrap(), "v0");

    time::advance(Duration::from_secs(5)).await;

    // N concurrent stale reads: all serve the old value immediately, and
    // only one background refresh runs.
    let results = join_all(
        (0..10).map(|_| cache.get("k".to_owned(), resolver.clone())),
    )
    .await;
    for result in results {
        assert_eq!(result.unwrap(), "v0");
    }

    settle().await;
    assert_eq!(resolver.calls(), 2);
    assert_eq!(cache.get("k".to_owned(), resolver.clone()).await.unwrap(), "v1");
}

#[tokio::test(start_paused = true)]
async fn refresh_uses_the_marking_callers_resolver() {
    setup();
    let cache = started_cache();
    let a = CountingResolver::new("a");
    let b = CountingResolver::new("b");
    let c = CountingResolver::new("c");

    // t=0: first access resolves synchronously.
    assert_eq!(cache.get("k".to_owned(), a.clone()).await.unwrap(), "a0");
    assert_eq!(a.calls(), 1);

    // t=3: still fresh, no resolver involved.
    time::advance(Duration::from_secs(3)).await;
    assert_eq!(cache.get("k".to_owned(), b.clone()).await.unwrap(), "a0");
    assert_eq!(b.calls(), 0);

    // t=6: stale; served as-is while b's refresh is scheduled.
    time::advance(Duration::from_secs(3)).await;
    assert_eq!(cache.get("k".to_owned(), b.clone()).await.unwrap(), "a0");
    settle().await;
    assert_eq!(b.calls(), 1);

    // t≈7: the refreshed value is b's.
    assert_eq!(cache.get("k".to_owned(), c.clone()).await.unwrap(), "b0");
    assert_eq!(c.calls(), 0);

    // t=70, untouched since t≈6: swept, so the next access resolves fully.
    time::advance(Duration::from_secs(63)).await;
    settle().await;
    assert_eq!(cache.len(), 0);
    assert_eq!(cache.get("k".to_owned(), c.clone()).await.unwrap(), "c0");
    assert_eq!(c.calls(), 1);
}

#[tokio::test(start_paused = true)]
async fn untouched_entries_expire() {
    setup();
    let cache = started_cache();
    let resolver = CountingResolver::new("v");

    cache.get("k".to_owned(), resolver.clone()).await.unwrap();
    assert_eq!(cache.len(), 1);

    time::advance(Duration::from_secs(61)).await;
    settle().await;

    assert_eq!(cache.len(), 0);
    assert_eq!(cache.get("k".to_owned(), resolver.clone()).await.unwrap(), "v1");
    assert_eq!(resolver.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn memoizes_declared_failures() {
    setup();
    let cache = started_cache();
    let resolver = FailingResolver::new();

    for _ in 0..5 {
        let err = cache.get("k".to_owned(), resolver.clone()).await.unwrap_err();
        assert!(matches!(err, CacheError::Resolve(NotFound)));
    }
    // The failure is replayed from the cache, not re-resolved.
    assert_eq!(resolver.calls(), 1);

    // One background retry per refresh window.
    time::advance(Duration::from_secs(5)).await;
    let err = cache.get("k".to_owned(), resolver.clone()).await.unwrap_err();
    assert!(matches!(err, CacheError::Resolve(NotFound)));
    settle().await;
    assert_eq!(resolver.calls(), 2);
}

#[tokio::test(start_paused = true)]
async fn never_caches_undeclared_failures() {
    setup();
    let cache = started_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = {
        let calls = Arc::clone(&calls);
        resolver_fn(move |_key: String| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move {
                Err::<String, _>(CacheError::<NotFound>::internal(anyhow::anyhow!(
                    "backend unreachable"
                )))
            }
        })
    };

    for _ in 0..3 {
        let err = cache.get("k".to_owned(), Arc::clone(&resolver)).await.unwrap_err();
        assert!(matches!(err, CacheError::Internal(_)));
    }
    // Every access retried in full: nothing was cached.
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(cache.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_previous_result() {
    setup();
    let cache = started_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = {
        let calls = Arc::clone(&calls);
        resolver_fn(move |_key: String| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call == 0 {
                    Ok("good".to_owned())
                } else {
                    Err(CacheError::<NotFound>::internal(anyhow::anyhow!("flaky")))
                }
            }
        })
    };

    assert_eq!(
        cache.get("k".to_owned(), Arc::clone(&resolver)).await.unwrap(),
        "good"
    );

    time::advance(Duration::from_secs(5)).await;
    assert_eq!(
        cache.get("k".to_owned(), Arc::clone(&resolver)).await.unwrap(),
        "good"
    );
    settle().await;
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    // The failed refresh did not clobber the good value.
    assert_eq!(cache.cached(&"k".to_owned()).unwrap().unwrap(), "good");
}

#[tokio::test(start_paused = true)]
async fn resolver_panic_is_an_undeclared_failure() {
    setup();
    let cache = started_cache();
    let resolver = resolver_fn(|_key: String| async move { panic!("kaboom") });

    let err = cache.get("k".to_owned(), resolver).await.unwrap_err();
    match err {
        CacheError::Internal(inner) => {
            assert!(inner.to_string().contains("kaboom"));
        }
        other => panic!("expected an internal error, got {other:?}"),
    }
    assert_eq!(cache.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn eviction_mid_refresh_repopulates() {
    setup();
    let cache = started_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = {
        let calls = Arc::clone(&calls);
        resolver_fn(move |_key: String| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call > 0 {
                    // Slow refresh: still in flight when the sweep runs.
                    time::sleep(Duration::from_secs(10)).await;
                }
                Ok::<_, CacheError<NotFound>>(format!("v{call}"))
            }
        })
    };

    assert_eq!(
        cache.get("k".to_owned(), Arc::clone(&resolver)).await.unwrap(),
        "v0"
    );

    // t=59: stale access kicks off the slow refresh.
    time::advance(Duration::from_secs(59)).await;
    assert_eq!(
        cache.get("k".to_owned(), Arc::clone(&resolver)).await.unwrap(),
        "v0"
    );
    settle().await;

    // t=62: the original entry has expired and is swept mid-refresh.
    time::advance(Duration::from_secs(3)).await;
    assert_eq!(cache.len(), 0);

    // t=69+: the refresh lands anyway and starts a fresh entry.
    time::advance(Duration::from_secs(10)).await;
    settle().await;
    assert_eq!(cache.cached(&"k".to_owned()).unwrap().unwrap(), "v1");
}

#[tokio::test(start_paused = true)]
async fn invalidation_mid_refresh_is_not_resurrected() {
    setup();
    let cache = started_cache();
    let calls = Arc::new(AtomicUsize::new(0));
    let resolver = {
        let calls = Arc::clone(&calls);
        resolver_fn(move |_key: String| {
            let call = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if call > 0 {
                    time::sleep(Duration::from_secs(1)).await;
                }
                Ok::<_, CacheError<NotFound>>(format!("v{call}"))
            }
        })
    };

    cache.get("k".to_owned(), Arc::clone(&resolver)).await.unwrap();
    time::advance(Duration::from_secs(5)).await;
    // Kicks off the slow refresh, then invalidates while it is in flight.
    cache.get("k".to_owned(), Arc::clone(&resolver)).await.unwrap();
    cache.invalidate(&"k".to_owned());

    time::advance(Duration::from_secs(2)).await;
    settle().await;
    assert!(cache.cached(&"k".to_owned()).is_none());
    assert_eq!(cache.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn stop_discards_everything() {
    setup();
    let cache = started_cache();
    let resolver = CountingResolver::new("v");

    cache.get("a".to_owned(), resolver.clone()).await.unwrap();
    cache.get("b".to_owned(), resolver.clone()).await.unwrap();
    assert_eq!(cache.len(), 2);

    time::advance(Duration::from_secs(5)).await;
    // Mark a refresh, then stop before it can land.
    cache.get("a".to_owned(), resolver.clone()).await.unwrap();
    cache.stop();

    settle().await;
    assert_eq!(cache.len(), 0);

    // Repeated stops are a no-op.
    cache.stop();
    assert_eq!(cache.len(), 0);
}

#[tokio::test(start_paused = true)]
async fn distinct_keys_do_not_interfere() {
    setup();
    let cache = started_cache();
    let a = CountingResolver::new("a");
    let b = CountingResolver::new("b");

    assert_eq!(cache.get("ka".to_owned(), a.clone()).await.unwrap(), "a0");
    assert_eq!(cache.get("kb".to_owned(), b.clone()).await.unwrap(), "b0");

    time::advance(Duration::from_secs(5)).await;
    // Only the accessed key refreshes.
    assert_eq!(cache.get("ka".to_owned(), a.clone()).await.unwrap(), "a0");
    settle().await;
    assert_eq!(a.calls(), 2);
    assert_eq!(b.calls(), 1);
    assert_eq!(cache.cached(&"kb".to_owned()).unwrap().unwrap(), "b0");
}
