//! Single-flight response cache.
//!
//! Concurrent requests for one hash share a single fetch. Successful results
//! are memoized for the lifetime of the cache; failures are handed to every
//! waiter and then forgotten so the next request fetches again.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;
use paywall_core::PaywallError;
use thiserror::Error;
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    #[error("in-flight fetch for {0} ended without a result")]
    Abandoned(String),
}

impl From<CacheError> for PaywallError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Abandoned(hash) => PaywallError::Abandoned(hash),
        }
    }
}

enum Entry<R> {
    Resolved(R),
    /// Fetch in progress; the token names its waiter list in `pending`.
    InFlight(u64),
}

struct CacheState<R, E> {
    entries: HashMap<String, Entry<R>>,
    pending: HashMap<u64, Vec<oneshot::Sender<Result<R, E>>>>,
    next_token: u64,
}

pub struct ResponseCoalescer<R, E> {
    state: Arc<Mutex<CacheState<R, E>>>,
}

impl<R, E> Default for ResponseCoalescer<R, E> {
    fn default() -> Self {
        Self {
            state: Arc::new(Mutex::new(CacheState {
                entries: HashMap::new(),
                pending: HashMap::new(),
                next_token: 0,
            })),
        }
    }
}

impl<R, E> ResponseCoalescer<R, E>
where
    R: Clone + Send + 'static,
    E: Clone + Send + 'static + From<CacheError>,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the cached result for `hash`, joins an in-flight fetch, or starts one.
    ///
    /// `bypass_cache` skips a memoized result but still joins an in-flight fetch.
    /// The fetch runs on its own task, so dropping the caller does not cancel it.
    pub async fn resolve<F, Fut>(&self, hash: &str, bypass_cache: bool, fetch: F) -> Result<R, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let started = {
            let mut state = self.state.lock();
            let state = &mut *state;
            match state.entries.get(hash) {
                Some(Entry::Resolved(resource)) if !bypass_cache => {
                    metrics::counter!("paywall.cache.hit").increment(1);
                    debug!(hash, "Response cache hit");
                    return Ok(resource.clone());
                }
                Some(Entry::InFlight(token)) => {
                    let waiters = state.pending.entry(*token).or_default();
                    waiters.push(tx);
                    metrics::counter!("paywall.cache.coalesced").increment(1);
                    debug!(hash, waiters = waiters.len(), "Joined in-flight fetch");
                    None
                }
                _ => {
                    let token = state.next_token;
                    state.next_token += 1;
                    state.pending.insert(token, vec![tx]);
                    state
                        .entries
                        .insert(hash.to_string(), Entry::InFlight(token));
                    metrics::counter!("paywall.cache.miss").increment(1);
                    Some(token)
                }
            }
        };

        if let Some(token) = started {
            self.spawn_fetch(hash.to_string(), token, fetch());
        }

        match rx.await {
            Ok(result) => result,
            Err(_) => Err(CacheError::Abandoned(hash.to_string()).into()),
        }
    }

    fn spawn_fetch<Fut>(&self, hash: String, token: u64, fetch: Fut)
    where
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let state = Arc::clone(&self.state);
        tokio::spawn(async move {
            let result = fetch.await;
            let waiters = {
                let mut state = state.lock();
                let waiters = state.pending.remove(&token).unwrap_or_default();
                // Only the fetch that still owns the entry may settle it.
                let owns_entry = matches!(
                    state.entries.get(&hash),
                    Some(Entry::InFlight(current)) if *current == token
                );
                match &result {
                    Ok(resource) if owns_entry => {
                        state
                            .entries
                            .insert(hash.clone(), Entry::Resolved(resource.clone()));
                    }
                    Ok(_) => {
                        debug!(hash = %hash, "Entry invalidated during fetch, result not stored")
                    }
                    Err(_) => {
                        if owns_entry {
                            state.entries.remove(&hash);
                        }
                        metrics::counter!("paywall.cache.fetch_failures").increment(1);
                        warn!(hash = %hash, "Paywall fetch failed");
                    }
                }
                waiters
            };
            for waiter in waiters {
                // Receivers whose callers went away are simply skipped.
                let _ = waiter.send(result.clone());
            }
        });
    }

    /// Peeks at a memoized result without fetching.
    pub fn cached(&self, hash: &str) -> Option<R> {
        match self.state.lock().entries.get(hash) {
            Some(Entry::Resolved(resource)) => Some(resource.clone()),
            _ => None,
        }
    }

    /// Forgets whatever is stored for `hash`. A fetch already running for it
    /// still answers its waiters but no longer populates the cache.
    pub fn invalidate(&self, hash: &str) {
        self.state.lock().entries.remove(hash);
    }

    /// Drops every memoized result. Running fetches finish without storing.
    pub fn clear(&self) {
        self.state.lock().entries.clear();
    }

    /// Number of memoized results.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .entries
            .values()
            .filter(|entry| matches!(entry, Entry::Resolved(_)))
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    type Coalescer = ResponseCoalescer<String, PaywallError>;

    fn counting_fetch(
        calls: Arc<AtomicUsize>,
        value: &str,
        delay_ms: u64,
    ) -> impl FnOnce() -> std::pin::Pin<Box<dyn Future<Output = Result<String, PaywallError>> + Send>>
    {
        let value = value.to_string();
        move || {
            Box::pin(async move {
                calls.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok(value)
            })
        }
    }

    #[tokio::test]
    async fn test_concurrent_requests_share_one_fetch() {
        let cache = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                let calls = calls.clone();
                tokio::spawn(async move {
                    cache
                        .resolve("purchase_en_US", false, counting_fetch(calls, "paywall", 30))
                        .await
                })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "paywall");
        }

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let again = cache
            .resolve("purchase_en_US", false, counting_fetch(calls.clone(), "other", 0))
            .await
            .unwrap();
        assert_eq!(again, "paywall");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_distinct_hashes_fetch_independently() {
        let cache = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        let a = cache.resolve("a_en_US", false, counting_fetch(calls.clone(), "a", 5));
        let b = cache.resolve("b_en_US", false, counting_fetch(calls.clone(), "b", 5));
        let (a, b) = tokio::join!(a, b);
        assert_eq!(a.unwrap(), "a");
        assert_eq!(b.unwrap(), "b");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failures_are_shared_but_not_cached() {
        let cache = Coalescer::new();
        let failing = || async {
            Err::<String, _>(PaywallError::TransientFetch {
                hash: "x_en_US".into(),
                message: "timeout".into(),
            })
        };
        assert!(matches!(
            cache.resolve("x_en_US", false, failing).await,
            Err(PaywallError::TransientFetch { .. })
        ));
        assert!(cache.is_empty());

        let calls = Arc::new(AtomicUsize::new(0));
        let ok = cache
            .resolve("x_en_US", false, counting_fetch(calls.clone(), "recovered", 0))
            .await
            .unwrap();
        assert_eq!(ok, "recovered");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_bypass_refetches_resolved_entry() {
        let cache = Coalescer::new();
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .resolve("p_en_US", false, counting_fetch(calls.clone(), "v1", 0))
            .await
            .unwrap();
        let fresh = cache
            .resolve("p_en_US", true, counting_fetch(calls.clone(), "v2", 0))
            .await
            .unwrap();
        assert_eq!(fresh, "v2");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(cache.cached("p_en_US").as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_dropped_caller_does_not_cancel_fetch() {
        let cache = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first = {
            let cache = cache.clone();
            let calls = calls.clone();
            tokio::spawn(async move {
                cache
                    .resolve("slow_en_US", false, move || async move {
                        calls.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, PaywallError>("kept".to_string())
                    })
                    .await
            })
        };
        while calls.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        first.abort();
        release_tx.send(()).unwrap();

        let unexpected = Arc::new(AtomicUsize::new(0));
        let value = cache
            .resolve("slow_en_US", false, counting_fetch(unexpected.clone(), "refetched", 0))
            .await
            .unwrap();
        assert_eq!(value, "kept");
        assert_eq!(unexpected.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_clear_during_fetch_answers_but_does_not_store() {
        let cache = Arc::new(Coalescer::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let started = Arc::new(AtomicUsize::new(0));

        let pending = {
            let cache = cache.clone();
            let started = started.clone();
            tokio::spawn(async move {
                cache
                    .resolve("c_en_US", false, move || async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, PaywallError>("stale".to_string())
                    })
                    .await
            })
        };
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        cache.clear();
        release_tx.send(()).unwrap();

        assert_eq!(pending.await.unwrap().unwrap(), "stale");
        assert!(cache.cached("c_en_US").is_none());
    }

    #[tokio::test]
    async fn test_invalidate_leaves_other_hashes_alone() {
        let cache = Arc::new(Coalescer::new());
        let calls = Arc::new(AtomicUsize::new(0));
        cache
            .resolve("a_en_US", false, counting_fetch(calls.clone(), "a", 0))
            .await
            .unwrap();

        let (release_tx, release_rx) = oneshot::channel::<()>();
        let started = Arc::new(AtomicUsize::new(0));
        let pending = {
            let cache = cache.clone();
            let started = started.clone();
            tokio::spawn(async move {
                cache
                    .resolve("b_en_US", false, move || async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, PaywallError>("b".to_string())
                    })
                    .await
            })
        };
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        cache.invalidate("a_en_US");
        release_tx.send(()).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), "b");

        assert!(cache.cached("a_en_US").is_none());
        assert_eq!(cache.cached("b_en_US").as_deref(), Some("b"));
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_forces_next_fetch() {
        let cache = Arc::new(Coalescer::new());
        let (release_tx, release_rx) = oneshot::channel::<()>();
        let started = Arc::new(AtomicUsize::new(0));

        let pending = {
            let cache = cache.clone();
            let started = started.clone();
            tokio::spawn(async move {
                cache
                    .resolve("pw_en_US", false, move || async move {
                        started.fetch_add(1, Ordering::SeqCst);
                        let _ = release_rx.await;
                        Ok::<_, PaywallError>("old".to_string())
                    })
                    .await
            })
        };
        while started.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        cache.invalidate("pw_en_US");
        let calls = Arc::new(AtomicUsize::new(0));
        let fresh = cache
            .resolve("pw_en_US", false, counting_fetch(calls.clone(), "new", 0))
            .await
            .unwrap();
        assert_eq!(fresh, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 1);

        release_tx.send(()).unwrap();
        assert_eq!(pending.await.unwrap().unwrap(), "old");
        assert_eq!(cache.cached("pw_en_US").as_deref(), Some("new"));
    }
}
