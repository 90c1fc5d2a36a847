//! Media cache.
//!
//! [`MediaCache`] holds one blob handle per attachment key for the lifetime
//! of a session. Fetches are authenticated, asynchronous, and strictly
//! single-flight: a `get` for a key that is already being fetched joins the
//! in-flight fetch instead of starting a second one. Completion and failure
//! are announced on a broadcast channel so observers can re-render.
//!
//! A failed fetch caches nothing and is not retried automatically; a later
//! `get` for the same key starts a fresh fetch.

use std::{
    collections::{HashMap, HashSet},
    sync::{Arc, Mutex, PoisonError},
};

use async_trait::async_trait;
use bytes::Bytes;
use parley_proto::ResourceKey;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::api::{ApiError, DiscussionApi};

/// Capacity of the cache event channel. Slow observers lose old
/// notifications, never correctness: the cache itself stays queryable.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Fetches binary content for a cache key.
///
/// Implemented by [`DiscussionApi`]; tests substitute counting or failing
/// fetchers.
#[async_trait]
pub trait FileFetcher: Send + Sync + 'static {
    /// Fetch the blob for one key.
    async fn fetch(&self, key: &ResourceKey) -> Result<Bytes, ApiError>;
}

#[async_trait]
impl FileFetcher for DiscussionApi {
    async fn fetch(&self, key: &ResourceKey) -> Result<Bytes, ApiError> {
        self.fetch_file(key).await
    }
}

/// Result of a cache lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    /// The blob is cached; here is the handle.
    Ready(Bytes),
    /// A fetch is in flight (started by this call or an earlier one). A
    /// [`CacheEvent`] follows when it settles.
    Pending,
}

/// Notifications published when a fetch settles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// The blob for this key is now cached.
    Loaded(ResourceKey),
    /// The fetch for this key failed; nothing was cached.
    Failed {
        /// Key whose fetch failed.
        key: ResourceKey,
        /// Human-readable failure description.
        reason: String,
    },
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<ResourceKey, Bytes>,
    in_flight: HashSet<ResourceKey>,
    closed: bool,
}

/// Session-private cache of attachment blobs.
pub struct MediaCache {
    fetcher: Arc<dyn FileFetcher>,
    state: Arc<Mutex<CacheState>>,
    events: broadcast::Sender<CacheEvent>,
    cancel: CancellationToken,
}

impl MediaCache {
    /// Create an empty cache whose fetch tasks live under the given
    /// cancellation scope.
    pub fn new(fetcher: Arc<dyn FileFetcher>, cancel: CancellationToken) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self { fetcher, state: Arc::new(Mutex::new(CacheState::default())), events, cancel }
    }

    /// Look up a key, starting an authenticated fetch if it is neither
    /// cached nor already in flight.
    ///
    /// Must be called within a tokio runtime: cache misses spawn the fetch
    /// as a task under the session's cancellation scope.
    pub fn get(&self, key: &ResourceKey) -> Lookup {
        let mut state = lock(&self.state);

        if state.closed {
            return Lookup::Pending;
        }
        if let Some(bytes) = state.entries.get(key) {
            return Lookup::Ready(bytes.clone());
        }
        if state.in_flight.contains(key) {
            // Single-flight: join the fetch already under way.
            return Lookup::Pending;
        }

        state.in_flight.insert(key.clone());
        drop(state);

        self.spawn_fetch(key.clone());
        Lookup::Pending
    }

    /// Synchronous membership check.
    pub fn has(&self, key: &ResourceKey) -> bool {
        lock(&self.state).entries.contains_key(key)
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        lock(&self.state).entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        lock(&self.state).entries.is_empty()
    }

    /// Subscribe to fetch completion events.
    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    /// Release every handle and close the cache. Late completions of
    /// in-flight fetches are discarded instead of repopulating a cache that
    /// no longer has an owner.
    pub fn invalidate_all(&self) {
        let mut state = lock(&self.state);
        state.entries.clear();
        state.in_flight.clear();
        state.closed = true;
    }

    fn spawn_fetch(&self, key: ResourceKey) {
        let fetcher = Arc::clone(&self.fetcher);
        let state = Arc::clone(&self.state);
        let events = self.events.clone();
        let cancel = self.cancel.clone();

        tokio::spawn(async move {
            let result = tokio::select! {
                () = cancel.cancelled() => return,
                result = fetcher.fetch(&key) => result,
            };

            let event = {
                let mut state = lock(&state);
                if state.closed {
                    return;
                }
                state.in_flight.remove(&key);
                match result {
                    Ok(bytes) => {
                        state.entries.insert(key.clone(), bytes);
                        CacheEvent::Loaded(key)
                    },
                    Err(e) => {
                        warn!(key = %key, error = %e, "attachment fetch failed");
                        CacheEvent::Failed { key, reason: e.to_string() }
                    },
                }
            };

            // Nobody listening is fine; the cache itself is the source of
            // truth and `has`/`get` still observe the outcome.
            let _ = events.send(event);
        });
    }
}

fn lock(state: &Mutex<CacheState>) -> std::sync::MutexGuard<'_, CacheState> {
    state.lock().unwrap_or_else(PoisonError::into_inner)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use parley_proto::{DiscussionId, MediaKind};
    use tokio::sync::Notify;

    use super::*;

    fn key(name: &str) -> ResourceKey {
        ResourceKey::new(DiscussionId::new("d1"), MediaKind::Image, name)
    }

    /// Fetcher that counts calls and blocks until released.
    struct GatedFetcher {
        calls: AtomicUsize,
        gate: Notify,
    }

    impl GatedFetcher {
        fn new() -> Arc<Self> {
            Arc::new(Self { calls: AtomicUsize::new(0), gate: Notify::new() })
        }
    }

    #[async_trait]
    impl FileFetcher for Arc<GatedFetcher> {
        async fn fetch(&self, _key: &ResourceKey) -> Result<Bytes, ApiError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.gate.notified().await;
            Ok(Bytes::from_static(b"blob"))
        }
    }

    struct FailingFetcher;

    #[async_trait]
    impl FileFetcher for FailingFetcher {
        async fn fetch(&self, _key: &ResourceKey) -> Result<Bytes, ApiError> {
            Err(ApiError::ErrorPayload { body: "no such file".to_owned() })
        }
    }

    #[tokio::test]
    async fn concurrent_gets_share_one_fetch() {
        let fetcher = GatedFetcher::new();
        let cache = MediaCache::new(Arc::new(fetcher.clone()), CancellationToken::new());
        let mut events = cache.subscribe();

        assert_eq!(cache.get(&key("a.jpg")), Lookup::Pending);
        assert_eq!(cache.get(&key("a.jpg")), Lookup::Pending);

        // Let the fetch start, then release it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        fetcher.gate.notify_one();

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(event, CacheEvent::Loaded(key("a.jpg")));

        // Exactly one underlying fetch despite two gets.
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);

        assert!(cache.has(&key("a.jpg")));
        assert!(matches!(cache.get(&key("a.jpg")), Lookup::Ready(_)));
    }

    #[tokio::test]
    async fn failed_fetch_caches_nothing_and_allows_retry() {
        let cache = MediaCache::new(Arc::new(FailingFetcher), CancellationToken::new());
        let mut events = cache.subscribe();

        assert_eq!(cache.get(&key("a.jpg")), Lookup::Pending);

        let event = tokio::time::timeout(Duration::from_secs(5), events.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(event, CacheEvent::Failed { .. }));
        assert!(!cache.has(&key("a.jpg")));

        // The caller may re-request; a fresh fetch starts.
        assert_eq!(cache.get(&key("a.jpg")), Lookup::Pending);
    }

    #[tokio::test]
    async fn invalidate_all_discards_late_completions() {
        let fetcher = GatedFetcher::new();
        let cache = MediaCache::new(Arc::new(fetcher.clone()), CancellationToken::new());

        assert_eq!(cache.get(&key("a.jpg")), Lookup::Pending);
        tokio::time::sleep(Duration::from_millis(20)).await;

        cache.invalidate_all();
        fetcher.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!cache.has(&key("a.jpg")));
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn cancellation_aborts_in_flight_fetch() {
        let fetcher = GatedFetcher::new();
        let cancel = CancellationToken::new();
        let cache = MediaCache::new(Arc::new(fetcher.clone()), cancel.clone());

        assert_eq!(cache.get(&key("a.jpg")), Lookup::Pending);
        tokio::time::sleep(Duration::from_millis(20)).await;

        cancel.cancel();
        fetcher.gate.notify_one();
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert!(!cache.has(&key("a.jpg")));
    }
}
