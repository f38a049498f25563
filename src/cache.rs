use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Instant,
};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{broadcast, Mutex};
use tracing::{debug, error, warn};

use crate::api_client::ApiError;
use crate::types::QueryKey;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error("api error: {0}")]
    Api(#[from] ApiError),
    #[error("{0}")]
    Failed(String),
}

#[async_trait]
pub trait QueryFn: Send + Sync {
    async fn fetch(&self) -> Result<Value, FetchError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefetchMode {
    Stale,
    Always,
}

#[derive(Debug, Clone, PartialEq)]
pub enum CacheEvent {
    Updated { key: QueryKey, data: Value },
    Invalidated { key: QueryKey },
    Removed { key: QueryKey },
}

struct CacheEntry {
    data: Option<Value>,
    stale: bool,
    // bumped by every invalidation that lands while stale data could still be
    // written back
    epoch: u64,
    in_flight: bool,
    // clock tick at which the last successful fetch started
    last_fetch_tick: u64,
    updated_at: Option<Instant>,
    observers: usize,
    query_fn: Option<Arc<dyn QueryFn>>,
}

impl CacheEntry {
    fn new(query_fn: Option<Arc<dyn QueryFn>>) -> Self {
        Self {
            data: None,
            stale: true,
            epoch: 0,
            in_flight: false,
            last_fetch_tick: 0,
            updated_at: None,
            observers: 0,
            query_fn,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntrySnapshot {
    pub data: Option<Value>,
    pub stale: bool,
    pub active: bool,
    pub updated_at: Option<Instant>,
}

pub struct QueryCache {
    entries: DashMap<QueryKey, CacheEntry>,
    refresh_locks: DashMap<QueryKey, Arc<Mutex<()>>>,
    clock: AtomicU64,
    events: broadcast::Sender<CacheEvent>,
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new()
    }
}

impl QueryCache {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            entries: DashMap::new(),
            refresh_locks: DashMap::new(),
            clock: AtomicU64::new(1),
            events,
        }
    }

    fn tick(&self) -> u64 {
        self.clock.fetch_add(1, Ordering::SeqCst)
    }

    fn emit(&self, event: CacheEvent) {
        // no receivers is fine
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<CacheEvent> {
        self.events.subscribe()
    }

    pub fn observe(self: &Arc<Self>, key: QueryKey, query_fn: Arc<dyn QueryFn>) -> QueryObserver {
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(None));
            entry.query_fn = Some(query_fn);
            entry.observers += 1;
        }
        debug!(%key, "query observed");
        QueryObserver {
            cache: Arc::clone(self),
            key,
        }
    }

    fn release(&self, key: &QueryKey) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            entry.observers = entry.observers.saturating_sub(1);
        }
    }

    pub fn get(&self, key: &QueryKey) -> Option<Value> {
        self.entries.get(key).and_then(|e| e.data.clone())
    }

    pub fn snapshot(&self, key: &QueryKey) -> Option<EntrySnapshot> {
        self.entries.get(key).map(|e| EntrySnapshot {
            data: e.data.clone(),
            stale: e.stale,
            active: e.observers > 0,
            updated_at: e.updated_at,
        })
    }

    // not a completed fetch, so it never suppresses a pending refetch
    pub fn set_query_data(&self, key: QueryKey, data: Value) {
        {
            let mut entry = self
                .entries
                .entry(key.clone())
                .or_insert_with(|| CacheEntry::new(None));
            entry.data = Some(data.clone());
            entry.stale = false;
            entry.updated_at = Some(Instant::now());
        }
        self.emit(CacheEvent::Updated { key, data });
    }

    /// Marks every entry under `prefix` stale and returns the matching keys.
    /// Invalidating an already stale entry is a no-op unless a fetch is in
    /// flight, in which case that fetch's result is kept stale.
    pub fn invalidate_prefix(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        let mut matched = Vec::new();
        let mut transitioned = Vec::new();

        for mut entry in self.entries.iter_mut() {
            if !entry.key().starts_with(prefix) {
                continue;
            }
            let key = entry.key().clone();
            let state = entry.value_mut();
            if state.in_flight {
                state.epoch += 1;
                state.stale = true;
            } else if !state.stale {
                state.epoch += 1;
                state.stale = true;
                transitioned.push(key.clone());
            }
            matched.push(key);
        }

        for key in transitioned {
            self.emit(CacheEvent::Invalidated { key });
        }
        debug!(%prefix, matched = matched.len(), "invalidated cache prefix");
        matched
    }

    pub fn active_keys(&self, prefix: &QueryKey) -> Vec<QueryKey> {
        self.entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && e.observers > 0 && e.query_fn.is_some())
            .map(|e| e.key().clone())
            .collect()
    }

    /// Loads `key` through its query function. Fetches of one key are
    /// serialized; a request that waited behind a fetch which started after it
    /// and left the entry fresh returns that result instead of fetching again.
    pub async fn refetch(&self, key: &QueryKey, mode: RefetchMode) -> Result<Option<Value>, FetchError> {
        let requested = self.tick();
        self.with_refresh_lock(key, move || async move {
            let (query_fn, epoch_at_start, started) = {
                let mut entry = match self.entries.get_mut(key) {
                    Some(entry) => entry,
                    None => return Ok(None),
                };
                if entry.last_fetch_tick > requested && !entry.stale {
                    debug!(%key, "refetch satisfied by newer fetch");
                    return Ok(entry.data.clone());
                }
                if mode == RefetchMode::Stale && !entry.stale && entry.data.is_some() {
                    return Ok(entry.data.clone());
                }
                let Some(query_fn) = entry.query_fn.clone() else {
                    return Ok(entry.data.clone());
                };
                entry.in_flight = true;
                (query_fn, entry.epoch, self.tick())
            };

            let result = query_fn.fetch().await;

            let data = {
                let Some(mut entry) = self.entries.get_mut(key) else {
                    return result.map(Some);
                };
                entry.in_flight = false;
                match result {
                    Ok(data) => {
                        entry.data = Some(data.clone());
                        entry.stale = entry.epoch != epoch_at_start;
                        entry.last_fetch_tick = started;
                        entry.updated_at = Some(Instant::now());
                        data
                    }
                    Err(e) => {
                        warn!(%key, error = %e, "query fetch failed");
                        return Err(e);
                    }
                }
            };

            self.emit(CacheEvent::Updated {
                key: key.clone(),
                data: data.clone(),
            });
            Ok(Some(data))
        })
        .await
    }

    pub async fn refetch_active(self: &Arc<Self>, prefix: &QueryKey, mode: RefetchMode) -> usize {
        let keys = self.active_keys(prefix);
        let mut handles = Vec::with_capacity(keys.len());

        for key in keys {
            let cache = Arc::clone(self);
            handles.push(tokio::spawn(async move {
                cache.refetch(&key, mode).await.is_ok()
            }));
        }

        let mut refreshed = 0;
        for handle in handles {
            match handle.await {
                Ok(true) => refreshed += 1,
                Ok(false) => {}
                Err(e) => error!(error = %e, "refetch task panicked"),
            }
        }
        refreshed
    }

    async fn with_refresh_lock<F, Fut, T, E>(&self, key: &QueryKey, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, E>>,
    {
        let lock = self
            .refresh_locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .value()
            .clone();

        let _guard = lock.lock().await;
        f().await
    }

    pub fn remove(&self, key: &QueryKey) {
        if self.entries.remove(key).is_some() {
            self.emit(CacheEvent::Removed { key: key.clone() });
        }
        self.refresh_locks.remove(key);
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.entries.iter().map(|r| r.key().clone()).collect()
    }
}

pub struct QueryObserver {
    cache: Arc<QueryCache>,
    key: QueryKey,
}

impl QueryObserver {
    pub fn key(&self) -> &QueryKey {
        &self.key
    }
}

impl Drop for QueryObserver {
    fn drop(&mut self) {
        self.cache.release(&self.key);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;

    /// Counts calls and returns the next scripted value (the last one repeats).
    pub(crate) struct CountingQuery {
        pub calls: AtomicUsize,
        values: Vec<Value>,
        delay: Duration,
    }

    impl CountingQuery {
        pub(crate) fn new(values: Vec<Value>) -> Arc<Self> {
            Self::with_delay(values, Duration::from_millis(5))
        }

        pub(crate) fn with_delay(values: Vec<Value>, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                values,
                delay,
            })
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl QueryFn for CountingQuery {
        async fn fetch(&self) -> Result<Value, FetchError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            let value = self
                .values
                .get(n)
                .or_else(|| self.values.last())
                .cloned()
                .unwrap_or(Value::Null);
            Ok(value)
        }
    }

    struct FailingQuery;

    #[async_trait]
    impl QueryFn for FailingQuery {
        async fn fetch(&self) -> Result<Value, FetchError> {
            Err(FetchError::Failed("backend unavailable".into()))
        }
    }

    #[tokio::test]
    async fn double_invalidation_costs_one_fetch() {
        let cache = Arc::new(QueryCache::new());
        let query = CountingQuery::new(vec![json!(1), json!(2)]);
        let key = QueryKey::new(["wallet"]);
        let _observer = cache.observe(key.clone(), query.clone());

        cache.refetch(&key, RefetchMode::Stale).await.unwrap();
        assert_eq!(query.calls(), 1);

        cache.invalidate_prefix(&key);
        cache.invalidate_prefix(&key);
        let (a, b) = tokio::join!(
            cache.refetch_active(&key, RefetchMode::Stale),
            cache.refetch_active(&key, RefetchMode::Stale),
        );

        assert_eq!((a, b), (1, 1));
        assert_eq!(query.calls(), 2);
        assert_eq!(cache.get(&key), Some(json!(2)));
        assert!(!cache.snapshot(&key).unwrap().stale);
    }

    #[tokio::test]
    async fn invalidating_prefix_reaches_nested_keys() {
        let cache = Arc::new(QueryCache::new());
        let query = CountingQuery::new(vec![json!({"items": []})]);
        let transactions = QueryKey::new(["wallet", "transactions"]);
        let unrelated = QueryKey::new(["wallet-transactions"]);
        let _a = cache.observe(transactions.clone(), query.clone());
        let _b = cache.observe(unrelated.clone(), query.clone());
        cache.refetch(&transactions, RefetchMode::Stale).await.unwrap();
        cache.refetch(&unrelated, RefetchMode::Stale).await.unwrap();

        let matched = cache.invalidate_prefix(&QueryKey::new(["wallet"]));

        assert_eq!(matched, vec![transactions.clone()]);
        assert!(cache.snapshot(&transactions).unwrap().stale);
        assert!(!cache.snapshot(&unrelated).unwrap().stale);
    }

    #[tokio::test]
    async fn invalidation_during_fetch_keeps_result_stale() {
        let cache = Arc::new(QueryCache::new());
        let query = CountingQuery::with_delay(vec![json!(1), json!(2)], Duration::from_millis(50));
        let key = QueryKey::new(["bookings"]);
        let _observer = cache.observe(key.clone(), query.clone());

        let inflight = {
            let cache = cache.clone();
            let key = key.clone();
            tokio::spawn(async move { cache.refetch(&key, RefetchMode::Stale).await })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        cache.invalidate_prefix(&key);
        inflight.await.unwrap().unwrap();

        assert!(cache.snapshot(&key).unwrap().stale);
        cache.refetch(&key, RefetchMode::Stale).await.unwrap();
        assert_eq!(query.calls(), 2);
        assert_eq!(cache.get(&key), Some(json!(2)));
    }

    #[tokio::test]
    async fn only_active_entries_are_refetched() {
        let cache = Arc::new(QueryCache::new());
        let query = CountingQuery::new(vec![json!(1)]);
        let mounted = QueryKey::new(["vehicles", "mine"]);
        let unmounted = QueryKey::new(["vehicles", "all"]);
        let _observer = cache.observe(mounted.clone(), query.clone());
        drop(cache.observe(unmounted.clone(), query.clone()));

        let prefix = QueryKey::new(["vehicles"]);
        cache.invalidate_prefix(&prefix);
        let refreshed = cache.refetch_active(&prefix, RefetchMode::Stale).await;

        assert_eq!(refreshed, 1);
        assert_eq!(query.calls(), 1);
        assert!(cache.snapshot(&unmounted).unwrap().stale);
    }

    #[tokio::test]
    async fn always_mode_fetches_fresh_entries() {
        let cache = Arc::new(QueryCache::new());
        let query = CountingQuery::new(vec![json!(1), json!(2)]);
        let key = QueryKey::new(["notifications", "unread-count"]);
        let _observer = cache.observe(key.clone(), query.clone());

        cache.refetch(&key, RefetchMode::Stale).await.unwrap();
        cache.refetch(&key, RefetchMode::Stale).await.unwrap();
        assert_eq!(query.calls(), 1);

        let value = cache.refetch(&key, RefetchMode::Always).await.unwrap();
        assert_eq!(value, Some(json!(2)));
        assert_eq!(query.calls(), 2);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_entry_stale_and_emits_nothing() {
        let cache = Arc::new(QueryCache::new());
        let key = QueryKey::new(["wallet"]);
        let _observer = cache.observe(key.clone(), Arc::new(FailingQuery));
        let mut events = cache.subscribe();

        assert!(cache.refetch(&key, RefetchMode::Stale).await.is_err());
        assert!(cache.snapshot(&key).unwrap().stale);
        assert!(events.try_recv().is_err());

        cache.invalidate_prefix(&key);
        cache.invalidate_prefix(&key);
    }

    #[tokio::test]
    async fn updates_are_broadcast() {
        let cache = Arc::new(QueryCache::new());
        let key = QueryKey::new(["notifications", "unread-count"]);
        let mut events = cache.subscribe();

        cache.set_query_data(key.clone(), json!({"unreadCount": 3}));
        cache.invalidate_prefix(&QueryKey::new(["notifications"]));

        assert_eq!(
            events.recv().await.unwrap(),
            CacheEvent::Updated {
                key: key.clone(),
                data: json!({"unreadCount": 3})
            }
        );
        assert_eq!(events.recv().await.unwrap(), CacheEvent::Invalidated { key });
    }
}
