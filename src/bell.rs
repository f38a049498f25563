use std::sync::Arc;

use futures::StreamExt;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::api_client::response_data;
use crate::cache::{CacheEvent, QueryCache, QueryFn, QueryObserver, RefetchMode};
use crate::registry::{RefreshHandler, SubscriptionRegistry};
use crate::types::{QueryKey, Target};

const BADGE_CAP: u64 = 99;

pub fn unread_count_key() -> QueryKey {
    QueryKey::new(["notifications", "unread-count"])
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum BellPhase {
    #[default]
    Idle,
    QueryPending,
    HasValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BellState {
    pub phase: BellPhase,
    pub unread_count: u64,
    pub has_value: bool,
    pub is_dropdown_open: bool,
    pub trigger: u64,
    mounted: bool,
    latest_request: u64,
    last_applied: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BellEvent {
    Mounted,
    QueryResult { request: u64, count: i64 },
    QueryFailed { request: u64 },
    CacheUpdated { count: i64 },
    PushReceived,
    ManualRefresh,
    ToggleDropdown,
    Unmounted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BellEffect {
    Fetch { request: u64, mode: RefetchMode },
}

impl BellState {
    fn request(&mut self, mode: RefetchMode) -> Option<BellEffect> {
        self.latest_request += 1;
        self.phase = BellPhase::QueryPending;
        Some(BellEffect::Fetch {
            request: self.latest_request,
            mode,
        })
    }

    fn show(&mut self, count: i64) {
        let count = u64::try_from(count).unwrap_or(0);
        if self.phase != BellPhase::HasValue || self.unread_count != count {
            self.trigger += 1;
        }
        self.unread_count = count;
        self.has_value = true;
        self.phase = BellPhase::HasValue;
    }

    fn awaiting(&self) -> bool {
        self.latest_request > self.last_applied
    }

    pub fn display(&self) -> String {
        display(self.unread_count)
    }
}

pub fn reduce(state: &mut BellState, event: BellEvent) -> Option<BellEffect> {
    if !state.mounted && event != BellEvent::Mounted {
        return None;
    }

    match event {
        BellEvent::Mounted => {
            if state.mounted {
                return None;
            }
            state.mounted = true;
            state.request(RefetchMode::Stale)
        }
        BellEvent::QueryResult { request, count } => {
            if request != state.latest_request || request <= state.last_applied {
                debug!(request, latest = state.latest_request, "discarding stale unread count");
                return None;
            }
            state.last_applied = request;
            state.show(count);
            None
        }
        BellEvent::QueryFailed { request } => {
            if request == state.latest_request && state.awaiting() {
                state.last_applied = request;
                state.phase = if state.has_value {
                    BellPhase::HasValue
                } else {
                    BellPhase::Idle
                };
            }
            None
        }
        BellEvent::CacheUpdated { count } => {
            state.show(count);
            None
        }
        BellEvent::PushReceived => state.request(RefetchMode::Stale),
        BellEvent::ManualRefresh => state.request(RefetchMode::Always),
        BellEvent::ToggleDropdown => {
            state.is_dropdown_open = !state.is_dropdown_open;
            None
        }
        BellEvent::Unmounted => {
            // request ids keep counting so late responses stay discarded
            *state = BellState {
                trigger: state.trigger,
                latest_request: state.latest_request,
                last_applied: state.latest_request,
                ..BellState::default()
            };
            None
        }
    }
}

pub fn display(count: u64) -> String {
    if count > BADGE_CAP {
        format!("{BADGE_CAP}+")
    } else {
        count.to_string()
    }
}

pub fn parse_unread_count(body: &Value) -> Option<i64> {
    let inner = response_data(body);
    inner
        .get("unreadCount")
        .and_then(Value::as_i64)
        .or_else(|| inner.as_i64())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BellSnapshot {
    pub unread_count: u64,
    pub is_dropdown_open: bool,
    pub trigger: u64,
    pub phase: BellPhase,
}

impl From<&BellState> for BellSnapshot {
    fn from(state: &BellState) -> Self {
        Self {
            unread_count: state.unread_count,
            is_dropdown_open: state.is_dropdown_open,
            trigger: state.trigger,
            phase: state.phase,
        }
    }
}

/// A mounted bell; dropping it unmounts.
pub struct NotificationBell {
    events: mpsc::UnboundedSender<BellEvent>,
    snapshot: watch::Receiver<BellSnapshot>,
    cancel: CancellationToken,
    registry: Arc<SubscriptionRegistry>,
    handler: RefreshHandler,
    _observer: QueryObserver,
}

impl NotificationBell {
    // requires a runtime, unlike refresh handlers which may fire from any thread
    pub fn mount(
        cache: Arc<QueryCache>,
        registry: Arc<SubscriptionRegistry>,
        query_fn: Arc<dyn QueryFn>,
    ) -> Self {
        let key = unread_count_key();
        let observer = cache.observe(key.clone(), query_fn);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (snapshot_tx, snapshot) = watch::channel(BellSnapshot::default());
        let cancel = CancellationToken::new();

        // invalidate before signalling so every refetch of this push dedupes
        let handler: RefreshHandler = {
            let cache = cache.clone();
            let key = key.clone();
            let events = events_tx.clone();
            Arc::new(move || {
                cache.invalidate_prefix(&key);
                let _ = events.send(BellEvent::PushReceived);
            })
        };
        registry.on_refresh(Target::Notification, handler.clone());

        let cache_events = BroadcastStream::new(cache.subscribe());
        let _ = events_tx.send(BellEvent::Mounted);
        if let Some(count) = cache.get(&key).as_ref().and_then(parse_unread_count) {
            let _ = events_tx.send(BellEvent::CacheUpdated { count });
        }

        let driver = BellDriver {
            cache,
            key,
            events: events_tx.clone(),
            snapshot: snapshot_tx,
        };
        tokio::spawn(driver.run(events_rx, cache_events, cancel.clone()));

        Self {
            events: events_tx,
            snapshot,
            cancel,
            registry,
            handler,
            _observer: observer,
        }
    }

    pub fn unread_count(&self) -> u64 {
        self.snapshot.borrow().unread_count
    }

    pub fn is_dropdown_open(&self) -> bool {
        self.snapshot.borrow().is_dropdown_open
    }

    pub fn display(&self) -> String {
        display(self.unread_count())
    }

    pub fn toggle_dropdown(&self) {
        let _ = self.events.send(BellEvent::ToggleDropdown);
    }

    pub fn force_refresh(&self) {
        let _ = self.events.send(BellEvent::ManualRefresh);
    }

    pub fn snapshot(&self) -> BellSnapshot {
        *self.snapshot.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BellSnapshot> {
        self.snapshot.clone()
    }
}

impl Drop for NotificationBell {
    fn drop(&mut self) {
        self.registry.off_refresh(Target::Notification, &self.handler);
        let _ = self.events.send(BellEvent::Unmounted);
        self.cancel.cancel();
    }
}

struct BellDriver {
    cache: Arc<QueryCache>,
    key: QueryKey,
    events: mpsc::UnboundedSender<BellEvent>,
    snapshot: watch::Sender<BellSnapshot>,
}

impl BellDriver {
    async fn run(
        self,
        mut events: mpsc::UnboundedReceiver<BellEvent>,
        mut cache_events: BroadcastStream<CacheEvent>,
        cancel: CancellationToken,
    ) {
        let mut state = BellState::default();

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                Some(event) = events.recv() => event,
                Some(update) = cache_events.next() => match update {
                    Ok(CacheEvent::Updated { key, data }) if key == self.key => {
                        match parse_unread_count(&data) {
                            Some(count) => BellEvent::CacheUpdated { count },
                            None => continue,
                        }
                    }
                    Ok(_) => continue,
                    Err(BroadcastStreamRecvError::Lagged(skipped)) => {
                        warn!(skipped, "bell lagged behind cache updates, refetching");
                        BellEvent::PushReceived
                    }
                },
            };

            if let Some(effect) = reduce(&mut state, event) {
                self.execute(effect);
            }
            let next = BellSnapshot::from(&state);
            self.snapshot.send_if_modified(|current| {
                let changed = *current != next;
                *current = next;
                changed
            });
        }
        debug!("notification bell stopped");
    }

    fn execute(&self, effect: BellEffect) {
        let BellEffect::Fetch { request, mode } = effect;
        let cache = self.cache.clone();
        let key = self.key.clone();
        let events = self.events.clone();

        tokio::spawn(async move {
            let outcome = match cache.refetch(&key, mode).await {
                Ok(Some(data)) => match parse_unread_count(&data) {
                    Some(count) => BellEvent::QueryResult { request, count },
                    None => {
                        warn!(%key, "unread count response without a count");
                        BellEvent::QueryFailed { request }
                    }
                },
                Ok(None) => BellEvent::QueryFailed { request },
                Err(e) => {
                    warn!(%key, error = %e, "unread count fetch failed");
                    BellEvent::QueryFailed { request }
                }
            };
            let _ = events.send(outcome);
        });
    }
}
