use std::sync::Arc;

use futures::future::join_all;
use serde_json::Value;
use tokio::runtime::Handle;
use tracing::debug;

use crate::cache::{QueryCache, RefetchMode};
use crate::registry::{EventHandler, RefreshHandler, SubscriptionRegistry};
use crate::types::{EventKind, QueryKey, RealtimeEvent, Target};

#[derive(Debug, Clone, Copy)]
pub struct FeatureRefresh {
    pub target: Target,
    pub prefixes: &'static [&'static str],
}

pub const WALLET: FeatureRefresh = FeatureRefresh {
    target: Target::Wallet,
    prefixes: &["wallet", "wallet-transactions", "user-wallet", "payments"],
};

pub const BOOKING: FeatureRefresh = FeatureRefresh {
    target: Target::Booking,
    prefixes: &["bookings", "booking", "user-bookings", "provider-bookings"],
};

pub const VEHICLE: FeatureRefresh = FeatureRefresh {
    target: Target::Vehicle,
    prefixes: &["vehicles", "vehicle", "user-vehicles"],
};

pub const NOTIFICATION: FeatureRefresh = FeatureRefresh {
    target: Target::Notification,
    prefixes: &["notifications"],
};

pub const FEATURES: [FeatureRefresh; 4] = [WALLET, BOOKING, VEHICLE, NOTIFICATION];

impl FeatureRefresh {
    pub fn keys(&self) -> Vec<QueryKey> {
        self.prefixes.iter().map(|p| QueryKey::new([*p])).collect()
    }
}

#[derive(Clone)]
pub struct RefreshCoordinator {
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<QueryCache>,
}

impl RefreshCoordinator {
    pub fn new(registry: Arc<SubscriptionRegistry>, cache: Arc<QueryCache>) -> Self {
        Self { registry, cache }
    }

    pub fn register(&self, feature: &FeatureRefresh) -> RefreshGuard {
        let cache = self.cache.clone();
        let prefixes = feature.keys();
        let target = feature.target;
        let handler: RefreshHandler = Arc::new(move || refresh_prefixes(&cache, &prefixes, target));

        self.registry.on_refresh(target, handler.clone());
        RefreshGuard {
            registry: self.registry.clone(),
            target,
            handler,
        }
    }

    pub fn use_wallet_refresh(&self) -> RefreshGuard {
        self.register(&WALLET)
    }

    pub fn use_booking_refresh(&self) -> RefreshGuard {
        self.register(&BOOKING)
    }

    pub fn use_vehicle_refresh(&self) -> RefreshGuard {
        self.register(&VEHICLE)
    }

    pub fn use_notification_refresh(&self) -> RefreshGuard {
        self.register(&NOTIFICATION)
    }

    /// Invalidates the entity keys a realtime event names in its payload,
    /// plus `[metadata.dataType]` for `DATA_UPDATE`.
    pub fn use_event_invalidation(&self) -> EventGuard {
        let cache = self.cache.clone();
        let handler: EventHandler = Arc::new(move |event: &RealtimeEvent| {
            let keys = event_keys(event);
            if !keys.is_empty() {
                refresh_prefixes(&cache, &keys, event.kind.clone());
            }
        });
        self.registry.on_any(handler.clone());
        EventGuard {
            registry: self.registry.clone(),
            handler,
        }
    }
}

fn refresh_prefixes(
    cache: &Arc<QueryCache>,
    prefixes: &[QueryKey],
    source: impl std::fmt::Display + Send + 'static,
) {
    // everything under the prefixes is stale now, so a stale-mode refetch
    // covers every active entry
    for prefix in prefixes {
        cache.invalidate_prefix(prefix);
    }

    let Ok(runtime) = Handle::try_current() else {
        debug!(source = %source, "no runtime, refetch skipped");
        return;
    };
    let cache = cache.clone();
    let prefixes = prefixes.to_vec();
    runtime.spawn(async move {
        let refreshed: usize = join_all(
            prefixes
                .iter()
                .map(|prefix| cache.refetch_active(prefix, RefetchMode::Stale)),
        )
        .await
        .into_iter()
        .sum();
        debug!(source = %source, refreshed, "refresh complete");
    });
}

fn event_keys(event: &RealtimeEvent) -> Vec<QueryKey> {
    let mut keys = Vec::new();
    if let Some(id) = id_field(&event.payload, "bookingId") {
        keys.push(QueryKey::new(["booking".to_string(), id]));
    }
    if let Some(id) = id_field(&event.payload, "vehicleId") {
        keys.push(QueryKey::new(["vehicle".to_string(), id]));
    }
    if event.kind == EventKind::DataUpdate {
        if let Some(data_type) = event.metadata.get("dataType").and_then(Value::as_str) {
            keys.push(QueryKey::new([data_type]));
        }
    }
    keys
}

fn id_field(payload: &Value, name: &str) -> Option<String> {
    match payload.get(name)? {
        Value::String(s) if !s.is_empty() => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

pub struct RefreshGuard {
    registry: Arc<SubscriptionRegistry>,
    target: Target,
    handler: RefreshHandler,
}

impl RefreshGuard {
    pub fn target(&self) -> Target {
        self.target
    }
}

impl Drop for RefreshGuard {
    fn drop(&mut self) {
        self.registry.off_refresh(self.target, &self.handler);
    }
}

pub struct EventGuard {
    registry: Arc<SubscriptionRegistry>,
    handler: EventHandler,
}

impl Drop for EventGuard {
    fn drop(&mut self) {
        self.registry.off_any(&self.handler);
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::{json, Map};

    use super::*;
    use crate::cache::tests::CountingQuery;
    use crate::types::{Envelope, RefreshAction, RefreshEnvelope};

    fn push(target: Target) -> Envelope {
        Envelope::Refresh(RefreshEnvelope {
            target,
            action: RefreshAction::Refresh,
            kind: "REFRESH".into(),
            user_id: Some("7".into()),
            message: None,
            data: None,
        })
    }

    fn setup() -> (Arc<SubscriptionRegistry>, Arc<QueryCache>, RefreshCoordinator) {
        let registry = Arc::new(SubscriptionRegistry::new());
        let cache = Arc::new(QueryCache::new());
        let coordinator = RefreshCoordinator::new(registry.clone(), cache.clone());
        (registry, cache, coordinator)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    #[tokio::test]
    async fn wallet_push_refetches_only_active_wallet_entries() {
        let (registry, cache, coordinator) = setup();
        let _guard = coordinator.use_wallet_refresh();

        let balance = CountingQuery::new(vec![json!(100), json!(80)]);
        let history = CountingQuery::new(vec![json!([])]);
        let bookings = CountingQuery::new(vec![json!([])]);
        let balance_key = QueryKey::new(["wallet", "balance"]);
        let history_key = QueryKey::new(["payments", "history"]);
        let bookings_key = QueryKey::new(["bookings", "list"]);
        let _b = cache.observe(balance_key.clone(), balance.clone());
        let _h = cache.observe(history_key.clone(), history.clone());
        let _k = cache.observe(bookings_key.clone(), bookings.clone());
        for key in [&balance_key, &history_key, &bookings_key] {
            cache.refetch(key, RefetchMode::Stale).await.unwrap();
        }
        let unobserved = QueryKey::new(["wallet-transactions", "page-1"]);
        cache.set_query_data(unobserved.clone(), json!([]));

        assert_eq!(registry.dispatch(&push(Target::Wallet)), 1);
        settle().await;

        assert_eq!(balance.calls(), 2);
        assert_eq!(history.calls(), 2);
        assert_eq!(bookings.calls(), 1);
        assert_eq!(cache.get(&balance_key), Some(json!(80)));
        assert!(cache.snapshot(&unobserved).unwrap().stale);
    }

    #[tokio::test]
    async fn back_to_back_pushes_fetch_once() {
        let (registry, cache, coordinator) = setup();
        let _guard = coordinator.use_notification_refresh();
        let query = CountingQuery::new(vec![json!(1), json!(2), json!(3)]);
        let key = QueryKey::new(["notifications", "list"]);
        let _observer = cache.observe(key.clone(), query.clone());
        cache.refetch(&key, RefetchMode::Stale).await.unwrap();

        registry.dispatch(&push(Target::Notification));
        registry.dispatch(&push(Target::Notification));
        settle().await;

        assert_eq!(query.calls(), 2);
        assert_eq!(cache.get(&key), Some(json!(2)));
    }

    #[tokio::test]
    async fn dropped_guard_stops_refreshing() {
        let (registry, cache, coordinator) = setup();
        let guard = coordinator.use_vehicle_refresh();
        let query = CountingQuery::new(vec![json!({})]);
        let key = QueryKey::new(["vehicles"]);
        let _observer = cache.observe(key.clone(), query.clone());
        cache.refetch(&key, RefetchMode::Stale).await.unwrap();

        drop(guard);
        assert_eq!(registry.handler_count(Target::Vehicle), 0);
        assert_eq!(registry.dispatch(&push(Target::Vehicle)), 0);
        settle().await;

        assert_eq!(query.calls(), 1);
        assert!(!cache.snapshot(&key).unwrap().stale);
    }

    #[test]
    fn handler_without_runtime_still_invalidates() {
        let (registry, cache, coordinator) = setup();
        let _guard = coordinator.use_booking_refresh();
        let key = QueryKey::new(["provider-bookings", "3"]);
        cache.set_query_data(key.clone(), json!([]));

        registry.dispatch(&push(Target::Booking));
        assert!(cache.snapshot(&key).unwrap().stale);
    }

    #[tokio::test]
    async fn events_invalidate_named_entities() {
        let (registry, cache, coordinator) = setup();
        let _guard = coordinator.use_event_invalidation();
        let booking = QueryKey::new(["booking", "12"]);
        let other_booking = QueryKey::new(["booking", "13"]);
        let reports = QueryKey::new(["reports", "monthly"]);
        for key in [&booking, &other_booking, &reports] {
            cache.set_query_data(key.clone(), json!({}));
        }

        let mut metadata = Map::new();
        metadata.insert("dataType".into(), json!("reports"));
        registry.dispatch(&Envelope::Event(RealtimeEvent {
            kind: EventKind::DataUpdate,
            payload: json!({ "bookingId": 12 }),
            metadata,
            timestamp: "2025-01-01T00:00:00Z".into(),
        }));

        assert!(cache.snapshot(&booking).unwrap().stale);
        assert!(cache.snapshot(&reports).unwrap().stale);
        assert!(!cache.snapshot(&other_booking).unwrap().stale);
    }

    #[test]
    fn feature_prefixes_do_not_overlap() {
        let mut all: Vec<&str> = FEATURES.iter().flat_map(|f| f.prefixes.iter().copied()).collect();
        let total = all.len();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), total);
    }
}
