use std::sync::Arc;

use tracing::{debug, info};

pub mod api_client;
pub mod bell;
pub mod cache;
pub mod config;
pub mod connection;
pub mod credentials;
pub mod refresh;
pub mod registry;
pub mod sockjs;
pub mod status;
pub mod stomp;
pub mod transport;
pub mod types;

use api_client::{ApiClient, ApiQuery, HttpApiClient};
use bell::NotificationBell;
use cache::{QueryCache, QueryObserver, RefetchMode};
use config::Config;
use connection::{ConnectError, ConnectionManager, ConnectionSettings, ConnectionState};
use credentials::{CredentialStore, FileCredentials};
use refresh::{EventGuard, RefreshCoordinator, RefreshGuard};
use registry::{RefreshHandler, SubscriptionRegistry};
use transport::{Connector, Framing, WsConnector};
use types::{QueryKey, Target};

pub struct RealtimeClient {
    config: Config,
    registry: Arc<SubscriptionRegistry>,
    cache: Arc<QueryCache>,
    connection: Arc<ConnectionManager>,
    coordinator: RefreshCoordinator,
    api: Arc<dyn ApiClient>,
}

impl RealtimeClient {
    pub fn init(config: Config) -> anyhow::Result<Arc<Self>> {
        let credentials: Arc<dyn CredentialStore> =
            Arc::new(FileCredentials::new(&config.credentials_path));
        let framing = if config.ws_sockjs {
            Framing::SockJs
        } else {
            Framing::Raw
        };
        let connector = Arc::new(WsConnector::new(framing));
        let api = Arc::new(HttpApiClient::new(
            config.api_base_url.clone(),
            credentials.clone(),
        )?);
        Ok(Self::with_parts(config, connector, credentials, api))
    }

    pub fn with_parts(
        config: Config,
        connector: Arc<dyn Connector>,
        credentials: Arc<dyn CredentialStore>,
        api: Arc<dyn ApiClient>,
    ) -> Arc<Self> {
        let registry = Arc::new(SubscriptionRegistry::new());
        let cache = Arc::new(QueryCache::new());
        let connection = ConnectionManager::new(
            ConnectionSettings::from_config(&config),
            connector,
            credentials,
            registry.clone(),
        );
        let coordinator = RefreshCoordinator::new(registry.clone(), cache.clone());
        info!(ws = %config.ws_base_url, api = %config.api_base_url, "realtime client initialized");

        Arc::new(Self {
            config,
            registry,
            cache,
            connection,
            coordinator,
            api,
        })
    }

    pub async fn connect(&self) -> Result<(), ConnectError> {
        self.connection.connect().await
    }

    pub fn disconnect(&self) {
        self.connection.disconnect();
    }

    pub fn reconnect(&self) {
        self.connection.reconnect();
    }

    pub fn get_connection_status(&self) -> bool {
        self.connection.get_connection_status()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn on_refresh(&self, target: Target, handler: RefreshHandler) {
        self.registry.on_refresh(target, handler);
    }

    pub fn off_refresh(&self, target: Target, handler: &RefreshHandler) {
        self.registry.off_refresh(target, handler);
    }

    pub fn subscribe_channel(&self, channel: &str) {
        self.connection.subscribe_channel(channel);
    }

    pub fn unsubscribe_channel(&self, channel: &str) {
        self.connection.unsubscribe_channel(channel);
    }

    pub fn use_wallet_refresh(&self) -> RefreshGuard {
        self.coordinator.use_wallet_refresh()
    }

    pub fn use_booking_refresh(&self) -> RefreshGuard {
        self.coordinator.use_booking_refresh()
    }

    pub fn use_vehicle_refresh(&self) -> RefreshGuard {
        self.coordinator.use_vehicle_refresh()
    }

    pub fn use_notification_refresh(&self) -> RefreshGuard {
        self.coordinator.use_notification_refresh()
    }

    pub fn use_event_invalidation(&self) -> EventGuard {
        self.coordinator.use_event_invalidation()
    }

    /// Spawns the bell's driver task; panics outside a tokio runtime.
    pub fn notification_bell(&self) -> NotificationBell {
        let query = ApiQuery::new(self.api.clone(), self.config.unread_count_path.clone());
        NotificationBell::mount(self.cache.clone(), self.registry.clone(), query)
    }

    /// Observes `key`, loaded from the API `path`, and spawns its first fetch.
    /// Panics outside a tokio runtime.
    pub fn watch_query(&self, key: QueryKey, path: &str) -> QueryObserver {
        let observer = self
            .cache
            .observe(key.clone(), ApiQuery::new(self.api.clone(), path));
        let cache = self.cache.clone();
        tokio::spawn(async move {
            if let Err(e) = cache.refetch(&key, RefetchMode::Stale).await {
                debug!(%key, error = %e, "initial fetch failed");
            }
        });
        observer
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    pub fn registry(&self) -> &Arc<SubscriptionRegistry> {
        &self.registry
    }

    pub fn connection(&self) -> &Arc<ConnectionManager> {
        &self.connection
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Disconnects, drops every handler and empties the cache.
    pub fn teardown(&self) {
        self.connection.disconnect();
        for key in self.cache.keys() {
            self.cache.remove(&key);
        }
        info!("realtime client torn down");
    }
}
