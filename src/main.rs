use std::{net::SocketAddr, sync::Arc};

use rft_realtime::{
    config::Config,
    status::{self, StatusState},
    types::QueryKey,
    RealtimeClient,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

// Feature data kept warm so pushes have something to refetch.
const WATCHED: [(&[&str], &str); 3] = [
    (&["notifications", "list"], "/notifications/my"),
    (&["user-wallet", "balance"], "/wallets/balance"),
    (&["user-vehicles", "mine"], "/vehicle-rent/my-vehicles"),
];

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Config::from_env()?;
    let bind_addr = config.status_bind_addr.clone();
    let client = RealtimeClient::init(config)?;

    let _features = [
        client.use_wallet_refresh(),
        client.use_booking_refresh(),
        client.use_vehicle_refresh(),
        client.use_notification_refresh(),
    ];
    let _events = client.use_event_invalidation();
    let _watched: Vec<_> = WATCHED
        .iter()
        .map(|(key, path)| client.watch_query(QueryKey::new(key.iter().copied()), path))
        .collect();

    let bell = client.notification_bell();
    let mut bell_updates = bell.subscribe();
    tokio::spawn(async move {
        while bell_updates.changed().await.is_ok() {
            let snapshot = *bell_updates.borrow_and_update();
            info!(
                unread = snapshot.unread_count,
                badge = %rft_realtime::bell::display(snapshot.unread_count),
                "unread notifications changed"
            );
        }
    });

    let connecting = client.clone();
    tokio::spawn(async move {
        match connecting.connect().await {
            Ok(()) => info!("push connection established"),
            Err(e) => warn!(error = %e, "initial push connection failed, retrying in background"),
        }
    });

    let router = status::router(Arc::new(StatusState {
        connection: client.connection().clone(),
        bell: bell.subscribe(),
    }));

    let addr: SocketAddr = bind_addr.parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!("status endpoint listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|e| {
            error!(error = %e, "status server failed");
            e
        })?;

    drop(bell);
    client.teardown();
    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
    info!("shutdown signal received");
}
