use std::sync::Arc;

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;
use tokio::sync::watch;

use crate::bell::BellSnapshot;
use crate::connection::{ConnectionManager, ConnectionState};

pub struct StatusState {
    pub connection: Arc<ConnectionManager>,
    pub bell: watch::Receiver<BellSnapshot>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusBody {
    connected: bool,
    state: ConnectionState,
    unread_count: u64,
}

pub fn router(state: Arc<StatusState>) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/status", get(status))
        .with_state(state)
}

async fn status(State(state): State<Arc<StatusState>>) -> Json<StatusBody> {
    let connection = state.connection.state();
    Json(StatusBody {
        connected: connection == ConnectionState::Connected,
        state: connection,
        unread_count: state.bell.borrow().unread_count,
    })
}
