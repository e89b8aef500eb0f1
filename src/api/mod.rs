//! Subscription API surface (§6): a WebSocket for `open_subscription` and an
//! HTTP route for registering a trigger at runtime, wired together the way
//! this codebase's server wires its receiver/forwarder routes.

pub mod ws;

use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::watch;
use tower_http::trace::TraceLayer;

use crate::cache::SourceCache;
use crate::schema::SchemaRegistry;

#[derive(Clone)]
pub struct AppState {
    pub sources: Arc<HashMap<String, Arc<SourceCache>>>,
    pub schema: Arc<SchemaRegistry>,
    pub subscriber_queue_capacity: usize,
    pub trigger_queue_capacity: usize,
    /// Triggers registered at runtime watch this to drain and exit on
    /// process shutdown, the same as triggers configured at startup.
    pub shutdown: watch::Receiver<bool>,
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/subscribe", get(ws::subscribe_handler))
        .route("/triggers", post(ws::register_trigger))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn readyz(axum::extract::State(state): axum::extract::State<AppState>) -> impl axum::response::IntoResponse {
    let all_ready = state.sources.values().all(|c| c.is_ready());
    if all_ready {
        (axum::http::StatusCode::OK, "ready")
    } else {
        (axum::http::StatusCode::SERVICE_UNAVAILABLE, "snapshotting")
    }
}
