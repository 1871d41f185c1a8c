//! Gateway surface over the Peal signaling core.
//!
//! HTTP routes for the call operations, a WebSocket that streams record
//! snapshots to bound participants, session-token identity resolution, and
//! the background sweep that turns stale rings into missed calls.

#![forbid(unsafe_code)]

use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::State,
    http::{header, HeaderName, Method},
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};

use peal_core::CallService;

pub mod auth;
pub mod calls;
pub mod ws;

#[derive(Clone)]
pub struct AppState {
    pub pool: SqlitePool,
    pub service: Arc<CallService>,
    pub connections: ws::ConnectionMap,
}

impl axum::extract::FromRef<AppState> for SqlitePool {
    fn from_ref(state: &AppState) -> Self {
        state.pool.clone()
    }
}

impl axum::extract::FromRef<AppState> for Arc<CallService> {
    fn from_ref(state: &AppState) -> Self {
        state.service.clone()
    }
}

impl axum::extract::FromRef<AppState> for ws::ConnectionMap {
    fn from_ref(state: &AppState) -> Self {
        state.connections.clone()
    }
}

#[derive(Serialize)]
struct RuntimeMetrics {
    active_ws_connections: usize,
    feed_subscribers: usize,
}

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let active_ws_connections = state.connections.read().await.len();
    Json(RuntimeMetrics {
        active_ws_connections,
        feed_subscribers: state.service.subscriber_count(),
    })
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(|| async { "Peal Gateway Online" }))
        .route("/health", get(health))
        .route("/calls/initiate", post(calls::initiate))
        .route("/calls/answer", post(calls::answer))
        .route("/calls/connected", post(calls::mark_connected))
        .route("/calls/candidate", post(calls::send_candidate))
        .route("/calls/decline", post(calls::decline))
        .route("/calls/end", post(calls::end))
        .route("/calls/details", get(calls::details))
        .route("/calls/active", get(calls::active))
        .route("/ws", get(ws::ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
                .allow_headers([
                    header::CONTENT_TYPE,
                    header::AUTHORIZATION,
                    HeaderName::from_static("x-session-token"),
                ]),
        )
        .with_state(state)
}

/// Periodically expire unanswered rings into `missed`.
pub fn spawn_ring_timeout_sweeper(service: Arc<CallService>, interval: Duration) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            match service.sweep_ring_timeouts().await {
                Ok(count) if count > 0 => {
                    tracing::info!("marked {} unanswered calls as missed", count)
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("ring timeout sweep failed: {}", err),
            }
        }
    });
}
