//! HTTP surface: backend control routes and the app ingress proxy.

mod handlers;

use axum::routing::{any, delete, get, post};
use axum::Router;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use crate::manager::BackendManager;
use crate::proxy::IngressProxy;

/// How long start and stop handlers wait before reporting the state
pub const SETTLE_DELAY: Duration = Duration::from_millis(200);

#[derive(Clone)]
pub struct AppState {
    pub manager: BackendManager,
    pub proxy: Arc<IngressProxy>,
    pub settle: Duration,
}

impl AppState {
    pub fn new(manager: BackendManager, proxy: IngressProxy) -> Self {
        Self {
            manager,
            proxy: Arc::new(proxy),
            settle: SETTLE_DELAY,
        }
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(handlers::health))
        .route("/api/apps/:id/backend/start", post(handlers::start))
        .route("/api/apps/:id/backend/stop", post(handlers::stop))
        .route("/api/apps/:id/backend/status", get(handlers::status))
        .route("/api/apps/:id/backend/activity", post(handlers::activity))
        .route("/api/apps/:id/backend/storage", delete(handlers::clear_storage))
        .route("/api/apps/:id/proxy", any(handlers::proxy_root))
        .route("/api/apps/:id/proxy/", any(handlers::proxy_root))
        .route("/api/apps/:id/proxy/*path", any(handlers::proxy))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
