//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::db::{CacheClient, TimeSeriesClient};
use crate::ingest::IngestGateway;
use crate::query::QueryEngine;
use crate::scheduler::{CleanupEngine, LivenessMonitor};

use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub config: ServerConfig,
    pub gateway: IngestGateway,
    pub query: QueryEngine,
    pub cleanup: CleanupEngine,
    pub monitor: LivenessMonitor,
    pub series: Arc<dyn TimeSeriesClient>,
    pub cache: Arc<dyn CacheClient>,
}

/// HTTP front end over the ingest, query and cleanup services.
pub struct Server {
    state: AppState,
}

impl Server {
    pub fn new(state: AppState) -> Self {
        Self { state }
    }

    /// Build the router with all routes.
    fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            // Push
            .route("/api/v1/metrics", post(handlers::handle_push_metrics))
            .route("/api/v1/metrics/batch", post(handlers::handle_push_metrics_batch))
            .route("/api/v1/bandwidth", post(handlers::handle_push_bandwidth))
            .route("/api/v1/ping", post(handlers::handle_push_ping))
            // Queries
            .route("/api/v1/history", get(handlers::handle_history))
            .route("/api/v1/devices/status", get(handlers::handle_device_statuses))
            .route("/api/v1/devices/online", get(handlers::handle_online_devices))
            .route("/api/v1/devices/{id}/bandwidth", get(handlers::handle_bandwidth))
            .route("/api/v1/devices/{id}/ping", get(handlers::handle_ping))
            .route("/api/v1/devices/{id}/summary", get(handlers::handle_summary))
            .route("/api/v1/devices/{id}/liveness", get(handlers::handle_check_liveness))
            .route("/api/v1/traffic/total", get(handlers::handle_total_traffic))
            // Cleanup
            .route("/api/v1/devices/{id}/data", delete(handlers::handle_cleanup_device))
            .route(
                "/api/v1/devices/{id}/interfaces/{name}/data",
                delete(handlers::handle_cleanup_interface),
            )
            .route(
                "/api/v1/devices/{id}/ping-targets/data",
                delete(handlers::handle_cleanup_ping_target),
            )
            .route("/api/v1/cleanup", post(handlers::handle_cleanup_expired))
            .route("/health", get(handlers::handle_health))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .layer(DefaultBodyLimit::max(1024 * 1024)) // 1MB
            .with_state(self.state.clone())
    }

    /// Serve on the configured port until `shutdown` resolves.
    pub async fn start<F>(&self, shutdown: F) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.state.config.http_port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("Web server stopped");
        Ok(())
    }
}
