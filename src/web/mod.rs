//! Web server module.

mod handlers;

use crate::config::ServerConfig;
use crate::query::Queries;
use crate::scheduler::JobRegistry;

use axum::{routing::get, Router};
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub queries: Queries,
    pub jobs: Arc<JobRegistry>,
}

/// Read-only JSON API over the monitoring data.
pub struct Server {
    port: u16,
    state: AppState,
}

impl Server {
    pub fn new(config: &ServerConfig, queries: Queries, jobs: Arc<JobRegistry>) -> Self {
        Self {
            port: config.http_port,
            state: AppState { queries, jobs },
        }
    }

    /// Build the router with all routes.
    pub(crate) fn routes(&self) -> Router {
        let cors = CorsLayer::new().allow_origin(Any).allow_methods(Any);

        Router::new()
            .route("/api/targets/{id}", get(handlers::handle_target))
            .route("/api/targets/{id}/history", get(handlers::handle_history))
            .route("/api/targets/{id}/uptime", get(handlers::handle_uptime))
            .route("/api/targets/{id}/incidents", get(handlers::handle_incidents))
            .route("/api/targets/{id}/stats", get(handlers::handle_stats))
            .route("/api/targets/{id}/buckets", get(handlers::handle_buckets))
            .route("/api/jobs", get(handlers::handle_jobs))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(self.state.clone())
    }

    /// Start the server on the configured port.
    pub async fn start(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let router = self.routes();

        tracing::info!("Web server listening on {}", addr);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        axum::serve(listener, router).await?;

        Ok(())
    }
}
