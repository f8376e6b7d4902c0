pub mod handlers;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;

use crate::supervisor::{MonitorSnapshot, Supervisor};
use handlers::profile::*;

/// GET /api/status 응답
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusResponse {
    pub profiles: Vec<MonitorSnapshot>,
}

/// GET /api/profile/:name/console 쿼리
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConsoleQuery {
    pub since: Option<u64>,
    pub count: Option<usize>,
}

/// IPC Server State
#[derive(Clone)]
pub struct IPCServer {
    pub supervisor: Arc<Supervisor>,
    pub listen_addr: String,
}

impl IPCServer {
    pub fn new(supervisor: Arc<Supervisor>, listen_addr: &str) -> Self {
        Self {
            supervisor,
            listen_addr: listen_addr.to_string(),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/api/status", get(status_handler))
            .route("/api/profiles", get(list_profiles).post(create_profile))
            .route(
                "/api/profile/:name",
                get(get_profile).put(update_profile).delete(delete_profile),
            )
            .route("/api/profile/:name/start", post(start_profile_handler))
            .route("/api/profile/:name/stop", post(stop_profile_handler))
            .route("/api/profile/:name/restart", post(restart_profile_handler))
            .route("/api/profile/:name/usage", get(usage_handler))
            .route("/api/profile/:name/console", get(console_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.clone())
    }

    /// Serve until `shutdown` resolves.
    pub async fn start(self, shutdown: impl Future<Output = ()> + Send + 'static) -> Result<()> {
        tracing::info!("IPC HTTP server starting on {}", self.listen_addr);

        let router = self.router();
        let listener = tokio::net::TcpListener::bind(&self.listen_addr).await?;
        tracing::info!("IPC listening on http://{}", self.listen_addr);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;
        tracing::info!("IPC server stopped");
        Ok(())
    }
}
