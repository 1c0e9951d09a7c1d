//! Status web server

use axum::routing::{get, post};
use axum::Router;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::config::UiConfig;
use crate::session::SessionController;
use crate::ui::{handlers, websocket};

/// Shared state for handlers
pub struct AppState {
    pub controller: SessionController,
    pub started: Instant,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/stats", get(handlers::get_stats))
        .route("/api/session/start", post(handlers::start_session))
        .route("/api/session/stop", post(handlers::stop_session))
        .route("/api/frames/overlay", get(handlers::get_overlay_frame))
        .route("/api/frames/remote", get(handlers::get_remote_frame))
        .route("/ws/status", get(websocket::status_ws))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

pub struct WebServer {
    config: UiConfig,
    state: Arc<AppState>,
}

impl WebServer {
    pub fn new(config: UiConfig, controller: SessionController) -> Self {
        Self {
            config,
            state: Arc::new(AppState {
                controller,
                started: Instant::now(),
            }),
        }
    }

    pub fn address(&self) -> SocketAddr {
        SocketAddr::new(self.config.bind_address, self.config.http_port)
    }

    pub async fn serve(self) -> crate::Result<()> {
        let addr = self.address();
        let listener = tokio::net::TcpListener::bind(addr).await?;
        tracing::info!("Status UI listening on http://{}", addr);
        axum::serve(listener, router(self.state)).await?;
        Ok(())
    }

    pub fn start_background(self) -> JoinHandle<()> {
        tokio::spawn(async move {
            if let Err(e) = self.serve().await {
                tracing::error!("Status UI failed: {}", e);
            }
        })
    }
}
