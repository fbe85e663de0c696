//! Local preview and status server
//!
//! | Path | Description |
//! |------|-------------|
//! | `GET /api/status` | Session state and live counters |
//! | `GET /api/preview` | Latest snapshot as `image/jpeg`, 204 when none |
//! | `GET /api/devices` | Monitors and audio outputs |
//! | `GET /api/events` | WebSocket pushing status on every change |
//! | `POST /api/session/stop` | Stop the running session |

use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;

use crate::config::UiConfig;
use crate::error::{Error, Result};
use crate::ui::handlers::{self, UiState};

/// Build the API router
pub fn router(state: Arc<UiState>) -> Router {
    Router::new()
        .route("/api/status", get(handlers::get_status))
        .route("/api/preview", get(handlers::get_preview))
        .route("/api/devices", get(handlers::get_devices))
        .route("/api/events", get(handlers::status_socket))
        .route("/api/session/stop", post(handlers::stop_session))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Running server; stops when dropped
pub struct WebServer {
    addr: SocketAddr,
    task: JoinHandle<()>,
}

impl WebServer {
    /// Bind and start serving in the background
    pub async fn start(config: &UiConfig, state: Arc<UiState>) -> Result<Self> {
        let bind = format!("{}:{}", config.bind_address, config.http_port);
        let listener = tokio::net::TcpListener::bind(&bind)
            .await
            .map_err(|e| Error::Config(format!("cannot bind preview server to {}: {}", bind, e)))?;
        let addr = listener.local_addr()?;

        let app = router(state);
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!("Preview server error: {}", e);
            }
        });

        tracing::info!("Preview server listening on http://{}", addr);
        Ok(Self { addr, task })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn stop(&self) {
        self.task.abort();
    }
}

impl Drop for WebServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}
