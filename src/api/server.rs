//! HTTP server for the query API

use super::handlers;
use crate::config::ApiConfig;
use crate::error::{Result, SyncError};
use crate::services::CandleSyncService;
use axum::{
    routing::{get, post},
    Router,
};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::oneshot;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info};

/// Build the API router around a service
pub fn router(service: Arc<CandleSyncService>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .route("/health", get(handlers::health_check))
        .route("/", get(handlers::health_check))
        .route("/api/v1/candles", post(handlers::get_candles))
        .route("/api/v1/candles/upsert", post(handlers::upsert_candles))
        .route("/api/v1/queue/status", get(handlers::queue_status))
        .route("/api/v1/series", get(handlers::list_series))
        .route("/api/v1/timeframes", get(handlers::list_timeframes))
        .with_state(service)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

/// Query API server manager
pub struct ApiServer {
    service: Arc<CandleSyncService>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    local_addr: Option<SocketAddr>,
}

impl ApiServer {
    pub fn new(service: Arc<CandleSyncService>) -> Self {
        Self {
            service,
            shutdown_tx: None,
            local_addr: None,
        }
    }

    /// Bind and serve in a background task; returns the bound address
    pub async fn start(&mut self, config: &ApiConfig) -> Result<SocketAddr> {
        let addr: SocketAddr = format!("{}:{}", config.host, config.port)
            .parse()
            .map_err(|e| SyncError::Config(format!("Invalid API address: {}", e)))?;

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let app = router(self.service.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        self.shutdown_tx = Some(shutdown_tx);
        self.local_addr = Some(local_addr);

        tokio::spawn(async move {
            let server = axum::serve(listener, app).with_graceful_shutdown(async {
                let _ = shutdown_rx.await;
                info!("API server shutting down");
            });

            if let Err(e) = server.await {
                error!("API server error: {}", e);
            }
        });

        info!("Candle sync API listening on http://{}", local_addr);
        info!("  GET  /health");
        info!("  POST /api/v1/candles");
        info!("  POST /api/v1/candles/upsert");
        info!("  GET  /api/v1/queue/status");
        info!("  GET  /api/v1/series");
        info!("  GET  /api/v1/timeframes");
        Ok(local_addr)
    }

    pub fn stop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
            info!("API server stop signal sent");
        }
        self.local_addr = None;
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }
}

impl Drop for ApiServer {
    fn drop(&mut self) {
        self.stop();
    }
}
