//! Engine state and lifecycle

use crate::api::ApiServer;
use crate::config::EngineConfig;
use crate::db::CandleStore;
use crate::error::Result;
use crate::scheduler::{MaintenanceSchedule, MaintenanceScheduler};
use crate::services::CandleSyncService;
use crate::upstream::CandleFetcher;
use crate::writer::BatchWriter;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::info;

/// Everything a running engine owns, wired together
pub struct CandleEngine {
    pub config: EngineConfig,
    pub store: Arc<CandleStore>,
    pub writer: Arc<BatchWriter>,
    pub maintenance: Option<Arc<MaintenanceScheduler>>,
    pub service: Arc<CandleSyncService>,
    api: parking_lot::Mutex<Option<ApiServer>>,
}

impl CandleEngine {
    /// Open the store and start the background writer and maintenance tasks.
    /// Must be called from within a tokio runtime.
    pub fn start(config: EngineConfig, fetcher: Arc<dyn CandleFetcher>) -> Result<Self> {
        config.validate()?;

        let store = Arc::new(CandleStore::open(&config.store)?);

        let writer = Arc::new(BatchWriter::new(store.clone(), config.writer.clone()));
        writer.start();

        let maintenance = if config.maintenance.enabled {
            let scheduler = Arc::new(MaintenanceScheduler::new(
                store.clone(),
                MaintenanceSchedule::from(&config.maintenance),
            ));
            scheduler.start();
            Some(scheduler)
        } else {
            info!("Store maintenance disabled");
            None
        };

        let mut service = CandleSyncService::new(store.clone(), writer.clone(), fetcher, &config);
        if let Some(scheduler) = &maintenance {
            service = service.with_maintenance(scheduler.clone());
        }

        info!("Candle engine started with store {:?}", store.path());
        Ok(Self {
            config,
            store,
            writer,
            maintenance,
            service: Arc::new(service),
            api: parking_lot::Mutex::new(None),
        })
    }

    /// Start the HTTP API when enabled in config
    pub async fn start_api(&self) -> Result<Option<SocketAddr>> {
        if !self.config.api.enabled {
            info!("Query API is disabled");
            return Ok(None);
        }
        let mut server = ApiServer::new(self.service.clone());
        let addr = server.start(&self.config.api).await?;
        *self.api.lock() = Some(server);
        Ok(Some(addr))
    }

    /// Stop the API, drain the writer, then stop maintenance
    pub async fn shutdown(&self) {
        if let Some(mut server) = self.api.lock().take() {
            server.stop();
        }
        self.writer.shutdown().await;
        if let Some(scheduler) = &self.maintenance {
            scheduler.shutdown().await;
        }
        info!("Candle engine stopped");
    }
}
