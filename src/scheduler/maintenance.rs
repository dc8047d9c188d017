//! Store maintenance scheduler
//!
//! Runs WAL checkpoints, planner statistics refreshes and incremental
//! compaction on fixed intervals, each on its own background task. A failed
//! run is logged and the task keeps its schedule.

use crate::config::MaintenanceConfig;
use crate::db::CandleStore;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MaintenanceTask {
    Checkpoint,
    RefreshStatistics,
    Compaction,
}

impl MaintenanceTask {
    pub fn as_str(self) -> &'static str {
        match self {
            MaintenanceTask::Checkpoint => "checkpoint",
            MaintenanceTask::RefreshStatistics => "refresh_statistics",
            MaintenanceTask::Compaction => "compaction",
        }
    }
}

/// Last successful run of each task
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MaintenanceStatus {
    pub last_checkpoint: Option<DateTime<Utc>>,
    pub last_statistics_refresh: Option<DateTime<Utc>>,
    pub last_compaction: Option<DateTime<Utc>>,
    pub failures: u64,
    pub last_error: Option<String>,
}

/// Task intervals
#[derive(Debug, Clone, Copy)]
pub struct MaintenanceSchedule {
    pub checkpoint_every: Duration,
    pub statistics_every: Duration,
    pub compaction_every: Duration,
    pub compaction_pages: u32,
}

impl From<&MaintenanceConfig> for MaintenanceSchedule {
    fn from(config: &MaintenanceConfig) -> Self {
        Self {
            checkpoint_every: Duration::from_secs(config.checkpoint_interval_secs),
            statistics_every: Duration::from_secs(config.statistics_interval_secs),
            compaction_every: Duration::from_secs(config.compaction_interval_secs),
            compaction_pages: config.compaction_pages,
        }
    }
}

pub struct MaintenanceScheduler {
    store: Arc<CandleStore>,
    schedule: MaintenanceSchedule,
    status: Arc<RwLock<MaintenanceStatus>>,
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl MaintenanceScheduler {
    pub fn new(store: Arc<CandleStore>, schedule: MaintenanceSchedule) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            store,
            schedule,
            status: Arc::new(RwLock::new(MaintenanceStatus::default())),
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one background task per maintenance job
    pub fn start(&self) {
        let mut tasks = self.tasks.lock();
        if !tasks.is_empty() {
            return;
        }
        let plan = [
            (MaintenanceTask::Checkpoint, self.schedule.checkpoint_every),
            (MaintenanceTask::RefreshStatistics, self.schedule.statistics_every),
            (MaintenanceTask::Compaction, self.schedule.compaction_every),
        ];
        for (task, every) in plan {
            let store = self.store.clone();
            let status = self.status.clone();
            let pages = self.schedule.compaction_pages;
            let mut stop_rx = self.stop_tx.subscribe();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                // skip the immediate first tick
                ticker.tick().await;
                loop {
                    tokio::select! {
                        _ = ticker.tick() => {
                            execute(&store, &status, task, pages).await;
                        }
                        _ = stop_rx.changed() => break,
                    }
                }
                debug!("Maintenance task {} stopped", task.as_str());
            }));
        }
        info!(
            "Maintenance scheduler started (checkpoint {}s, statistics {}s, compaction {}s)",
            self.schedule.checkpoint_every.as_secs(),
            self.schedule.statistics_every.as_secs(),
            self.schedule.compaction_every.as_secs()
        );
    }

    /// Run one task immediately, outside its schedule
    pub async fn run_now(&self, task: MaintenanceTask) -> bool {
        execute(&self.store, &self.status, task, self.schedule.compaction_pages).await
    }

    pub fn status(&self) -> MaintenanceStatus {
        self.status.read().clone()
    }

    pub async fn shutdown(&self) {
        let _ = self.stop_tx.send(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in tasks {
            if let Err(e) = handle.await {
                warn!("Maintenance task ended abnormally: {}", e);
            }
        }
    }
}

/// Run a task on the blocking pool and record the outcome
async fn execute(
    store: &Arc<CandleStore>,
    status: &RwLock<MaintenanceStatus>,
    task: MaintenanceTask,
    pages: u32,
) -> bool {
    let worker = store.clone();
    let outcome = tokio::task::spawn_blocking(move || -> crate::error::Result<String> {
        match task {
            MaintenanceTask::Checkpoint => {
                let stats = worker.checkpoint()?;
                Ok(format!(
                    "{} of {} WAL frames checkpointed{}",
                    stats.checkpointed_frames,
                    stats.log_frames,
                    if stats.busy { " (busy)" } else { "" }
                ))
            }
            MaintenanceTask::RefreshStatistics => {
                worker.refresh_statistics()?;
                Ok("statistics refreshed".to_string())
            }
            MaintenanceTask::Compaction => {
                let free = worker.compact(pages)?;
                Ok(format!("{} free pages remaining", free))
            }
        }
    })
    .await
    .map_err(crate::error::SyncError::from)
    .and_then(|result| result);

    let now = Utc::now();
    let mut status = status.write();
    match outcome {
        Ok(detail) => {
            info!("Maintenance {}: {}", task.as_str(), detail);
            match task {
                MaintenanceTask::Checkpoint => status.last_checkpoint = Some(now),
                MaintenanceTask::RefreshStatistics => status.last_statistics_refresh = Some(now),
                MaintenanceTask::Compaction => status.last_compaction = Some(now),
            }
            true
        }
        Err(e) => {
            warn!("Maintenance {} failed: {}", task.as_str(), e);
            status.failures += 1;
            status.last_error = Some(format!("{}: {}", task.as_str(), e));
            false
        }
    }
}
