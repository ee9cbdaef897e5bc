//! Background maintenance
//!
//! A dedicated task checks the maintenance timers on its own tick, so cache
//! requests never pay for a save or a cleanup. Other parts of the server
//! reach it through a [`MaintenanceHandle`].

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::error::{ServerError, ServerResult};
use crate::service::{CacheService, MaintenanceTask};

/// How often the scheduler checks for due work
pub const DEFAULT_TICK: Duration = Duration::from_secs(1);

const QUEUE_CAPACITY: usize = 16;

/// Work accepted by the scheduler
#[derive(Debug)]
pub enum MaintenanceRequest {
    /// Run one task now; the sender is notified when it is done
    Run(MaintenanceTask, oneshot::Sender<()>),
    /// Save the index one last time and stop
    Shutdown(oneshot::Sender<()>),
}

/// Sending side of the scheduler's work queue
#[derive(Debug, Clone)]
pub struct MaintenanceHandle {
    tx: mpsc::Sender<MaintenanceRequest>,
}

impl MaintenanceHandle {
    /// Runs `task` on the scheduler and waits for it
    pub async fn run(&self, task: MaintenanceTask) -> ServerResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(MaintenanceRequest::Run(task, done_tx)).await?;
        done_rx
            .await
            .map_err(|_| ServerError::InternalError("Maintenance task dropped the request".to_string()))
    }

    /// Stops the scheduler after a final save
    pub async fn shutdown(&self) -> ServerResult<()> {
        let (done_tx, done_rx) = oneshot::channel();
        self.send(MaintenanceRequest::Shutdown(done_tx)).await?;
        done_rx
            .await
            .map_err(|_| ServerError::InternalError("Maintenance task stopped before saving".to_string()))
    }

    async fn send(&self, request: MaintenanceRequest) -> ServerResult<()> {
        self.tx
            .send(request)
            .await
            .map_err(|_| ServerError::InternalError("Maintenance channel closed".to_string()))
    }
}

/// Timer-driven owner of the maintenance work
pub struct MaintenanceScheduler;

impl MaintenanceScheduler {
    /// Starts the scheduler task for `service`
    pub fn spawn(service: Arc<CacheService>, tick: Duration) -> (MaintenanceHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let task = tokio::spawn(run_scheduler(service, tick, rx));
        (MaintenanceHandle { tx }, task)
    }
}

async fn run_scheduler(service: Arc<CacheService>, tick: Duration, mut rx: mpsc::Receiver<MaintenanceRequest>) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    info!(tick_ms = tick.as_millis() as u64, "Maintenance scheduler started");

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let ran = service.run_due_maintenance().await;
                if !ran.is_empty() {
                    debug!(tasks = ?ran, "Ran scheduled maintenance");
                }
            }
            request = rx.recv() => match request {
                Some(MaintenanceRequest::Run(task, done)) => {
                    service.run_maintenance(task).await;
                    let _ = done.send(());
                }
                Some(MaintenanceRequest::Shutdown(done)) => {
                    final_save(&service).await;
                    let _ = done.send(());
                    break;
                }
                None => {
                    final_save(&service).await;
                    break;
                }
            }
        }
    }

    info!("Maintenance scheduler stopped");
}

async fn final_save(service: &CacheService) {
    match service.save_now().await {
        Ok(bytes) => info!(bytes, "Saved cache index on shutdown"),
        Err(err) => warn!(error = %err, "Failed to save cache index on shutdown"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::MaintenanceMode;
    use crate::eviction::{EvictionEngine, RetentionPolicy};
    use crate::persistence::PersistenceManager;
    use crate::service::CacheSettings;
    use ctcache_content_store::InMemoryContentStore;
    use tempfile::TempDir;

    const START: f64 = 1_700_000_000.0;

    async fn service(dir: &TempDir, clock: Arc<ManualClock>) -> Arc<CacheService> {
        let settings = CacheSettings {
            maintenance_mode: MaintenanceMode::Background,
            ..CacheSettings::default()
        };
        Arc::new(
            CacheService::new(
                Arc::new(InMemoryContentStore::new()),
                PersistenceManager::new(dir.path().join("ctcache.json.gz")),
                EvictionEngine::new(RetentionPolicy::default(), u64::MAX),
                clock,
                settings,
            )
            .await,
        )
    }

    #[tokio::test]
    async fn test_tick_runs_due_cleanup() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let service = service(&dir, clock.clone()).await;
        let (handle, task) = MaintenanceScheduler::spawn(service.clone(), Duration::from_millis(10));

        clock.advance(61.0);
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(service.counters().await.cleanup_time, START + 61.0);

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_requested_task_runs_immediately() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let service = service(&dir, clock.clone()).await;
        let (handle, task) = MaintenanceScheduler::spawn(service.clone(), Duration::from_secs(3600));

        clock.advance(5.0);
        handle.run(MaintenanceTask::Save).await.unwrap();
        assert_eq!(service.counters().await.save_time, START + 5.0);
        assert!(dir.path().join("ctcache.json.gz").exists());

        handle.shutdown().await.unwrap();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_saves_and_closes_queue() {
        let dir = TempDir::new().unwrap();
        let clock = Arc::new(ManualClock::new(START));
        let service = service(&dir, clock).await;
        let (handle, task) = MaintenanceScheduler::spawn(service.clone(), Duration::from_secs(3600));

        service.store(&"a".repeat(40), b"x").await.unwrap();
        handle.shutdown().await.unwrap();
        task.await.unwrap();

        let restored = PersistenceManager::new(dir.path().join("ctcache.json.gz")).load().await;
        assert_eq!(restored.count(), 1);
        assert!(handle.run(MaintenanceTask::Save).await.is_err());
    }
}
