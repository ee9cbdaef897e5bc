//! Server lifecycle
//!
//! Startup, serving and graceful shutdown of the ctcache server.

use axum::Router;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tracing::{error, info, warn};

use crate::api::{self, ApiState};
use crate::config::{MaintenanceMode, ServerConfig};
use crate::error::ServerResult;
use crate::maintenance::{MaintenanceScheduler, DEFAULT_TICK};
use crate::service::CacheService;

/// The ctcache server
#[derive(Debug)]
pub struct CtcacheServer {
    config: ServerConfig,
    service: Arc<CacheService>,
}

impl CtcacheServer {
    /// Prepares the directories and restores the cache index
    pub async fn new(config: ServerConfig) -> ServerResult<Self> {
        tokio::fs::create_dir_all(&config.static_dir).await?;
        let service = Arc::new(CacheService::from_config(&config).await?);

        if config.auth_key_writes.is_none() {
            warn!("No write key configured: uploads and /purge_cache are open to every client");
        }

        Ok(Self { config, service })
    }

    pub fn service(&self) -> Arc<CacheService> {
        self.service.clone()
    }

    /// Router serving this server's cache
    pub fn router(&self) -> Router {
        api::build_router(Arc::new(ApiState::new(
            self.service.clone(),
            self.config.auth_key_writes.clone(),
        )))
    }

    /// Serves until Ctrl-C
    pub async fn run(self) -> ServerResult<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Serves until `shutdown` completes, then saves the index one last time
    pub async fn run_until<F>(self, shutdown: F) -> ServerResult<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Starting ctcache server");

        let listener = TcpListener::bind(self.config.bind_address()).await?;
        info!("Listening on {}", listener.local_addr()?);

        let scheduler = match self.config.maintenance_mode {
            MaintenanceMode::Background => Some(MaintenanceScheduler::spawn(self.service.clone(), DEFAULT_TICK)),
            MaintenanceMode::Inline => None,
        };

        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await;
        if let Err(err) = &served {
            error!(error = %err, "Server stopped with an error");
        }

        match scheduler {
            Some((handle, task)) => {
                if let Err(err) = handle.shutdown().await {
                    warn!(error = %err, "Maintenance scheduler did not shut down cleanly");
                }
                if let Err(err) = task.await {
                    warn!(error = %err, "Maintenance task panicked");
                }
            }
            None => match self.service.save_now().await {
                Ok(bytes) => info!(bytes, "Saved cache index on shutdown"),
                Err(err) => warn!(error = %err, "Failed to save cache index on shutdown"),
            },
        }

        info!("ctcache server stopped");
        served?;
        Ok(())
    }
}

async fn shutdown_signal() {
    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, shutting down gracefully"),
        Err(err) => {
            error!(error = %err, "Unable to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    }
}
