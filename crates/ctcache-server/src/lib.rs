//!
//! ctcache server - shared result cache for clang-tidy
//!
//! Clients ask whether a content hash is cached, fetch cached results and
//! upload new ones. The server tracks usage, saves its index periodically,
//! evicts stale or oversized content and reports statistics.

/// API module
pub mod api;

/// Charts module
pub mod charts;

/// Time source module
pub mod clock;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

/// Eviction module
pub mod eviction;

/// Cache index module
pub mod index;

/// Background maintenance module
pub mod maintenance;

/// Persistence module
pub mod persistence;

/// Server module
pub mod server;

/// Cache service module
pub mod service;

/// Statistics module
pub mod stats;

// Re-export key types
pub use config::{MaintenanceMode, ServerConfig};
pub use error::{ServerError, ServerResult};
pub use server::CtcacheServer;
pub use service::{CacheService, CacheSettings, MaintenanceTask};

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    // Initialize logging
    init_logging(&config);
    config.log_summary();

    let server = CtcacheServer::new(config).await?;
    server.run().await
}

/// Initialize logging
fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    // A subscriber installed earlier, e.g. by a test harness, stays in place
    let installed = if config.json_logs {
        fmt().json().with_env_filter(filter).with_current_span(true).try_init()
    } else {
        fmt().with_env_filter(filter).with_target(true).try_init()
    };
    if installed.is_err() {
        tracing::debug!("Global subscriber already set, keeping it");
    }
}
