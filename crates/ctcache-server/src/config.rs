//! Configuration for the ctcache server
//!
//! Options come from the command line, each with a `CTCACHE_*` environment
//! variable fallback, and are resolved into a validated [`ServerConfig`].

use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::info;

use crate::error::{ServerError, ServerResult};

const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Lower bound for both save intervals, in seconds
pub const MIN_SAVE_INTERVAL: u64 = 10;
/// Lower bound for the cleanup interval, in seconds
pub const MIN_CLEANUP_INTERVAL: u64 = 1;
/// Lowest accepted port number
pub const MIN_PORT: u16 = 2;

/// Command line of the `ctcache-server` binary
#[derive(Parser, Debug, Clone)]
#[command(name = "ctcache-server")]
#[command(about = "Shared result cache for clang-tidy runs")]
#[command(version)]
pub struct Cli {
    #[arg(
        long,
        short = 'P',
        env = "CTCACHE_PORT",
        value_name = "NUMBER",
        default_value_t = 5000,
        value_parser = clap::value_parser!(u16).range(MIN_PORT as i64..),
        help = "Port number to listen on"
    )]
    pub port: u16,

    #[arg(long, env = "CTCACHE_HOST", default_value = "0.0.0.0", help = "Address to bind to")]
    pub host: String,

    #[arg(
        long,
        short = 'S',
        env = "CTCACHE_SAVE_PATH",
        value_name = "FILE-PATH.gz",
        help = "Path to the persistent index file [default: ~/.cache/ctcache.json.gz]"
    )]
    pub save_path: Option<PathBuf>,

    #[arg(
        long,
        short = 'I',
        env = "CTCACHE_SAVE_INTERVAL",
        value_name = "NUMBER",
        default_value_t = 600,
        value_parser = clap::value_parser!(u64).range(MIN_SAVE_INTERVAL..),
        help = "Index save interval in seconds"
    )]
    pub save_interval: u64,

    #[arg(
        long,
        short = 'Z',
        env = "CTCACHE_STATS_SAVE_INTERVAL",
        value_name = "NUMBER",
        default_value_t = 3600,
        value_parser = clap::value_parser!(u64).range(MIN_SAVE_INTERVAL..),
        help = "Statistics save interval in seconds"
    )]
    pub stats_save_interval: u64,

    #[arg(
        long,
        short = 'C',
        env = "CTCACHE_CLEANUP_INTERVAL",
        value_name = "NUMBER",
        default_value_t = 60,
        value_parser = clap::value_parser!(u64).range(MIN_CLEANUP_INTERVAL..),
        help = "Cleanup interval in seconds"
    )]
    pub cleanup_interval: u64,

    #[arg(
        long,
        short = 'U',
        env = "CTCACHE_STATS_PATH",
        value_name = "DIR-PATH",
        help = "Directory where statistics are stored"
    )]
    pub stats_path: Option<PathBuf>,

    #[arg(
        long,
        short = 'G',
        env = "CTCACHE_CHART_PATH",
        value_name = "DIR-PATH",
        help = "Directory where charts are stored"
    )]
    pub chart_path: Option<PathBuf>,

    #[arg(
        long,
        short = 'M',
        env = "CTCACHE_MAX_CACHE_SIZE",
        value_name = "NUMBER",
        default_value_t = 5.0,
        value_parser = parse_cache_size,
        help = "Maximum size of the cached blobs in GiB"
    )]
    pub max_cache_size: f64,

    #[arg(long, short = 'D', env = "CTCACHE_DEBUG", help = "Enable debug logging")]
    pub debug: bool,

    #[arg(
        long,
        env = "CTCACHE_AUTH_KEY_WRITES",
        value_name = "KEY",
        help = "Key required in the `key` query parameter of write requests"
    )]
    pub auth_key_writes: Option<String>,

    #[arg(
        long,
        env = "CTCACHE_WEBROOT",
        value_name = "DIR-PATH",
        default_value = ".",
        help = "Directory holding the `cache` and `static` sub-directories"
    )]
    pub webroot: PathBuf,

    #[arg(long, env = "CTCACHE_LOG_LEVEL", default_value = "info", help = "Default log filter")]
    pub log_level: String,

    #[arg(long, env = "CTCACHE_JSON_LOGS", help = "Emit logs as JSON lines")]
    pub json_logs: bool,

    #[arg(
        long,
        env = "CTCACHE_INLINE_MAINTENANCE",
        help = "Run maintenance on the request path instead of a background task"
    )]
    pub inline_maintenance: bool,
}

fn parse_cache_size(value: &str) -> Result<f64, String> {
    match value.parse::<f64>() {
        Ok(size) if size > 0.0 && size.is_finite() => Ok(size),
        Ok(size) => Err(format!("'{}' is not a valid cache size", size)),
        Err(_) => Err("cache size must be a number".to_string()),
    }
}

/// Where maintenance work runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MaintenanceMode {
    /// Dedicated task on its own timer
    #[default]
    Background,
    /// Piggy-backed on cache requests
    Inline,
}

/// Resolved server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// Index snapshot file
    pub save_path: PathBuf,
    pub save_interval: u64,
    pub stats_save_interval: u64,
    pub cleanup_interval: u64,
    pub stats_path: Option<PathBuf>,
    pub chart_path: Option<PathBuf>,
    /// Blob size limit in bytes
    pub max_cache_size: u64,
    #[serde(skip_serializing)]
    pub auth_key_writes: Option<String>,
    /// Blob directory
    pub cache_dir: PathBuf,
    /// Directory served under `/static`
    pub static_dir: PathBuf,
    pub log_level: String,
    pub json_logs: bool,
    pub maintenance_mode: MaintenanceMode,
}

fn default_save_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".cache")
        .join("ctcache.json.gz")
}

impl ServerConfig {
    /// Parse the command line and environment
    pub fn load() -> ServerResult<Self> {
        let config = Self::from_cli(Cli::parse());
        config.validate()?;
        Ok(config)
    }

    /// Logs the settings that matter when reading a server log
    pub fn log_summary(&self) {
        info!(
            port = self.port,
            save_path = %self.save_path.display(),
            cache_dir = %self.cache_dir.display(),
            max_cache_size = self.max_cache_size,
            mode = ?self.maintenance_mode,
            "Loaded server configuration"
        );
    }

    pub fn from_cli(cli: Cli) -> Self {
        let webroot = cli.webroot;
        Self {
            host: cli.host,
            port: cli.port,
            save_path: cli.save_path.unwrap_or_else(default_save_path),
            save_interval: cli.save_interval,
            stats_save_interval: cli.stats_save_interval,
            cleanup_interval: cli.cleanup_interval,
            stats_path: cli.stats_path,
            chart_path: cli.chart_path,
            max_cache_size: (cli.max_cache_size * GIB) as u64,
            auth_key_writes: cli.auth_key_writes.filter(|key| !key.is_empty()),
            cache_dir: webroot.join("cache"),
            static_dir: webroot.join("static"),
            log_level: if cli.debug { "debug".to_string() } else { cli.log_level },
            json_logs: cli.json_logs,
            maintenance_mode: if cli.inline_maintenance {
                MaintenanceMode::Inline
            } else {
                MaintenanceMode::Background
            },
        }
    }

    /// Configuration with every state file under `webroot`
    pub fn with_webroot(webroot: impl Into<PathBuf>) -> Self {
        let webroot = webroot.into();
        Self {
            save_path: webroot.join("ctcache.json.gz"),
            cache_dir: webroot.join("cache"),
            static_dir: webroot.join("static"),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> ServerResult<()> {
        if self.port < MIN_PORT {
            return Err(ServerError::ConfigError(format!("'{}' is not a valid port number", self.port)));
        }
        if self.save_interval < MIN_SAVE_INTERVAL {
            return Err(ServerError::ConfigError(format!(
                "save interval must be at least {} seconds",
                MIN_SAVE_INTERVAL
            )));
        }
        if self.stats_save_interval < MIN_SAVE_INTERVAL {
            return Err(ServerError::ConfigError(format!(
                "statistics save interval must be at least {} seconds",
                MIN_SAVE_INTERVAL
            )));
        }
        if self.cleanup_interval < MIN_CLEANUP_INTERVAL {
            return Err(ServerError::ConfigError(format!(
                "cleanup interval must be at least {} second",
                MIN_CLEANUP_INTERVAL
            )));
        }
        if self.max_cache_size == 0 {
            return Err(ServerError::ConfigError("maximum cache size must be positive".to_string()));
        }
        Ok(())
    }

    /// Address to bind the listener to
    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        let webroot = PathBuf::from(".");
        Self {
            host: "0.0.0.0".to_string(),
            port: 5000,
            save_path: default_save_path(),
            save_interval: 600,
            stats_save_interval: 3600,
            cleanup_interval: 60,
            stats_path: None,
            chart_path: None,
            max_cache_size: (5.0 * GIB) as u64,
            auth_key_writes: None,
            cache_dir: webroot.join("cache"),
            static_dir: webroot.join("static"),
            log_level: "info".to_string(),
            json_logs: false,
            maintenance_mode: MaintenanceMode::Background,
        }
    }
}
