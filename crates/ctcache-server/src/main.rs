use anyhow::{Context, Result};
use ctcache_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Command line and CTCACHE_* environment variables
    let config = ServerConfig::load()
        .context("Failed to load configuration")?;

    // Run the server using the library's run function
    ctcache_server::run(config).await
        .context("Server error")?;

    Ok(())
}
