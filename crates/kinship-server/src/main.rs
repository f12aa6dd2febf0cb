use anyhow::{Context, Result};
use kinship_server::config::ServerConfig;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration from environment variables
    let config = ServerConfig::load().context("Failed to load configuration")?;

    kinship_server::run(config).await.context("Server error")?;

    Ok(())
}
