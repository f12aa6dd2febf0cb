//!
//! Kinship Server - process wiring for the family graph
//!
//! Reads configuration from the environment, picks the durable store and
//! replication channel by URL scheme, starts the replication subscriber and
//! serves the query, proposal and admin API.

use std::sync::Arc;

use kinship_core::{FamilyRepository, FamilyService, ReplicationChannel};

/// API module
pub mod api;

/// Server module
pub mod server;

/// Configuration module
pub mod config;

/// Error module
pub mod error;

// Re-export key types
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use server::KinshipServer;

/// Run function
pub async fn run(config: ServerConfig) -> ServerResult<()> {
    init_logging(&config);

    let service = build_service(&config).await?;
    KinshipServer::new(config, Arc::new(service)).run().await
}

/// Initialize logging
fn init_logging(config: &ServerConfig) {
    use tracing_subscriber::{fmt, EnvFilter};

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    let builder = fmt().with_env_filter(filter).with_target(true);
    let installed = if config.log_json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    if installed.is_err() {
        tracing::debug!("Global tracing subscriber already installed");
    }
}

/// Connect both backends and wire the family service around them
pub async fn build_service(config: &ServerConfig) -> ServerResult<FamilyService> {
    let repository = create_repository(config).await?;
    let channel = create_replication_channel(config).await?;
    Ok(FamilyService::with_repository(repository, channel, config.family.clone()))
}

/// Create the durable store selected by `database_url`
pub async fn create_repository(config: &ServerConfig) -> ServerResult<Arc<dyn FamilyRepository>> {
    let url = config.database_url.as_str();

    if url.starts_with("memory://") {
        tracing::info!("Using in-memory family repository");
        return Ok(Arc::new(kinship_core::domain::repository::memory::MemoryFamilyRepository::new()));
    }

    #[cfg(feature = "postgres")]
    if url.starts_with("postgres://") || url.starts_with("postgresql://") {
        tracing::info!("Using PostgreSQL family repository");
        let pg_config = kinship_state_postgres::PostgresConfig {
            connection_string: url.to_string(),
            max_connections: config.database_max_connections,
            ..Default::default()
        };
        let repository = kinship_state_postgres::connect_repository(&pg_config).await?;
        return Ok(Arc::new(repository));
    }

    Err(ServerError::ConfigError(format!(
        "Unsupported database URL scheme: {}",
        config.database_scheme()
    )))
}

/// Create the replication channel selected by `replication_url`
pub async fn create_replication_channel(
    config: &ServerConfig,
) -> ServerResult<Arc<dyn ReplicationChannel>> {
    let url = config.replication_url.as_str();

    if url.starts_with("memory://") {
        tracing::info!("Using in-process replication hub");
        return Ok(Arc::new(kinship_core::domain::replication::memory::MemoryReplicationHub::new()));
    }

    #[cfg(feature = "redis")]
    if url.starts_with("redis://") || url.starts_with("rediss://") {
        tracing::info!(prefix = %config.replication_prefix, "Using Redis replication channel");
        let redis_config = kinship_replication_redis::RedisChannelConfig {
            prefix: config.replication_prefix.clone(),
            ..kinship_replication_redis::RedisChannelConfig::new(url)
        };
        let channel = kinship_replication_redis::RedisReplicationChannel::connect(&redis_config).await?;
        return Ok(Arc::new(channel));
    }

    Err(ServerError::ConfigError(format!(
        "Unsupported replication URL scheme: {}",
        config.replication_scheme()
    )))
}
