//! Main Kinship server implementation

use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use kinship_core::{FamilyService, ResubscribeBackoff};

use crate::config::ServerConfig;
use crate::error::{ServerError, ServerResult};

/// Shared state behind every handler
pub struct KinshipServer {
    /// Configuration
    pub config: ServerConfig,

    service: Arc<FamilyService>,
}

impl std::fmt::Debug for KinshipServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KinshipServer")
            .field("config", &self.config)
            .field("cached_entities", &self.service.cache().len())
            .finish()
    }
}

impl KinshipServer {
    /// Create a server around a wired family service
    pub fn new(config: ServerConfig, service: Arc<FamilyService>) -> Self {
        Self { config, service }
    }

    /// The family service
    pub fn service(&self) -> &Arc<FamilyService> {
        &self.service
    }

    /// Whether `key` opens the admin API; always true when no key is configured
    pub fn validate_admin_key(&self, key: Option<&str>) -> bool {
        match self.config.admin_api_key.as_deref() {
            Some(expected) => key == Some(expected),
            None => true,
        }
    }

    /// Start the supervised replication subscriber, then serve until Ctrl-C
    pub async fn run(self) -> ServerResult<()> {
        info!("Starting Kinship server");

        let replication = Arc::clone(self.service.replicator()).supervise(ResubscribeBackoff::default());

        let server = Arc::new(self);
        let app = crate::api::build_router(Arc::clone(&server));

        let host: std::net::IpAddr = server.config.bind_address.parse().map_err(|_| {
            ServerError::ConfigError(format!("Invalid bind address: {}", server.config.bind_address))
        })?;
        let listener = TcpListener::bind(SocketAddr::new(host, server.config.port)).await?;
        info!("Listening on {}", listener.local_addr()?);

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;

        replication.abort();
        info!("Kinship server stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
