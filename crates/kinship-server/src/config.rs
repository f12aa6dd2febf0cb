//! Configuration for the Kinship server
//!
//! Everything is read from the environment on top of built-in defaults. A value
//! that fails to parse is logged and the default is kept.

use kinship_core::FamilySettings;
use serde::{Deserialize, Serialize};
use std::env;
use std::str::FromStr;
use tracing::{info, warn};

use crate::error::{ServerError, ServerResult};

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Host to bind to
    #[serde(default = "default_host")]
    pub bind_address: String,

    /// Durable store, `memory://` or `postgres://…`
    #[serde(default = "default_database_url")]
    pub database_url: String,

    /// Pool size for the durable store
    #[serde(default = "default_database_max_connections")]
    pub database_max_connections: u32,

    /// Replication channel, `memory://` or `redis://…`
    #[serde(default = "default_replication_url")]
    pub replication_url: String,

    /// Namespace prepended to replication topics
    #[serde(default = "default_replication_prefix")]
    pub replication_prefix: String,

    /// Key required in `x-api-key` on admin routes
    #[serde(default)]
    pub admin_api_key: Option<String>,

    /// Log level used when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Emit JSON log lines
    #[serde(default)]
    pub log_json: bool,

    /// Family graph limits
    #[serde(default)]
    pub family: FamilySettings,
}

fn default_port() -> u16 {
    8080
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_database_url() -> String {
    "memory://local".to_string()
}

fn default_database_max_connections() -> u32 {
    5
}

fn default_replication_url() -> String {
    "memory://local".to_string()
}

fn default_replication_prefix() -> String {
    "kinship:".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

fn override_parsed<T: FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    name: &str,
    target: &mut T,
) {
    if let Some(raw) = lookup(name) {
        match raw.parse::<T>() {
            Ok(value) => *target = value,
            Err(_) => warn!("Invalid {} value: {}", name, raw),
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables
    pub fn load() -> ServerResult<Self> {
        Self::load_from(|name| env::var(name).ok())
    }

    /// Load configuration from an arbitrary variable source
    pub fn load_from(lookup: impl Fn(&str) -> Option<String>) -> ServerResult<Self> {
        let mut config = Self::default();

        override_parsed(&lookup, "SERVER_PORT", &mut config.port);
        if let Some(host) = lookup("SERVER_HOST") {
            config.bind_address = host;
        }

        if let Some(url) = lookup("DATABASE_URL") {
            config.database_url = url;
        }
        override_parsed(&lookup, "DATABASE_MAX_CONNECTIONS", &mut config.database_max_connections);

        if let Some(url) = lookup("REPLICATION_URL") {
            config.replication_url = url;
        }
        if let Some(prefix) = lookup("REPLICATION_PREFIX") {
            config.replication_prefix = prefix;
        }

        if let Some(key) = lookup("ADMIN_API_KEY").filter(|key| !key.is_empty()) {
            config.admin_api_key = Some(key);
        }

        if let Some(level) = lookup("LOG_LEVEL") {
            config.log_level = level;
        }
        if let Some(raw) = lookup("LOG_JSON") {
            match parse_flag(&raw) {
                Some(flag) => config.log_json = flag,
                None => warn!("Invalid LOG_JSON value: {}", raw),
            }
        }

        let family = &mut config.family;
        override_parsed(&lookup, "FAMILY_MAX_TRAVERSAL_DEPTH", &mut family.max_traversal_depth);
        override_parsed(&lookup, "FAMILY_PROPOSAL_TIMEOUT_SECS", &mut family.proposal_timeout_secs);
        override_parsed(&lookup, "FAMILY_MAX_CHILDREN", &mut family.max_children);
        override_parsed(&lookup, "FAMILY_MAX_MEMBERS", &mut family.max_family_members);
        if let Some(raw) = lookup("FAMILY_ALLOW_INCEST") {
            match parse_flag(&raw) {
                Some(flag) => family.allow_incest = flag,
                None => warn!("Invalid FAMILY_ALLOW_INCEST value: {}", raw),
            }
        }

        config.validate()?;

        if config.admin_api_key.is_none() {
            warn!("No ADMIN_API_KEY provided - admin API will be unsecured!");
        }

        info!(
            database = %config.database_scheme(),
            replication = %config.replication_scheme(),
            "Loaded server configuration"
        );
        Ok(config)
    }

    /// Reject configurations the server cannot start with
    pub fn validate(&self) -> ServerResult<()> {
        if self.database_url.is_empty() {
            return Err(ServerError::ConfigError("Database URL is required".to_string()));
        }
        if self.replication_url.is_empty() {
            return Err(ServerError::ConfigError("Replication URL is required".to_string()));
        }
        if self.database_max_connections == 0 {
            return Err(ServerError::ConfigError(
                "DATABASE_MAX_CONNECTIONS must be greater than zero".to_string(),
            ));
        }
        self.family
            .validate()
            .map_err(|e| ServerError::ConfigError(e.to_string()))
    }

    /// Scheme of the durable store URL, safe to log
    pub fn database_scheme(&self) -> &str {
        scheme(&self.database_url)
    }

    /// Scheme of the replication URL, safe to log
    pub fn replication_scheme(&self) -> &str {
        scheme(&self.replication_url)
    }
}

fn scheme(url: &str) -> &str {
    url.split_once("://").map(|(scheme, _)| scheme).unwrap_or(url)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            bind_address: default_host(),
            database_url: default_database_url(),
            database_max_connections: default_database_max_connections(),
            replication_url: default_replication_url(),
            replication_prefix: default_replication_prefix(),
            admin_api_key: None,
            log_level: default_log_level(),
            log_json: false,
            family: FamilySettings::default(),
        }
    }
}
