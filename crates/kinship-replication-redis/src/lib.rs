//! Redis pub/sub replication channel for the Kinship family graph
//!
//! Publishing goes through a shared [`ConnectionManager`], which reconnects on
//! its own. Each subscription opens a dedicated pub/sub connection. Topics are
//! namespaced with a prefix so several deployments can share one Redis.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time;
use tracing::{debug, info, warn};

use kinship_core::{ChannelMessage, CoreError, MessageStream, ReplicationChannel};

const DEFAULT_PREFIX: &str = "kinship:";
const DEFAULT_CONNECTION_TIMEOUT_MS: u64 = 3000;

/// Redis channel configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisChannelConfig {
    /// Redis URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// Prepended to every topic name
    pub prefix: String,
    /// Connection timeout in milliseconds
    pub connection_timeout_ms: u64,
}

impl RedisChannelConfig {
    /// Configuration for `url` with default prefix and timeout
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            prefix: DEFAULT_PREFIX.to_string(),
            connection_timeout_ms: DEFAULT_CONNECTION_TIMEOUT_MS,
        }
    }
}

/// Maps between topic names and prefixed Redis channel names
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicNames {
    prefix: String,
}

impl TopicNames {
    /// Namespace topics under `prefix`
    pub fn new(prefix: impl Into<String>) -> Self {
        Self { prefix: prefix.into() }
    }

    /// Redis channel carrying `topic`
    pub fn channel(&self, topic: &str) -> String {
        format!("{}{}", self.prefix, topic)
    }

    /// Topic carried by a Redis channel, if it is in our namespace
    pub fn topic<'a>(&self, channel: &'a str) -> Option<&'a str> {
        channel.strip_prefix(self.prefix.as_str())
    }
}

fn redis_error(action: &str, e: redis::RedisError) -> CoreError {
    CoreError::ReplicationError(format!("Redis {} failed: {}", action, e))
}

/// Replication channel over Redis pub/sub
pub struct RedisReplicationChannel {
    client: Client,
    publisher: ConnectionManager,
    names: TopicNames,
    connection_timeout: Duration,
}

impl RedisReplicationChannel {
    /// Connect the publisher; subscriptions connect lazily
    pub async fn connect(config: &RedisChannelConfig) -> Result<Self, CoreError> {
        let client = Client::open(config.url.as_str()).map_err(|e| redis_error("client setup", e))?;
        let connection_timeout = Duration::from_millis(config.connection_timeout_ms);

        let publisher = time::timeout(connection_timeout, ConnectionManager::new(client.clone()))
            .await
            .map_err(|_| {
                CoreError::ReplicationError(format!(
                    "Timed out connecting to Redis after {}ms",
                    config.connection_timeout_ms
                ))
            })?
            .map_err(|e| redis_error("connect", e))?;

        info!(prefix = %config.prefix, "Connected replication channel to Redis");
        Ok(Self {
            client,
            publisher,
            names: TopicNames::new(config.prefix.clone()),
            connection_timeout,
        })
    }
}

#[async_trait]
impl ReplicationChannel for RedisReplicationChannel {
    async fn publish(&self, topic: &str, payload: String) -> Result<(), CoreError> {
        let mut conn = self.publisher.clone();
        let channel = self.names.channel(topic);
        let receivers: i64 = conn
            .publish(&channel, payload)
            .await
            .map_err(|e| redis_error("publish", e))?;
        debug!(topic, receivers, "Published to Redis");
        Ok(())
    }

    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, CoreError> {
        let conn = time::timeout(self.connection_timeout, self.client.get_async_connection())
            .await
            .map_err(|_| CoreError::ReplicationError("Timed out opening Redis subscriber".to_string()))?
            .map_err(|e| redis_error("subscriber connect", e))?;

        let mut pubsub = conn.into_pubsub();
        for topic in topics {
            pubsub
                .subscribe(self.names.channel(topic))
                .await
                .map_err(|e| redis_error("subscribe", e))?;
        }
        info!(?topics, "Subscribed to Redis replication topics");

        let names = self.names.clone();
        let stream = pubsub.into_on_message().filter_map(move |msg| {
            let message = match (names.topic(msg.get_channel_name()), msg.get_payload::<String>()) {
                (Some(topic), Ok(payload)) => Some(ChannelMessage {
                    topic: topic.to_string(),
                    payload,
                }),
                (None, _) => {
                    warn!(channel = msg.get_channel_name(), "Ignoring message outside the topic prefix");
                    None
                }
                (_, Err(e)) => {
                    warn!(channel = msg.get_channel_name(), error = %e, "Ignoring non-text Redis payload");
                    None
                }
            };
            futures::future::ready(message)
        });

        Ok(stream.boxed())
    }

    async fn health_check(&self) -> Result<bool, CoreError> {
        let mut conn = self.publisher.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        Ok(pong.is_ok())
    }
}
