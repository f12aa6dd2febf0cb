//! Replication glue between the entity cache and the replication channel

use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::entity_cache::{ApplyOutcome, EntityCache};
use crate::domain::entity::{EntityEviction, EntityKey, EntityUpdate, RelationshipEntity};
use crate::domain::replication::{
    ChannelMessage, MessageStream, ReplicationChannel, ENTITY_EVICT_TOPIC, ENTITY_UPDATE_TOPIC,
};
use crate::CoreError;

/// What the subscriber did with one received message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOutcome {
    /// A snapshot was applied to the cache
    Applied(ApplyOutcome),
    /// An eviction removed this many cached entries
    Evicted(usize),
    /// The message was unreadable or on an unknown topic
    Dropped,
}

/// Delay between re-subscribe attempts
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResubscribeBackoff {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Growth factor per consecutive failure
    pub multiplier: f64,
    /// Upper bound on any single delay
    pub max_delay: Duration,
}

impl Default for ResubscribeBackoff {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(500),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl ResubscribeBackoff {
    /// Delay before retry number `attempt`, counting from 1
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.powi(attempt.saturating_sub(1).min(63) as i32);
        let millis = self.initial_delay.as_millis() as f64 * factor;
        Duration::from_millis(millis.min(self.max_delay.as_millis() as f64) as u64)
    }
}

/// Marks a subscription live until dropped, including when its task is aborted
struct LiveFlag<'a>(&'a AtomicBool);

impl<'a> LiveFlag<'a> {
    fn raise(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for LiveFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Publishes committed entities and applies snapshots from other processes
pub struct Replicator {
    cache: Arc<EntityCache>,
    channel: Arc<dyn ReplicationChannel>,
    live: AtomicBool,
}

impl Replicator {
    /// Create a replicator over `cache` and `channel`
    pub fn new(cache: Arc<EntityCache>, channel: Arc<dyn ReplicationChannel>) -> Self {
        Self {
            cache,
            channel,
            live: AtomicBool::new(false),
        }
    }

    /// Whether a subscription is currently applying messages
    pub fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    /// Topics the subscriber listens on
    pub fn topics() -> Vec<String> {
        vec![ENTITY_UPDATE_TOPIC.to_string(), ENTITY_EVICT_TOPIC.to_string()]
    }

    /// The channel this replicator publishes on
    pub fn channel(&self) -> &Arc<dyn ReplicationChannel> {
        &self.channel
    }

    /// Publish the full state of each entity
    ///
    /// Must only be called once the durable write for these entities has been
    /// acknowledged. Every entity is attempted; the first failure is returned.
    pub async fn publish_entities(&self, entities: &[RelationshipEntity]) -> Result<(), CoreError> {
        let mut first_error = None;

        for entity in entities {
            let payload = serde_json::to_string(&entity.to_update())?;
            if let Err(err) = self.channel.publish(ENTITY_UPDATE_TOPIC, payload).await {
                warn!(key = %entity.key(), error = %err, "Failed to publish entity update");
                first_error.get_or_insert(err);
            }
        }

        match first_error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Publish an administrative eviction
    pub async fn publish_eviction(&self, eviction: &EntityEviction) -> Result<(), CoreError> {
        let payload = serde_json::to_string(eviction)?;
        self.channel.publish(ENTITY_EVICT_TOPIC, payload).await
    }

    /// Apply one received message to the cache
    pub fn on_message(&self, message: &ChannelMessage) -> MessageOutcome {
        match message.topic.as_str() {
            ENTITY_UPDATE_TOPIC => match serde_json::from_str::<EntityUpdate>(&message.payload) {
                Ok(update) => {
                    let key = update.key();
                    let outcome = self.cache.apply(update);
                    debug!(key = %key, ?outcome, "Applied replicated entity update");
                    MessageOutcome::Applied(outcome)
                }
                Err(err) => {
                    warn!(topic = %message.topic, error = %err, "Dropping malformed entity update");
                    MessageOutcome::Dropped
                }
            },
            ENTITY_EVICT_TOPIC => match serde_json::from_str::<EntityEviction>(&message.payload) {
                Ok(eviction) => {
                    let removed = match eviction.group_id {
                        Some(group_id) => {
                            usize::from(self.cache.evict(EntityKey::new(eviction.id, group_id)))
                        }
                        None => self.cache.evict_user(eviction.id),
                    };
                    debug!(user_id = %eviction.id, removed, "Applied replicated eviction");
                    MessageOutcome::Evicted(removed)
                }
                Err(err) => {
                    warn!(topic = %message.topic, error = %err, "Dropping malformed eviction");
                    MessageOutcome::Dropped
                }
            },
            other => {
                warn!(topic = %other, "Dropping message on unknown topic");
                MessageOutcome::Dropped
            }
        }
    }

    /// Subscribe to both replication topics
    pub async fn subscribe(&self) -> Result<MessageStream, CoreError> {
        self.channel.subscribe(&Self::topics()).await
    }

    /// Apply messages until the stream ends, returning how many were handled
    pub async fn run(&self, mut stream: MessageStream) -> usize {
        let mut handled = 0;
        while let Some(message) = stream.next().await {
            self.on_message(&message);
            handled += 1;
        }
        info!(handled, "Replication stream ended");
        handled
    }

    /// Subscribe, then apply messages on a background task
    ///
    /// The task ends with the stream; use [`Replicator::supervise`] to keep
    /// the subscription alive.
    pub async fn spawn(self: Arc<Self>) -> Result<JoinHandle<usize>, CoreError> {
        let stream = self.subscribe().await?;
        self.live.store(true, Ordering::SeqCst);
        Ok(tokio::spawn(async move {
            let _live = LiveFlag(&self.live);
            self.run(stream).await
        }))
    }

    /// Keep a subscription running until the task is aborted
    ///
    /// Every time the stream ends or subscribing fails the loop backs off and
    /// subscribes again. Updates published while no subscription was open are
    /// lost, so each reconnect after the first clears the cache and lets entries
    /// re-seed from the durable store.
    pub fn supervise(self: Arc<Self>, backoff: ResubscribeBackoff) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut connected_before = false;
            let mut failures = 0u32;

            loop {
                match self.subscribe().await {
                    Ok(stream) => {
                        if connected_before {
                            let cleared = self.cache.clear();
                            info!(cleared, "Replication resubscribed, cleared cache");
                        }
                        connected_before = true;
                        failures = 0;

                        let live = LiveFlag::raise(&self.live);
                        self.run(stream).await;
                        drop(live);
                        warn!("Replication subscription lost");
                    }
                    Err(err) => {
                        error!(error = %err, "Failed to subscribe to replication channel");
                    }
                }

                failures += 1;
                let delay = backoff.delay(failures);
                debug!(attempt = failures, delay_ms = delay.as_millis() as u64, "Resubscribing after backoff");
                tokio::time::sleep(delay).await;
            }
        })
    }
}
