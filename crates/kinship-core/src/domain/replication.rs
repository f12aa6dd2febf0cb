//! Replication channel interface
//!
//! A fire-and-forget publish/subscribe transport. Nothing is replayed for
//! subscribers that were offline; they converge by re-seeding from the durable
//! store.

use async_trait::async_trait;
use futures::stream::BoxStream;

use crate::CoreError;

/// Topic carrying full [`EntityUpdate`](super::entity::EntityUpdate) snapshots
pub const ENTITY_UPDATE_TOPIC: &str = "TreeMemberUpdate";

/// Topic carrying [`EntityEviction`](super::entity::EntityEviction) requests
pub const ENTITY_EVICT_TOPIC: &str = "TreeMemberEvict";

/// A raw message received from the channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelMessage {
    /// Unprefixed topic name
    pub topic: String,
    /// JSON payload
    pub payload: String,
}

/// Stream of received messages
pub type MessageStream = BoxStream<'static, ChannelMessage>;

/// Asynchronous publish/subscribe transport shared by every process
#[async_trait]
pub trait ReplicationChannel: Send + Sync {
    /// Publish a payload on a topic
    async fn publish(&self, topic: &str, payload: String) -> Result<(), CoreError>;

    /// Subscribe to a set of topics
    async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, CoreError>;

    /// Health check
    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Memory implementations for testing and `memory://` deployments
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use futures::StreamExt;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, Mutex, PoisonError};
    use tokio::sync::broadcast::{self, error::RecvError};
    use tracing::warn;

    const HUB_CAPACITY: usize = 1024;

    /// Published messages kept for inspection; older ones are dropped
    pub const HISTORY_CAPACITY: usize = 256;

    /// In-process broadcast hub; clones share the same bus
    #[derive(Clone)]
    pub struct MemoryReplicationHub {
        sender: broadcast::Sender<ChannelMessage>,
        history: Arc<Mutex<VecDeque<ChannelMessage>>>,
        unavailable: Arc<AtomicBool>,
    }

    impl MemoryReplicationHub {
        /// Create a new hub
        pub fn new() -> Self {
            let (sender, _) = broadcast::channel(HUB_CAPACITY);
            Self {
                sender,
                history: Arc::new(Mutex::new(VecDeque::with_capacity(HISTORY_CAPACITY))),
                unavailable: Arc::new(AtomicBool::new(false)),
            }
        }

        /// Make publishing fail as if the broker were down
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// The most recent [`HISTORY_CAPACITY`] published messages, oldest first
        pub fn published(&self) -> Vec<ChannelMessage> {
            self.history
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .iter()
                .cloned()
                .collect()
        }
    }

    impl Default for MemoryReplicationHub {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl ReplicationChannel for MemoryReplicationHub {
        async fn publish(&self, topic: &str, payload: String) -> Result<(), CoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CoreError::ReplicationError(
                    "Memory replication hub is unavailable".to_string(),
                ));
            }

            let message = ChannelMessage {
                topic: topic.to_string(),
                payload,
            };
            {
                let mut history = self.history.lock().unwrap_or_else(PoisonError::into_inner);
                if history.len() == HISTORY_CAPACITY {
                    history.pop_front();
                }
                history.push_back(message.clone());
            }

            // No subscribers is not an error: messages are not retained for them
            let _ = self.sender.send(message);
            Ok(())
        }

        async fn subscribe(&self, topics: &[String]) -> Result<MessageStream, CoreError> {
            let topics = topics.to_vec();
            let receiver = self.sender.subscribe();

            let stream = futures::stream::unfold(receiver, |mut receiver| async move {
                loop {
                    match receiver.recv().await {
                        Ok(message) => return Some((message, receiver)),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(skipped, "Replication subscriber lagged, messages dropped");
                        }
                        Err(RecvError::Closed) => return None,
                    }
                }
            })
            .filter(move |message| futures::future::ready(topics.contains(&message.topic)));

            Ok(stream.boxed())
        }

        async fn health_check(&self) -> Result<bool, CoreError> {
            Ok(!self.unavailable.load(Ordering::SeqCst))
        }
    }

}
