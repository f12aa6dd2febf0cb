//! Process-local entity cache
//!
//! The cache is the arena every traversal resolves identity keys through. It is
//! an explicit value passed to whoever needs it; there is no global instance.
//! Snapshots from other processes arrive through [`EntityCache::apply`]; local
//! commits change the live entry in place through [`EntityCache::update`] so
//! concurrent commits on one entity compose instead of overwriting each other.

use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

use crate::domain::entity::{EntityKey, EntityUpdate, GroupId, RelationshipEntity, UserId};
use crate::domain::repository::FamilyRepository;
use crate::CoreError;

/// What [`EntityCache::apply`] did with a snapshot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// The key was not cached and has been created
    Inserted,
    /// The cached entity was overwritten with different values
    Updated,
    /// The cached entity already held exactly these values
    Unchanged,
}

/// Relationship entities keyed by (identity, group)
pub struct EntityCache {
    entries: DashMap<EntityKey, RelationshipEntity>,
    repository: Arc<dyn FamilyRepository>,
}

impl EntityCache {
    /// Create an empty cache seeded from `repository` on miss
    pub fn new(repository: Arc<dyn FamilyRepository>) -> Self {
        Self {
            entries: DashMap::with_capacity(256),
            repository,
        }
    }

    /// Cached entity for `key`, seeding it from the durable store on first access
    pub async fn get(&self, key: EntityKey) -> Result<RelationshipEntity, CoreError> {
        if let Some(entity) = self.entries.get(&key) {
            return Ok(entity.value().clone());
        }

        let seeded = self.repository.load_entity(key).await?;
        debug!(key = %key, empty = seeded.is_empty(), "Seeded entity from durable store");

        // A snapshot applied while we were reading wins over the seed
        let entry = self.entries.entry(key).or_insert(seeded);
        Ok(entry.value().clone())
    }

    /// Cached entity for `key` without touching the durable store
    pub fn peek(&self, key: EntityKey) -> Option<RelationshipEntity> {
        self.entries.get(&key).map(|entity| entity.value().clone())
    }

    /// Whether `key` is cached
    pub fn contains(&self, key: EntityKey) -> bool {
        self.entries.contains_key(&key)
    }

    /// Overwrite every field of the entity for the snapshot's key
    pub fn apply(&self, update: EntityUpdate) -> ApplyOutcome {
        let incoming = RelationshipEntity::from(update);
        let key = incoming.key();

        match self.entries.get_mut(&key) {
            Some(mut cached) => {
                if *cached == incoming {
                    ApplyOutcome::Unchanged
                } else {
                    *cached = incoming;
                    ApplyOutcome::Updated
                }
            }
            None => {
                self.entries.insert(key, incoming);
                ApplyOutcome::Inserted
            }
        }
    }

    /// Change the cached entity for `key` in place
    ///
    /// Read and write happen under one shard lock. Returns false when `key` is not
    /// cached; the next `get` seeds it from the durable store instead.
    pub fn update(&self, key: EntityKey, change: impl FnOnce(&mut RelationshipEntity)) -> bool {
        match self.entries.get_mut(&key) {
            Some(mut cached) => {
                change(cached.value_mut());
                true
            }
            None => false,
        }
    }

    /// Drop `key`; the next `get` re-seeds it
    pub fn evict(&self, key: EntityKey) -> bool {
        self.entries.remove(&key).is_some()
    }

    /// Drop `user_id` from every group, returning the number of entries removed
    pub fn evict_user(&self, user_id: UserId) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| key.user_id != user_id);
        before - self.entries.len()
    }

    /// Drop every entry, returning how many were removed
    pub fn clear(&self) -> usize {
        let removed = self.entries.len();
        self.entries.clear();
        removed
    }

    /// Number of cached entries in `group_id`
    pub fn group_len(&self, group_id: GroupId) -> usize {
        self.entries
            .iter()
            .filter(|entry| entry.key().group_id == group_id)
            .count()
    }

    /// Number of cached entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the cache is empty
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The durable store this cache seeds from
    pub fn repository(&self) -> &Arc<dyn FamilyRepository> {
        &self.repository
    }
}
