//! Durable store interface for the Kinship core
//!
//! The relational store is the source of truth. The core reads it to seed the
//! entity cache and writes edge rows before any in-memory state changes.
//! Implementations treat a duplicate-key insert as an update.

use async_trait::async_trait;

use super::entity::{EntityKey, GroupId, RelationshipEntity, UserId};
use crate::CoreError;

/// Read/write access to the family edge tables
#[async_trait]
pub trait FamilyRepository: Send + Sync {
    /// Parent recorded for `child`
    async fn find_parent(&self, child: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError>;

    /// Children recorded for `parent`
    async fn find_children(&self, parent: UserId, group_id: GroupId) -> Result<Vec<UserId>, CoreError>;

    /// Partner recorded for `user`
    async fn find_partner(&self, user: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError>;

    /// Record `parent` as the parent of `child`, replacing any existing row for `child`
    async fn insert_parent_edge(
        &self,
        parent: UserId,
        child: UserId,
        group_id: GroupId,
    ) -> Result<(), CoreError>;

    /// Remove the parent row linking `parent` and `child`
    async fn delete_parent_edge(
        &self,
        parent: UserId,
        child: UserId,
        group_id: GroupId,
    ) -> Result<(), CoreError>;

    /// Record `a` and `b` as partners, in both directions
    async fn insert_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError>;

    /// Remove the partner rows of `a` and `b`
    async fn delete_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError>;

    /// Assemble an entity from its edge rows; absent rows give the empty entity
    async fn load_entity(&self, key: EntityKey) -> Result<RelationshipEntity, CoreError> {
        let parent_id = self.find_parent(key.user_id, key.group_id).await?;
        let children = self.find_children(key.user_id, key.group_id).await?;
        let partner_id = self.find_partner(key.user_id, key.group_id).await?;

        Ok(RelationshipEntity {
            id: key.user_id,
            group_id: key.group_id,
            parent_id,
            children: children.into_iter().collect(),
            partner_id,
        }
        .without_self_references())
    }

    /// Health check
    async fn health_check(&self) -> Result<bool, CoreError> {
        Ok(true)
    }
}

/// Memory implementations for testing and `memory://` deployments
#[cfg(feature = "testing")]
pub mod memory {
    use super::*;
    use dashmap::DashMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Arc;
    use tracing::debug;

    type EdgeKey = (UserId, GroupId);

    /// In-memory edge tables shared by every process handle cloned from it
    #[derive(Clone, Default)]
    pub struct MemoryFamilyRepository {
        /// child -> parent
        parents: Arc<DashMap<EdgeKey, UserId>>,
        /// user -> partner
        partners: Arc<DashMap<EdgeKey, UserId>>,
        unavailable: Arc<AtomicBool>,
        writes: Arc<AtomicUsize>,
    }

    impl MemoryFamilyRepository {
        /// Create an empty repository
        pub fn new() -> Self {
            Self::default()
        }

        /// Make every call fail as if the database were unreachable
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Number of successful writes so far
        pub fn write_count(&self) -> usize {
            self.writes.load(Ordering::SeqCst)
        }

        fn check_available(&self) -> Result<(), CoreError> {
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(CoreError::StateStoreError(
                    "Memory repository is unavailable".to_string(),
                ));
            }
            Ok(())
        }

        fn record_write(&self) {
            self.writes.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl FamilyRepository for MemoryFamilyRepository {
        async fn find_parent(&self, child: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError> {
            self.check_available()?;
            Ok(self.parents.get(&(child, group_id)).map(|parent| *parent))
        }

        async fn find_children(&self, parent: UserId, group_id: GroupId) -> Result<Vec<UserId>, CoreError> {
            self.check_available()?;
            let mut children: Vec<UserId> = self
                .parents
                .iter()
                .filter(|row| row.key().1 == group_id && *row.value() == parent)
                .map(|row| row.key().0)
                .collect();
            children.sort();
            Ok(children)
        }

        async fn find_partner(&self, user: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError> {
            self.check_available()?;
            Ok(self.partners.get(&(user, group_id)).map(|partner| *partner))
        }

        async fn insert_parent_edge(
            &self,
            parent: UserId,
            child: UserId,
            group_id: GroupId,
        ) -> Result<(), CoreError> {
            self.check_available()?;
            if let Some(previous) = self.parents.insert((child, group_id), parent) {
                debug!(child = %child, previous = %previous, parent = %parent, "Replaced existing parent row");
            }
            self.record_write();
            Ok(())
        }

        async fn delete_parent_edge(
            &self,
            parent: UserId,
            child: UserId,
            group_id: GroupId,
        ) -> Result<(), CoreError> {
            self.check_available()?;
            self.parents
                .remove_if(&(child, group_id), |_, recorded| *recorded == parent);
            self.record_write();
            Ok(())
        }

        async fn insert_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
            self.check_available()?;
            self.partners.insert((a, group_id), b);
            self.partners.insert((b, group_id), a);
            self.record_write();
            Ok(())
        }

        async fn delete_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
            self.check_available()?;
            self.partners.remove_if(&(a, group_id), |_, recorded| *recorded == b);
            self.partners.remove_if(&(b, group_id), |_, recorded| *recorded == a);
            self.record_write();
            Ok(())
        }

        async fn health_check(&self) -> Result<bool, CoreError> {
            Ok(!self.unavailable.load(Ordering::SeqCst))
        }
    }

}
