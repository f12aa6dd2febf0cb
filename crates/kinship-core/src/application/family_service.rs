//! Family service
//!
//! Every mutation follows the same order: validate against the cache, write the
//! durable store, apply the edge change to the live cache entries, then publish
//! fresh snapshots of them. A failed durable write leaves both the cache and the
//! channel untouched.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::entity_cache::EntityCache;
use super::proposal_registry::ProposalRegistry;
use super::replication::Replicator;
use super::response::{await_response, ResponseRouter};
use super::traversal::{FamilyGraph, SpanOptions};
use crate::domain::entity::{EntityEviction, EntityKey, GroupId, RelationshipEntity, UserId};
use crate::domain::proposal::{
    ProposalContext, ProposalKind, ProposalOutcome, ProposalRecord, ProposalReply, ProposalRole,
    ProposedEdge,
};
use crate::domain::relation::Relation;
use crate::domain::replication::ReplicationChannel;
use crate::domain::repository::FamilyRepository;
use crate::settings::FamilySettings;
use crate::CoreError;

/// Mutating workflows and read queries over the family graph
pub struct FamilyService {
    cache: Arc<EntityCache>,
    repository: Arc<dyn FamilyRepository>,
    replicator: Arc<Replicator>,
    registry: Arc<ProposalRegistry>,
    responses: Arc<ResponseRouter>,
    settings: FamilySettings,
    /// Held while snapshots are read and published so the last one out is the newest
    publishing: Mutex<()>,
}

impl FamilyService {
    /// Wire a service around an existing cache and channel
    pub fn new(
        cache: Arc<EntityCache>,
        channel: Arc<dyn ReplicationChannel>,
        settings: FamilySettings,
    ) -> Self {
        let repository = Arc::clone(cache.repository());
        let replicator = Arc::new(Replicator::new(Arc::clone(&cache), channel));
        Self {
            cache,
            repository,
            replicator,
            registry: Arc::new(ProposalRegistry::new()),
            responses: Arc::new(ResponseRouter::new()),
            settings,
            publishing: Mutex::new(()),
        }
    }

    /// Shortcut building a fresh cache over `repository`
    pub fn with_repository(
        repository: Arc<dyn FamilyRepository>,
        channel: Arc<dyn ReplicationChannel>,
        settings: FamilySettings,
    ) -> Self {
        Self::new(Arc::new(EntityCache::new(repository)), channel, settings)
    }

    /// The entity cache
    pub fn cache(&self) -> &Arc<EntityCache> {
        &self.cache
    }

    /// The replication glue, for spawning the subscriber
    pub fn replicator(&self) -> &Arc<Replicator> {
        &self.replicator
    }

    /// The proposal registry
    pub fn registry(&self) -> &Arc<ProposalRegistry> {
        &self.registry
    }

    /// Reply slots of proposals waiting on a recipient
    pub fn responses(&self) -> &Arc<ResponseRouter> {
        &self.responses
    }

    /// Active settings
    pub fn settings(&self) -> &FamilySettings {
        &self.settings
    }

    fn graph(&self, group_id: GroupId) -> FamilyGraph<'_> {
        FamilyGraph::new(&self.cache, group_id, self.settings.max_traversal_depth)
    }

    fn key(user_id: UserId, group_id: GroupId) -> EntityKey {
        EntityKey::new(user_id, group_id)
    }

    // Seeding

    /// Seed the member and its ancestors, returning the topmost member reached
    async fn seed_ancestors(&self, user_id: UserId, group_id: GroupId) -> Result<UserId, CoreError> {
        let mut seen = HashSet::new();
        let mut current = user_id;

        while seen.insert(current) && seen.len() <= self.settings.max_traversal_depth {
            match self.cache.get(Self::key(current, group_id)).await?.parent_id {
                Some(parent) => current = parent,
                None => break,
            }
        }

        Ok(current)
    }

    /// Seed the member's whole tree and every member's partner
    ///
    /// Loops in the data stop the walk quietly; the synchronous traversal that
    /// follows reports them.
    async fn seed_tree(&self, user_id: UserId, group_id: GroupId) -> Result<(), CoreError> {
        let root = self.seed_ancestors(user_id, group_id).await?;
        let mut queue = VecDeque::from([root]);
        let mut seen = HashSet::new();

        while let Some(current) = queue.pop_front() {
            if !seen.insert(current) {
                continue;
            }
            if seen.len() > self.settings.max_traversal_depth {
                break;
            }

            let entity = self.cache.get(Self::key(current, group_id)).await?;
            if let Some(partner) = entity.partner_id {
                self.cache.get(Self::key(partner, group_id)).await?;
            }
            queue.extend(entity.children);
        }

        Ok(())
    }

    /// Seed what a relation query reads: both members' ancestors and their partners' ancestors
    async fn seed_relation(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
        for user_id in [a, b] {
            self.seed_ancestors(user_id, group_id).await?;
            if let Some(partner) = self.cache.get(Self::key(user_id, group_id)).await?.partner_id {
                self.seed_ancestors(partner, group_id).await?;
            }
        }
        Ok(())
    }

    // Read queries

    /// Cached entity, seeded from the durable store on first access
    pub async fn get(&self, user_id: UserId, group_id: GroupId) -> Result<RelationshipEntity, CoreError> {
        self.cache.get(Self::key(user_id, group_id)).await
    }

    /// How `a` is related to `b`
    pub async fn relation(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<Relation, CoreError> {
        self.seed_relation(a, b, group_id).await?;
        self.graph(group_id).relation(a, b)
    }

    /// Members reachable from `user_id` over parent/child edges
    pub async fn span(
        &self,
        user_id: UserId,
        group_id: GroupId,
        options: SpanOptions,
    ) -> Result<Vec<UserId>, CoreError> {
        self.seed_tree(user_id, group_id).await?;
        self.graph(group_id).span(user_id, options)
    }

    /// Top of the member's tree
    pub async fn root(&self, user_id: UserId, group_id: GroupId) -> Result<UserId, CoreError> {
        self.seed_ancestors(user_id, group_id).await?;
        self.graph(group_id).root(user_id)
    }

    /// Size of the member's whole tree including partners
    pub async fn family_size(&self, user_id: UserId, group_id: GroupId) -> Result<usize, CoreError> {
        self.seed_tree(user_id, group_id).await?;
        self.graph(group_id).family_size(user_id)
    }

    /// Pending proposal slot held by `user_id`
    pub fn lookup_proposal(&self, user_id: UserId) -> Option<ProposalRecord> {
        self.registry.lookup(user_id)
    }

    // Validation

    async fn check_family_limit(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
        let combined = self.family_size(a, group_id).await? + self.family_size(b, group_id).await?;
        if combined > self.settings.max_family_members {
            return Err(CoreError::ValidationError(format!(
                "Joining users {} and {} would make a family of {} members, the limit is {}",
                a, b, combined, self.settings.max_family_members
            )));
        }
        Ok(())
    }

    /// Structural checks for creating `edge` in `group_id`
    pub async fn validate_edge(&self, edge: ProposedEdge, group_id: GroupId) -> Result<(), CoreError> {
        match edge {
            ProposedEdge::Partner(a, b) => {
                if a == b {
                    return Err(CoreError::ValidationError(
                        "A user cannot partner themselves".to_string(),
                    ));
                }
                for user_id in [a, b] {
                    if let Some(partner) = self.get(user_id, group_id).await?.partner_id {
                        return Err(CoreError::ValidationError(format!(
                            "User {} is already partnered with {}",
                            user_id, partner
                        )));
                    }
                }
                if !self.settings.allow_incest {
                    let relation = self.relation(a, b, group_id).await?;
                    if relation.is_related() {
                        return Err(CoreError::ValidationError(format!(
                            "Users {} and {} are already related ({})",
                            a,
                            b,
                            relation.label()
                        )));
                    }
                }
                self.check_family_limit(a, b, group_id).await
            }
            ProposedEdge::Parent { parent, child } => {
                if parent == child {
                    return Err(CoreError::ValidationError(
                        "A user cannot be their own parent".to_string(),
                    ));
                }
                if let Some(existing) = self.get(child, group_id).await?.parent_id {
                    return Err(CoreError::ValidationError(format!(
                        "User {} already has a parent ({})",
                        child, existing
                    )));
                }
                let children = self.get(parent, group_id).await?.children.len();
                if children >= self.settings.max_children {
                    return Err(CoreError::ValidationError(format!(
                        "User {} already has {} children, the limit is {}",
                        parent, children, self.settings.max_children
                    )));
                }
                let family = self.span(child, group_id, SpanOptions::whole_tree()).await?;
                if family.contains(&parent) {
                    return Err(CoreError::ValidationError(format!(
                        "Users {} and {} are already in the same family",
                        parent, child
                    )));
                }
                self.check_family_limit(parent, child, group_id).await
            }
        }
    }

    // Commit

    /// Apply `change` to the live cache entry for `key`
    ///
    /// An entry evicted while the durable write was in flight is left out; the
    /// snapshot taken by `settle` re-seeds it from the store.
    fn change(&self, key: EntityKey, change: impl FnOnce(&mut RelationshipEntity)) {
        if !self.cache.update(key, change) {
            debug!(key = %key, "Entity evicted during commit, re-seeding");
        }
    }

    /// Publish current snapshots of `keys`
    async fn settle(&self, keys: Vec<EntityKey>) -> Result<Vec<RelationshipEntity>, CoreError> {
        let _publishing = self.publishing.lock().await;

        let mut entities = Vec::with_capacity(keys.len());
        for key in keys {
            entities.push(self.cache.get(key).await?);
        }
        self.replicator.publish_entities(&entities).await?;
        Ok(entities)
    }

    /// Write `edge` durably and propagate the two touched entities
    async fn commit_edge(
        &self,
        edge: ProposedEdge,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        let keys = match edge {
            ProposedEdge::Partner(a, b) => {
                self.get(a, group_id).await?;
                self.get(b, group_id).await?;
                self.repository.insert_partner_edge(a, b, group_id).await?;

                self.change(Self::key(a, group_id), |entity| entity.partner_id = Some(b));
                self.change(Self::key(b, group_id), |entity| entity.partner_id = Some(a));
                vec![Self::key(a, group_id), Self::key(b, group_id)]
            }
            ProposedEdge::Parent { parent, child } => {
                self.get(parent, group_id).await?;
                let previous = self.get(child, group_id).await?.parent_id;
                self.repository.insert_parent_edge(parent, child, group_id).await?;

                self.change(Self::key(parent, group_id), |entity| {
                    entity.children.insert(child);
                });
                self.change(Self::key(child, group_id), |entity| entity.parent_id = Some(parent));
                let mut keys = vec![Self::key(child, group_id), Self::key(parent, group_id)];
                // The durable row for `child` was replaced
                if let Some(previous) = previous.filter(|previous| *previous != parent) {
                    self.change(Self::key(previous, group_id), |entity| {
                        entity.children.remove(&child);
                    });
                    keys.push(Self::key(previous, group_id));
                }
                keys
            }
        };

        info!(group_id = %group_id, ?edge, "Committed family edge");
        self.settle(keys).await
    }

    // Proposals

    /// Open a proposal, wait for the recipient, and commit the edge if accepted
    pub async fn run_proposal(
        &self,
        kind: ProposalKind,
        initiator: UserId,
        recipient: UserId,
        context: ProposalContext,
    ) -> Result<ProposalOutcome, CoreError> {
        let edge = kind.edge(initiator, recipient);
        self.validate_edge(edge, context.group_id).await?;

        let mut ticket = self
            .registry
            .reserve_pair(initiator, recipient, kind, context)?;
        let receiver = ticket.open_reply_slot(Arc::clone(&self.responses));
        info!(
            initiator = %initiator,
            recipient = %recipient,
            kind = kind.as_str(),
            group_id = %context.group_id,
            "Proposal opened"
        );

        let outcome = await_response(receiver, self.settings.proposal_timeout()).await;

        if outcome == ProposalOutcome::Accepted {
            // State may have moved on while we waited
            self.validate_edge(edge, context.group_id).await?;
            self.commit_edge(edge, context.group_id).await?;
        }

        drop(ticket);
        info!(
            initiator = %initiator,
            recipient = %recipient,
            kind = kind.as_str(),
            ?outcome,
            "Proposal settled"
        );
        Ok(outcome)
    }

    /// Ask `child` to accept `parent` as their parent
    pub async fn adopt(
        &self,
        parent: UserId,
        child: UserId,
        context: ProposalContext,
    ) -> Result<ProposalOutcome, CoreError> {
        self.run_proposal(ProposalKind::Adoption, parent, child, context)
            .await
    }

    /// Ask `parent` to accept `child` as their child
    pub async fn request_parent(
        &self,
        child: UserId,
        parent: UserId,
        context: ProposalContext,
    ) -> Result<ProposalOutcome, CoreError> {
        self.run_proposal(ProposalKind::ParentRequest, child, parent, context)
            .await
    }

    /// Ask `b` to become `a`'s partner
    pub async fn propose_union(
        &self,
        a: UserId,
        b: UserId,
        context: ProposalContext,
    ) -> Result<ProposalOutcome, CoreError> {
        self.run_proposal(ProposalKind::Union, a, b, context).await
    }

    /// Answer the proposal waiting on `recipient`
    pub fn respond(&self, recipient: UserId, channel_id: u64, reply: ProposalReply) -> Result<(), CoreError> {
        if reply == ProposalReply::Cancel {
            return Err(CoreError::ValidationError(
                "Only the initiator can cancel a proposal".to_string(),
            ));
        }
        self.responses.deliver(recipient, channel_id, reply)
    }

    /// Withdraw the proposal started by `initiator`
    pub fn cancel(&self, initiator: UserId) -> Result<(), CoreError> {
        let record = self
            .registry
            .lookup(initiator)
            .filter(|record| record.role == ProposalRole::Initiator)
            .ok_or(CoreError::ProposalNotFound(initiator))?;

        if !self.responses.cancel(record.counterpart) {
            return Err(CoreError::ProposalNotFound(initiator));
        }
        debug!(initiator = %initiator, recipient = %record.counterpart, "Proposal cancelled");
        Ok(())
    }

    // Direct mutations

    /// Remove `user_id`'s partner edge
    pub async fn dissolve_union(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        let partner = self.get(user_id, group_id).await?.partner_id.ok_or_else(|| {
            CoreError::ValidationError(format!("User {} has no partner", user_id))
        })?;
        self.get(partner, group_id).await?;

        self.repository
            .delete_partner_edge(user_id, partner, group_id)
            .await?;

        self.change(Self::key(user_id, group_id), |entity| {
            if entity.partner_id == Some(partner) {
                entity.partner_id = None;
            }
        });
        self.change(Self::key(partner, group_id), |entity| {
            if entity.partner_id == Some(user_id) {
                entity.partner_id = None;
            }
        });
        info!(user_id = %user_id, partner = %partner, group_id = %group_id, "Union dissolved");
        self.settle(vec![Self::key(user_id, group_id), Self::key(partner, group_id)])
            .await
    }

    /// Remove `child` from `parent`'s children
    pub async fn disown(
        &self,
        parent: UserId,
        child: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        if !self.get(parent, group_id).await?.children.contains(&child) {
            return Err(CoreError::ValidationError(format!(
                "User {} is not a child of {}",
                child, parent
            )));
        }

        self.remove_parent_edge(parent, child, group_id).await
    }

    /// Remove `child`'s parent edge
    pub async fn emancipate(
        &self,
        child: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        let parent = self.get(child, group_id).await?.parent_id.ok_or_else(|| {
            CoreError::ValidationError(format!("User {} has no parent", child))
        })?;
        self.get(parent, group_id).await?;

        self.remove_parent_edge(parent, child, group_id).await
    }

    async fn remove_parent_edge(
        &self,
        parent: UserId,
        child: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        self.get(child, group_id).await?;

        self.repository
            .delete_parent_edge(parent, child, group_id)
            .await?;

        self.change(Self::key(parent, group_id), |entity| {
            entity.children.remove(&child);
        });
        self.change(Self::key(child, group_id), |entity| {
            if entity.parent_id == Some(parent) {
                entity.parent_id = None;
            }
        });
        info!(parent = %parent, child = %child, group_id = %group_id, "Parent edge removed");
        self.settle(vec![Self::key(child, group_id), Self::key(parent, group_id)])
            .await
    }

    // Administrative

    /// Partner two members without asking
    pub async fn force_union(
        &self,
        a: UserId,
        b: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        let edge = ProposedEdge::Partner(a, b);
        self.validate_edge(edge, group_id).await?;
        warn!(a = %a, b = %b, group_id = %group_id, "Forcing union");
        self.commit_edge(edge, group_id).await
    }

    /// Make `parent` the parent of `child` without asking
    pub async fn force_adopt(
        &self,
        parent: UserId,
        child: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        let edge = ProposedEdge::Parent { parent, child };
        self.validate_edge(edge, group_id).await?;
        warn!(parent = %parent, child = %child, group_id = %group_id, "Forcing adoption");
        self.commit_edge(edge, group_id).await
    }

    /// Remove `child`'s parent edge on an operator's behalf
    pub async fn force_emancipate(
        &self,
        child: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        warn!(child = %child, group_id = %group_id, "Forcing emancipation");
        self.emancipate(child, group_id).await
    }

    /// Remove `user_id`'s partner edge on an operator's behalf
    pub async fn force_dissolve_union(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<Vec<RelationshipEntity>, CoreError> {
        warn!(user_id = %user_id, group_id = %group_id, "Forcing divorce");
        self.dissolve_union(user_id, group_id).await
    }

    /// Re-read a member from the durable store and publish the result
    pub async fn recache(&self, user_id: UserId, group_id: GroupId) -> Result<RelationshipEntity, CoreError> {
        let key = Self::key(user_id, group_id);
        let entity = self.repository.load_entity(key).await?;
        self.cache.apply(entity.to_update());
        debug!(key = %key, "Recached entity");

        let mut settled = self.settle(vec![key]).await?;
        Ok(settled.pop().unwrap_or(entity))
    }

    /// Recache the member, then every member of their whole tree
    pub async fn recache_family(&self, user_id: UserId, group_id: GroupId) -> Result<usize, CoreError> {
        self.recache(user_id, group_id).await?;
        let members = self.span(user_id, group_id, SpanOptions::whole_tree()).await?;

        for member in members.iter().filter(|member| **member != user_id) {
            self.recache(*member, group_id).await?;
        }
        info!(user_id = %user_id, group_id = %group_id, members = members.len(), "Recached family");
        Ok(members.len())
    }

    /// Drop a member from this process's cache and ask every other process to do the same
    pub async fn evict(&self, user_id: UserId, group_id: Option<GroupId>) -> Result<usize, CoreError> {
        let removed = match group_id {
            Some(group_id) => usize::from(self.cache.evict(Self::key(user_id, group_id))),
            None => self.cache.evict_user(user_id),
        };

        self.replicator
            .publish_eviction(&EntityEviction { id: user_id, group_id })
            .await?;
        info!(user_id = %user_id, ?group_id, removed, "Evicted member");
        Ok(removed)
    }

    /// Durable store and channel health
    pub async fn health_check(&self) -> Result<bool, CoreError> {
        let store = self.repository.health_check().await?;
        let channel = self.replicator.channel().health_check().await?;
        Ok(store && channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::replication::memory::MemoryReplicationHub;
    use crate::domain::replication::ENTITY_UPDATE_TOPIC;
    use crate::domain::entity::EntityUpdate;
    use crate::domain::repository::memory::MemoryFamilyRepository;
    use async_trait::async_trait;
    use std::time::Duration;

    const GROUP: GroupId = GroupId(1);

    /// Store whose parent writes take a while to land
    struct SlowParentWrites {
        inner: MemoryFamilyRepository,
        delay: Duration,
    }

    #[async_trait]
    impl FamilyRepository for SlowParentWrites {
        async fn find_parent(&self, child: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError> {
            self.inner.find_parent(child, group_id).await
        }

        async fn find_children(&self, parent: UserId, group_id: GroupId) -> Result<Vec<UserId>, CoreError> {
            self.inner.find_children(parent, group_id).await
        }

        async fn find_partner(&self, user: UserId, group_id: GroupId) -> Result<Option<UserId>, CoreError> {
            self.inner.find_partner(user, group_id).await
        }

        async fn insert_parent_edge(&self, parent: UserId, child: UserId, group_id: GroupId) -> Result<(), CoreError> {
            tokio::time::sleep(self.delay).await;
            self.inner.insert_parent_edge(parent, child, group_id).await
        }

        async fn delete_parent_edge(&self, parent: UserId, child: UserId, group_id: GroupId) -> Result<(), CoreError> {
            self.inner.delete_parent_edge(parent, child, group_id).await
        }

        async fn insert_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
            self.inner.insert_partner_edge(a, b, group_id).await
        }

        async fn delete_partner_edge(&self, a: UserId, b: UserId, group_id: GroupId) -> Result<(), CoreError> {
            self.inner.delete_partner_edge(a, b, group_id).await
        }
    }

    fn service_with(settings: FamilySettings) -> (Arc<FamilyService>, MemoryFamilyRepository, MemoryReplicationHub) {
        let repo = MemoryFamilyRepository::new();
        let hub = MemoryReplicationHub::new();
        let service = FamilyService::with_repository(Arc::new(repo.clone()), Arc::new(hub.clone()), settings);
        (Arc::new(service), repo, hub)
    }

    fn service() -> (Arc<FamilyService>, MemoryFamilyRepository, MemoryReplicationHub) {
        service_with(FamilySettings::default())
    }

    fn context() -> ProposalContext {
        ProposalContext {
            group_id: GROUP,
            channel_id: 500,
        }
    }

    async fn wait_for_slot(service: &FamilyService, user_id: UserId) {
        for _ in 0..100 {
            if service.lookup_proposal(user_id).is_some() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("proposal for {} never opened", user_id);
    }

    #[tokio::test]
    async fn test_force_adopt_writes_then_publishes_both_sides() -> Result<(), CoreError> {
        let (service, repo, hub) = service();
        service.force_adopt(UserId(1), UserId(2), GROUP).await?;

        assert_eq!(repo.find_parent(UserId(2), GROUP).await?, Some(UserId(1)));
        assert_eq!(service.get(UserId(2), GROUP).await?.parent_id, Some(UserId(1)));
        assert!(service.get(UserId(1), GROUP).await?.children.contains(&UserId(2)));

        let published = hub.published();
        assert_eq!(published.len(), 2);
        assert!(published.iter().all(|message| message.topic == ENTITY_UPDATE_TOPIC));
        Ok(())
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_and_channel_untouched() -> Result<(), CoreError> {
        let (service, repo, hub) = service();
        service.get(UserId(1), GROUP).await?;
        service.get(UserId(2), GROUP).await?;

        repo.set_unavailable(true);
        let result = service.force_union(UserId(1), UserId(2), GROUP).await;
        assert!(matches!(result, Err(CoreError::StateStoreError(_))));

        assert!(service.cache().peek(EntityKey::new(UserId(1), GROUP)).unwrap().is_empty());
        assert!(hub.published().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_publish_failure_keeps_committed_state() -> Result<(), CoreError> {
        let (service, repo, hub) = service();
        hub.set_unavailable(true);

        let result = service.force_union(UserId(1), UserId(2), GROUP).await;
        assert!(matches!(result, Err(CoreError::ReplicationError(_))));
        assert_eq!(repo.find_partner(UserId(1), GROUP).await?, Some(UserId(2)));
        assert_eq!(service.get(UserId(2), GROUP).await?.partner_id, Some(UserId(1)));
        Ok(())
    }

    #[tokio::test]
    async fn test_union_rejected_between_relatives() -> Result<(), CoreError> {
        let (service, _, _) = service();
        service.force_adopt(UserId(1), UserId(2), GROUP).await?;
        service.force_adopt(UserId(1), UserId(3), GROUP).await?;

        let result = service.force_union(UserId(2), UserId(3), GROUP).await;
        assert!(matches!(result, Err(CoreError::ValidationError(_))));

        let (permissive, _, _) = service_with(FamilySettings {
            allow_incest: true,
            ..FamilySettings::default()
        });
        permissive.force_adopt(UserId(1), UserId(2), GROUP).await?;
        permissive.force_adopt(UserId(1), UserId(3), GROUP).await?;
        permissive.force_union(UserId(2), UserId(3), GROUP).await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_parent_edge_checks() -> Result<(), CoreError> {
        let (service, _, _) = service_with(FamilySettings {
            max_children: 2,
            ..FamilySettings::default()
        });
        service.force_adopt(UserId(1), UserId(2), GROUP).await?;
        service.force_adopt(UserId(2), UserId(3), GROUP).await?;

        let cases = vec![
            (UserId(4), UserId(4)),
            (UserId(4), UserId(2)),
            (UserId(3), UserId(1)),
        ];
        for (parent, child) in cases {
            let result = service.force_adopt(parent, child, GROUP).await;
            assert!(matches!(result, Err(CoreError::ValidationError(_))), "{} -> {}", parent, child);
        }

        service.force_adopt(UserId(1), UserId(5), GROUP).await?;
        let full = service.force_adopt(UserId(1), UserId(6), GROUP).await;
        assert!(matches!(full, Err(CoreError::ValidationError(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_family_limit() -> Result<(), CoreError> {
        let (service, _, _) = service_with(FamilySettings {
            max_family_members: 3,
            ..FamilySettings::default()
        });
        service.force_adopt(UserId(1), UserId(2), GROUP).await?;
        service.force_adopt(UserId(1), UserId(3), GROUP).await?;

        let result = service.force_union(UserId(3), UserId(9), GROUP).await;
        assert!(matches!(result, Err(CoreError::ValidationError(_))));
        assert_eq!(service.family_size(UserId(2), GROUP).await?, 3);
        Ok(())
    }

    #[tokio::test]
    async fn test_removals() -> Result<(), CoreError> {
        let (service, repo, _) = service();
        service.force_adopt(UserId(1), UserId(2), GROUP).await?;
        service.force_adopt(UserId(1), UserId(3), GROUP).await?;
        service.force_union(UserId(1), UserId(9), GROUP).await?;

        service.disown(UserId(1), UserId(2), GROUP).await?;
        assert_eq!(service.get(UserId(2), GROUP).await?.parent_id, None);
        assert!(matches!(
            service.disown(UserId(1), UserId(2), GROUP).await,
            Err(CoreError::ValidationError(_))
        ));

        service.emancipate(UserId(3), GROUP).await?;
        assert!(service.get(UserId(1), GROUP).await?.children.is_empty());
        assert_eq!(repo.find_children(UserId(1), GROUP).await?, Vec::<UserId>::new());

        service.dissolve_union(UserId(9), GROUP).await?;
        assert_eq!(service.get(UserId(1), GROUP).await?.partner_id, None);
        assert!(matches!(
            service.dissolve_union(UserId(9), GROUP).await,
            Err(CoreError::ValidationError(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_proposal_accept_commits() -> Result<(), CoreError> {
        let (service, _, _) = service();
        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.propose_union(UserId(1), UserId(2), context()).await })
        };

        wait_for_slot(&service, UserId(2)).await;
        assert!(matches!(
            service.propose_union(UserId(3), UserId(2), context()).await,
            Err(CoreError::AlreadyReserved(UserId(2)))
        ));

        service.respond(UserId(2), 500, ProposalReply::Accept)?;
        assert_eq!(runner.await.unwrap()?, ProposalOutcome::Accepted);
        assert_eq!(service.get(UserId(1), GROUP).await?.partner_id, Some(UserId(2)));
        assert!(service.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_proposal_decline_and_cancel_leave_graph_alone() -> Result<(), CoreError> {
        let (service, repo, _) = service();

        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.adopt(UserId(1), UserId(2), context()).await })
        };
        wait_for_slot(&service, UserId(2)).await;
        service.respond(UserId(2), 500, ProposalReply::Decline)?;
        assert_eq!(runner.await.unwrap()?, ProposalOutcome::Rejected);

        let runner = {
            let service = service.clone();
            tokio::spawn(async move { service.request_parent(UserId(2), UserId(1), context()).await })
        };
        wait_for_slot(&service, UserId(1)).await;
        assert!(matches!(service.cancel(UserId(1)), Err(CoreError::ProposalNotFound(_))));
        service.cancel(UserId(2))?;
        assert_eq!(runner.await.unwrap()?, ProposalOutcome::Cancelled);

        assert_eq!(repo.write_count(), 0);
        assert!(service.registry().is_empty());
        Ok(())
    }

    #[tokio::test]
    async fn test_proposal_timeout_frees_slots() -> Result<(), CoreError> {
        let (service, _, _) = service_with(FamilySettings {
            proposal_timeout_secs: 1,
            ..FamilySettings::default()
        });

        let outcome = service.propose_union(UserId(1), UserId(2), context()).await?;
        assert_eq!(outcome, ProposalOutcome::TimedOut);
        assert!(service.registry().is_empty());
        assert!(matches!(
            service.respond(UserId(2), 500, ProposalReply::Accept),
            Err(CoreError::ProposalNotFound(_))
        ));
        Ok(())
    }

    #[tokio::test]
    async fn test_recache_and_evict() -> Result<(), CoreError> {
        let (service, repo, hub) = service();
        service.get(UserId(2), GROUP).await?;
        repo.insert_parent_edge(UserId(1), UserId(2), GROUP).await?;
        assert_eq!(service.get(UserId(2), GROUP).await?.parent_id, None);

        let entity = service.recache(UserId(2), GROUP).await?;
        assert_eq!(entity.parent_id, Some(UserId(1)));
        assert_eq!(service.get(UserId(2), GROUP).await?.parent_id, Some(UserId(1)));

        assert_eq!(service.recache_family(UserId(2), GROUP).await?, 2);

        assert_eq!(service.evict(UserId(2), None).await?, 1);
        assert!(!service.cache().contains(EntityKey::new(UserId(2), GROUP)));
        assert_eq!(hub.published().last().map(|m| m.topic.as_str()), Some("TreeMemberEvict"));
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_adoptions_keep_every_child() -> Result<(), CoreError> {
        let repo = MemoryFamilyRepository::new();
        let hub = MemoryReplicationHub::new();
        let slow = SlowParentWrites {
            inner: repo.clone(),
            delay: Duration::from_millis(50),
        };
        let service = FamilyService::with_repository(Arc::new(slow), Arc::new(hub.clone()), FamilySettings::default());

        let (first, second) = tokio::join!(
            service.force_adopt(UserId(1), UserId(2), GROUP),
            service.force_adopt(UserId(1), UserId(3), GROUP),
        );
        first?;
        second?;

        let expected: HashSet<UserId> = [UserId(2), UserId(3)].into_iter().collect();
        let durable: HashSet<UserId> = repo.find_children(UserId(1), GROUP).await?.into_iter().collect();
        assert_eq!(durable, expected);
        let cached: HashSet<UserId> = service.get(UserId(1), GROUP).await?.children.into_iter().collect();
        assert_eq!(cached, expected);

        let last_parent_snapshot = hub
            .published()
            .into_iter()
            .filter(|message| message.topic == ENTITY_UPDATE_TOPIC)
            .filter_map(|message| serde_json::from_str::<EntityUpdate>(&message.payload).ok())
            .filter(|update| update.id == UserId(1))
            .last()
            .expect("parent snapshot published");
        assert_eq!(last_parent_snapshot.children.into_iter().collect::<HashSet<_>>(), expected);
        Ok(())
    }

    #[tokio::test]
    async fn test_aborted_proposal_discards_reply_slot() -> Result<(), CoreError> {
        let (service, _, _) = service();
        let task = {
            let service = Arc::clone(&service);
            tokio::spawn(async move { service.propose_union(UserId(1), UserId(2), context()).await })
        };
        wait_for_slot(&service, UserId(2)).await;
        assert!(service.responses().is_pending(UserId(2)));

        task.abort();
        assert!(task.await.unwrap_err().is_cancelled());

        assert!(!service.responses().is_pending(UserId(2)));
        assert!(service.registry().is_empty());
        assert!(matches!(
            service.respond(UserId(2), 500, ProposalReply::Accept),
            Err(CoreError::ProposalNotFound(_))
        ));
        Ok(())
    }
}
