//! Relationship entity model
//!
//! A [`RelationshipEntity`] is one identity's view of its family edges inside one
//! group. Edges are stored as plain identity keys and resolved through the
//! entity cache on demand, so malformed data can at worst produce a logical loop,
//! never an ownership cycle.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Identity key of a member
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UserId(pub u64);

/// Scoping key of a family graph (a server or tenant)
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct GroupId(pub u64);

impl GroupId {
    /// The group shared by every server that has no private tree
    pub const GLOBAL: GroupId = GroupId(0);
}

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Unique key of a cached entity
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Member identity
    pub user_id: UserId,
    /// Group the member's edges live in
    pub group_id: GroupId,
}

impl EntityKey {
    /// Create a key
    pub fn new(user_id: UserId, group_id: GroupId) -> Self {
        Self { user_id, group_id }
    }

    /// Key of another member in the same group
    pub fn sibling(&self, user_id: UserId) -> Self {
        Self {
            user_id,
            group_id: self.group_id,
        }
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.user_id, self.group_id)
    }
}

/// One member's relationship state within one group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipEntity {
    /// Member identity
    pub id: UserId,
    /// Group scope
    pub group_id: GroupId,
    /// Recorded parent, if any
    pub parent_id: Option<UserId>,
    /// Recorded children
    pub children: BTreeSet<UserId>,
    /// Recorded partner, if any
    pub partner_id: Option<UserId>,
}

impl RelationshipEntity {
    /// An entity with no edges
    pub fn empty(key: EntityKey) -> Self {
        Self {
            id: key.user_id,
            group_id: key.group_id,
            parent_id: None,
            children: BTreeSet::new(),
            partner_id: None,
        }
    }

    /// The entity's cache key
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.id, self.group_id)
    }

    /// Whether the entity carries no edges at all
    pub fn is_empty(&self) -> bool {
        self.parent_id.is_none() && self.children.is_empty() && self.partner_id.is_none()
    }

    /// Drop any edge that points back at the entity itself
    pub fn without_self_references(mut self) -> Self {
        if self.parent_id == Some(self.id) {
            self.parent_id = None;
        }
        if self.partner_id == Some(self.id) {
            self.partner_id = None;
        }
        self.children.remove(&self.id);
        self
    }

    /// Wire snapshot of this entity
    pub fn to_update(&self) -> EntityUpdate {
        EntityUpdate::from(self.clone())
    }
}

/// Full-state snapshot published on the replication channel
///
/// Consumers apply it as an overwrite, never as a diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityUpdate {
    /// Member identity
    pub id: UserId,
    /// Group scope
    pub group_id: GroupId,
    /// Parent, `null` when absent
    pub parent_id: Option<UserId>,
    /// Children
    #[serde(default)]
    pub children: Vec<UserId>,
    /// Partner, `null` when absent
    pub partner_id: Option<UserId>,
}

impl EntityUpdate {
    /// The key this snapshot overwrites
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.id, self.group_id)
    }
}

impl From<RelationshipEntity> for EntityUpdate {
    fn from(entity: RelationshipEntity) -> Self {
        Self {
            id: entity.id,
            group_id: entity.group_id,
            parent_id: entity.parent_id,
            children: entity.children.into_iter().collect(),
            partner_id: entity.partner_id,
        }
    }
}

impl From<EntityUpdate> for RelationshipEntity {
    fn from(update: EntityUpdate) -> Self {
        RelationshipEntity {
            id: update.id,
            group_id: update.group_id,
            parent_id: update.parent_id,
            children: update.children.into_iter().collect(),
            partner_id: update.partner_id,
        }
        .without_self_references()
    }
}

/// Administrative request to drop a member from every process's cache
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityEviction {
    /// Member identity
    pub id: UserId,
    /// Restrict to one group; `None` evicts the member from every group
    #[serde(default)]
    pub group_id: Option<GroupId>,
}
