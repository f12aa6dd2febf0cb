//! Graph traversal engine
//!
//! Read-only walks over the entity cache. Identity keys that are not cached
//! resolve to the empty entity, so a walk never waits on the durable store.
//! Every walk is bounded twice: by a visited set and by `max_depth` nodes. Either
//! bound tripping yields [`CoreError::CycleDetected`].

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};

use super::entity_cache::EntityCache;
use crate::domain::entity::{EntityKey, GroupId, RelationshipEntity, UserId};
use crate::domain::relation::{BloodRelation, InLawRelation, InLawSide, Relation};
use crate::CoreError;

/// Which part of the graph a span covers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpanOptions {
    /// Start from the root of the member's tree instead of the member
    #[serde(default)]
    pub expand_upwards: bool,
    /// Include the member's immediate parent node
    #[serde(default)]
    pub add_parent: bool,
}

impl SpanOptions {
    /// The member's whole tree
    pub fn whole_tree() -> Self {
        Self {
            expand_upwards: true,
            add_parent: true,
        }
    }
}

/// A read view of one group's graph
pub struct FamilyGraph<'a> {
    cache: &'a EntityCache,
    group_id: GroupId,
    max_depth: usize,
}

struct Frame {
    user_id: UserId,
    children: Vec<UserId>,
    next: usize,
}

impl<'a> FamilyGraph<'a> {
    /// View `group_id` through `cache`, visiting at most `max_depth` nodes per walk
    pub fn new(cache: &'a EntityCache, group_id: GroupId, max_depth: usize) -> Self {
        Self {
            cache,
            group_id,
            max_depth: max_depth.max(1),
        }
    }

    /// Group this view covers
    pub fn group_id(&self) -> GroupId {
        self.group_id
    }

    /// Cached entity, or the empty entity when the key is not cached
    pub fn entity(&self, user_id: UserId) -> RelationshipEntity {
        let key = EntityKey::new(user_id, self.group_id);
        self.cache
            .peek(key)
            .map(RelationshipEntity::without_self_references)
            .unwrap_or_else(|| RelationshipEntity::empty(key))
    }

    fn parent_of(&self, user_id: UserId) -> Option<UserId> {
        self.entity(user_id).parent_id
    }

    fn partner_of(&self, user_id: UserId) -> Option<UserId> {
        self.entity(user_id).partner_id
    }

    fn cycle(&self, user_id: UserId, visited: usize) -> CoreError {
        CoreError::CycleDetected {
            user_id,
            group_id: self.group_id,
            visited,
        }
    }

    /// The member followed by each ancestor up to the root
    pub fn ancestors(&self, user_id: UserId) -> Result<Vec<UserId>, CoreError> {
        let mut chain = vec![user_id];
        let mut seen = HashSet::from([user_id]);
        let mut current = user_id;

        while let Some(parent) = self.parent_of(current) {
            if !seen.insert(parent) || chain.len() >= self.max_depth {
                return Err(self.cycle(parent, chain.len()));
            }
            chain.push(parent);
            current = parent;
        }

        Ok(chain)
    }

    /// The parentless ancestor at the top of the member's tree
    pub fn root(&self, user_id: UserId) -> Result<UserId, CoreError> {
        let chain = self.ancestors(user_id)?;
        Ok(chain.last().copied().unwrap_or(user_id))
    }

    /// Members reachable over parent/child edges, without duplicates, in walk order
    pub fn span(&self, user_id: UserId, options: SpanOptions) -> Result<Vec<UserId>, CoreError> {
        let start = if options.expand_upwards {
            self.root(user_id)?
        } else {
            user_id
        };

        let mut members = self.descend(start)?;

        if options.add_parent && !options.expand_upwards {
            if let Some(parent) = self.parent_of(user_id) {
                if !members.contains(&parent) {
                    members.push(parent);
                }
            }
        }

        Ok(members)
    }

    /// Depth-first walk down the children edges of `start`
    ///
    /// Reaching a member that is already on the current path is a loop;
    /// reaching one that was finished on another branch is a convergent path
    /// and is skipped.
    fn descend(&self, start: UserId) -> Result<Vec<UserId>, CoreError> {
        let mut members = vec![start];
        let mut visited = HashSet::from([start]);
        let mut on_path = HashSet::from([start]);
        let mut stack = vec![Frame {
            user_id: start,
            children: self.entity(start).children.into_iter().collect(),
            next: 0,
        }];

        while let Some(frame) = stack.last_mut() {
            if frame.next >= frame.children.len() {
                on_path.remove(&frame.user_id);
                stack.pop();
                continue;
            }

            let child = frame.children[frame.next];
            frame.next += 1;

            if on_path.contains(&child) {
                return Err(self.cycle(child, visited.len()));
            }
            if !visited.insert(child) {
                continue;
            }
            if visited.len() > self.max_depth {
                return Err(self.cycle(child, visited.len()));
            }

            members.push(child);
            on_path.insert(child);
            stack.push(Frame {
                user_id: child,
                children: self.entity(child).children.into_iter().collect(),
                next: 0,
            });
        }

        Ok(members)
    }

    /// Members of the whole tree plus every member's partner
    pub fn family_size(&self, user_id: UserId) -> Result<usize, CoreError> {
        let members = self.span(user_id, SpanOptions::whole_tree())?;
        let mut family: HashSet<UserId> = members.iter().copied().collect();
        for member in &members {
            if let Some(partner) = self.partner_of(*member) {
                family.insert(partner);
            }
        }
        Ok(family.len())
    }

    /// Blood relation through the lowest common ancestor, if any
    pub fn blood_relation(&self, a: UserId, b: UserId) -> Result<Option<BloodRelation>, CoreError> {
        let chain_a = self.ancestors(a)?;
        let chain_b = self.ancestors(b)?;

        let positions: HashMap<UserId, usize> = chain_b
            .iter()
            .enumerate()
            .map(|(distance, user)| (*user, distance))
            .collect();

        Ok(chain_a.iter().enumerate().find_map(|(distance_a, user)| {
            positions.get(user).map(|distance_b| BloodRelation {
                common_ancestor: *user,
                distances: (distance_a, *distance_b),
            })
        }))
    }

    /// How `a` is related to `b`, described from `a`'s side
    ///
    /// `relation(a, b)` is always `relation(b, a).inverse()`. When both an own
    /// and a counterpart in-law link exist, the closer one wins and ties go to
    /// the lower partner id, which is the same choice from either side.
    pub fn relation(&self, a: UserId, b: UserId) -> Result<Relation, CoreError> {
        if a == b {
            return Ok(Relation::Blood(BloodRelation::same(a)));
        }

        if let Some(blood) = self.blood_relation(a, b)? {
            return Ok(Relation::Blood(blood));
        }

        let partner_a = self.partner_of(a);
        let partner_b = self.partner_of(b);
        if partner_a == Some(b) || partner_b == Some(a) {
            return Ok(Relation::Partner);
        }

        let mut candidates = Vec::with_capacity(2);
        if let Some(via) = partner_a {
            if let Some(blood) = self.blood_relation(via, b)? {
                candidates.push(InLawRelation {
                    via,
                    side: InLawSide::Own,
                    blood,
                });
            }
        }
        if let Some(via) = partner_b {
            if let Some(blood) = self.blood_relation(a, via)? {
                candidates.push(InLawRelation {
                    via,
                    side: InLawSide::Counterpart,
                    blood,
                });
            }
        }

        Ok(candidates
            .into_iter()
            .min_by_key(|candidate| (candidate.blood.degree(), candidate.via))
            .map(Relation::InLaw)
            .unwrap_or(Relation::Unrelated))
    }
}
