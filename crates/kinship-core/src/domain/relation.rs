//! Relationship descriptions produced by the traversal engine
//!
//! Every description is written from the first member's side: in
//! `relation(a, b)` a [`Kinship::Ancestor`] means `a` is `b`'s ancestor.
//! [`Relation::inverse`] gives the same pair described from the other side.

use serde::{Deserialize, Serialize};

use super::entity::UserId;

/// A blood relation through a lowest common ancestor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BloodRelation {
    /// Lowest ancestor shared by both members
    pub common_ancestor: UserId,
    /// Generations from the first and second member up to the common ancestor
    pub distances: (usize, usize),
}

/// Named kinship derived from the two distances
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Kinship {
    /// Both sides are the same member
    Same,
    /// First member is an ancestor of the second
    Ancestor {
        /// 1 = parent, 2 = grandparent, ...
        generations: usize,
    },
    /// First member is a descendant of the second
    Descendant {
        /// 1 = child, 2 = grandchild, ...
        generations: usize,
    },
    /// Both members share a parent
    Sibling,
    /// First member is a sibling of one of the second's ancestors
    AuntOrUncle {
        /// 0 = aunt or uncle, 1 = great-aunt or great-uncle, ...
        greats: usize,
    },
    /// First member descends from a sibling of the second
    NieceOrNephew {
        /// 0 = niece or nephew, 1 = great-niece or great-nephew, ...
        greats: usize,
    },
    /// Both members are at least two generations below the common ancestor
    Cousin {
        /// 1 = first cousin, 2 = second cousin, ...
        degree: usize,
        /// Generational gap between the two members
        removed: usize,
    },
}

impl BloodRelation {
    /// Relation of a member to itself
    pub fn same(user_id: UserId) -> Self {
        Self {
            common_ancestor: user_id,
            distances: (0, 0),
        }
    }

    /// The same relation seen from the second member
    pub fn inverse(&self) -> Self {
        Self {
            common_ancestor: self.common_ancestor,
            distances: (self.distances.1, self.distances.0),
        }
    }

    /// Civil degree of kinship: the number of parent/child edges between the two
    pub fn degree(&self) -> usize {
        self.distances.0 + self.distances.1
    }

    /// Classify the distance pair
    pub fn kinship(&self) -> Kinship {
        match self.distances {
            (0, 0) => Kinship::Same,
            (0, n) => Kinship::Ancestor { generations: n },
            (n, 0) => Kinship::Descendant { generations: n },
            (1, 1) => Kinship::Sibling,
            (1, n) => Kinship::AuntOrUncle { greats: n - 2 },
            (n, 1) => Kinship::NieceOrNephew { greats: n - 2 },
            (a, b) => Kinship::Cousin {
                degree: a.min(b) - 1,
                removed: a.abs_diff(b),
            },
        }
    }
}

impl Kinship {
    /// Human-readable label from the first member's side
    pub fn label(&self) -> String {
        match *self {
            Kinship::Same => "same person".to_string(),
            Kinship::Ancestor { generations } => lineal(generations, "parent"),
            Kinship::Descendant { generations } => lineal(generations, "child"),
            Kinship::Sibling => "sibling".to_string(),
            Kinship::AuntOrUncle { greats } => format!("{}aunt or uncle", "great-".repeat(greats)),
            Kinship::NieceOrNephew { greats } => {
                format!("{}niece or nephew", "great-".repeat(greats))
            }
            Kinship::Cousin { degree, removed } => {
                let base = format!("{} cousin", ordinal(degree));
                match removed {
                    0 => base,
                    1 => format!("{} once removed", base),
                    2 => format!("{} twice removed", base),
                    n => format!("{} {} times removed", base, n),
                }
            }
        }
    }
}

fn lineal(generations: usize, noun: &str) -> String {
    match generations {
        1 => noun.to_string(),
        2 => format!("grand{}", noun),
        n => format!("{}grand{}", "great-".repeat(n - 2), noun),
    }
}

fn ordinal(n: usize) -> String {
    match n {
        1 => "first".to_string(),
        2 => "second".to_string(),
        3 => "third".to_string(),
        4 => "fourth".to_string(),
        5 => "fifth".to_string(),
        n => format!("{}th", n),
    }
}

/// Which member's partner links an in-law relation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InLawSide {
    /// The first member's partner is blood-related to the second member
    Own,
    /// The first member is blood-related to the second member's partner
    Counterpart,
}

/// A relation mediated by one partner edge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct InLawRelation {
    /// The partner through whom the relation runs
    pub via: UserId,
    /// Whose partner `via` is
    pub side: InLawSide,
    /// Blood relation between the two members joined through `via`, from the first side
    pub blood: BloodRelation,
}

/// How two members of one group are related
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Relation {
    /// Shared ancestry
    Blood(BloodRelation),
    /// The two members are partners of each other
    Partner,
    /// Related through one member's partner
    InLaw(InLawRelation),
    /// No common ancestor and no partner-mediated link
    Unrelated,
}

impl Relation {
    /// The same pair described from the second member's side
    pub fn inverse(&self) -> Relation {
        match self {
            Relation::Blood(blood) => Relation::Blood(blood.inverse()),
            Relation::InLaw(in_law) => Relation::InLaw(InLawRelation {
                via: in_law.via,
                side: match in_law.side {
                    InLawSide::Own => InLawSide::Counterpart,
                    InLawSide::Counterpart => InLawSide::Own,
                },
                blood: in_law.blood.inverse(),
            }),
            other => *other,
        }
    }

    /// Whether any relation was found
    pub fn is_related(&self) -> bool {
        !matches!(self, Relation::Unrelated)
    }

    /// Whether both sides are the same member
    pub fn is_same(&self) -> bool {
        matches!(self, Relation::Blood(blood) if blood.distances == (0, 0))
    }

    /// Civil degree of the underlying blood relation, if there is one
    pub fn degree(&self) -> Option<usize> {
        match self {
            Relation::Blood(blood) => Some(blood.degree()),
            Relation::InLaw(in_law) => Some(in_law.blood.degree()),
            Relation::Partner | Relation::Unrelated => None,
        }
    }

    /// Human-readable label from the first member's side
    pub fn label(&self) -> String {
        match self {
            Relation::Blood(blood) => blood.kinship().label(),
            Relation::Partner => "partner".to_string(),
            Relation::InLaw(in_law) => format!("{}-in-law", in_law.blood.kinship().label()),
            Relation::Unrelated => "unrelated".to_string(),
        }
    }
}
