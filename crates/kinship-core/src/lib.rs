//!
//! Kinship Core - family graph runtime
//!
//! This crate holds the relationship entity model, the process-local entity
//! cache, the bounded traversal engine, the proposal registry and the glue that
//! replicates committed entities between processes. Durable storage and the
//! replication transport are traits implemented by sibling crates.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

/// Domain layer - entities, relations, proposals and the store/channel traits
pub mod domain;

/// Application services - cache, traversal, proposals, replication
pub mod application;

/// Family graph tunables
pub mod settings;

/// Error types
pub mod error;

// Re-export key types
pub use error::CoreError;
pub use settings::FamilySettings;

pub use domain::entity::{EntityEviction, EntityKey, EntityUpdate, GroupId, RelationshipEntity, UserId};
pub use domain::proposal::{
    ProposalContext, ProposalKind, ProposalOutcome, ProposalRecord, ProposalReply, ProposalRole,
    ProposedEdge,
};
pub use domain::relation::{BloodRelation, InLawRelation, InLawSide, Kinship, Relation};
pub use domain::replication::{
    ChannelMessage, MessageStream, ReplicationChannel, ENTITY_EVICT_TOPIC, ENTITY_UPDATE_TOPIC,
};
pub use domain::repository::FamilyRepository;

pub use application::entity_cache::{ApplyOutcome, EntityCache};
pub use application::family_service::FamilyService;
pub use application::proposal_registry::{ProposalRegistry, ProposalTicket};
pub use application::replication::{MessageOutcome, Replicator, ResubscribeBackoff};
pub use application::response::{await_response, ResponseRouter};
pub use application::traversal::{FamilyGraph, SpanOptions};
